use anyhow::Context;
use devtunnel_protocol::AgentInfo;
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const PROJECT_FILE: &str = "devtunnel.yaml";

#[derive(Debug, Clone, Deserialize)]
pub struct Development {
    pub port: u16,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BundlerConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Project {
    #[serde(default)]
    pub project_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub development: Option<Development>,
    pub bundler: Option<BundlerConfig>,
    #[serde(default)]
    pub agents: Vec<AgentConfig>,
}

/// A loaded project together with the directory it was resolved from.
#[derive(Debug, Clone)]
pub struct ProjectContext {
    pub dir: PathBuf,
    pub project: Project,
}

impl ProjectContext {
    pub fn load(dir: &Path) -> anyhow::Result<Self> {
        let dir = dir
            .canonicalize()
            .with_context(|| format!("resolve project dir: {}", dir.display()))?;
        let path = dir.join(PROJECT_FILE);
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("read project file: {}", path.display()))?;
        let project: Project = serde_yaml::from_str(&raw)
            .with_context(|| format!("parse project file: {}", path.display()))?;
        if project.development.is_none() {
            anyhow::bail!("development is not enabled for this project (missing `development` in {PROJECT_FILE})");
        }
        Ok(Self { dir, project })
    }

    pub fn development(&self) -> anyhow::Result<&Development> {
        self.project
            .development
            .as_ref()
            .context("development is not enabled for this project")
    }

    pub fn agents(&self) -> Vec<AgentInfo> {
        self.project
            .agents
            .iter()
            .map(|a| AgentInfo {
                name: a.name.clone(),
                id: a.id.clone(),
                description: a.description.clone(),
            })
            .collect()
    }
}
