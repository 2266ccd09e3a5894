use anyhow::Context;
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;

use crate::project::ProjectContext;

#[derive(Debug, Clone)]
pub struct BundleContext {
    pub project_dir: PathBuf,
    pub production: bool,
}

/// Compiles/packages the project before the agent process is launched.
#[async_trait]
pub trait Bundler: Send + Sync {
    async fn bundle(&self, ctx: &BundleContext) -> anyhow::Result<()>;
}

/// Runs the build command declared in the project file, if any.
pub struct CommandBundler {
    command: Option<(String, Vec<String>)>,
}

impl CommandBundler {
    pub fn for_project(project: &ProjectContext) -> Self {
        Self {
            command: project
                .project
                .bundler
                .as_ref()
                .map(|b| (b.command.clone(), b.args.clone())),
        }
    }
}

#[async_trait]
impl Bundler for CommandBundler {
    async fn bundle(&self, ctx: &BundleContext) -> anyhow::Result<()> {
        let Some((command, args)) = &self.command else {
            tracing::debug!("no bundler configured; skipping build");
            return Ok(());
        };
        let started = std::time::Instant::now();
        let status = tokio::process::Command::new(command)
            .args(args)
            .current_dir(&ctx.project_dir)
            .env("DEVTUNNEL_BUNDLE_PRODUCTION", ctx.production.to_string())
            .stdin(Stdio::null())
            .status()
            .await
            .with_context(|| format!("run bundler: {command}"))?;
        if !status.success() {
            anyhow::bail!("bundler {command} exited with {status}");
        }
        tracing::debug!(elapsed_ms = started.elapsed().as_millis() as u64, "bundled");
        Ok(())
    }
}
