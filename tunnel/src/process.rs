//! Supervision of the child process that runs the bundled agent project.
//!
//! `NotStarted → Building → Running → Stopping → Stopped`. The supervisor task
//! owns the child, waits for it to exit, and cancels the session token when it does.

use anyhow::Context;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::bundler::{BundleContext, Bundler};
use crate::project::ProjectContext;

const KILL_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    NotStarted,
    Building,
    Running,
    Stopping,
    Stopped,
}

/// How the `Stopping → Stopped` transition was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    NotRunning,
    AlreadyExited,
    Graceful,
    Killed,
}

#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub dir: PathBuf,
    pub env: Vec<(String, String)>,
}

impl LaunchSpec {
    pub fn for_project(
        project: &ProjectContext,
        port: u16,
        events_file: &Path,
    ) -> anyhow::Result<Self> {
        let dev = project.development()?;
        let env = vec![
            ("PORT".to_string(), port.to_string()),
            ("DEVTUNNEL_SDK_DEV_MODE".to_string(), "true".to_string()),
            (
                "DEVTUNNEL_SDK_DIR".to_string(),
                project.dir.to_string_lossy().to_string(),
            ),
            (
                "DEVTUNNEL_EVENTS_FILE".to_string(),
                events_file.to_string_lossy().to_string(),
            ),
            (
                "DEVTUNNEL_PROJECT_ID".to_string(),
                project.project.project_id.clone(),
            ),
            ("DEVTUNNEL_ENV".to_string(), "development".to_string()),
        ];
        Ok(Self {
            program: dev.command.clone(),
            args: dev.args.clone(),
            dir: project.dir.clone(),
            env,
        })
    }
}

fn port_is_free(port: u16) -> bool {
    port != 0 && std::net::TcpListener::bind(("127.0.0.1", port)).is_ok()
}

/// Configured port if bindable, then `PORT` from the environment, then any free port.
pub fn choose_port(preferred: u16, env_port: Option<u16>) -> anyhow::Result<u16> {
    if port_is_free(preferred) {
        return Ok(preferred);
    }
    if let Some(port) = env_port.filter(|p| port_is_free(*p)) {
        return Ok(port);
    }
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).context("find a free port")?;
    Ok(listener.local_addr()?.port())
}

pub struct ProcessManager {
    launch: LaunchSpec,
    grace: Duration,
    phase: Phase,
    pid: Option<u32>,
    exited: Option<watch::Receiver<bool>>,
    kill: Option<oneshot::Sender<()>>,
}

impl ProcessManager {
    pub fn new(launch: LaunchSpec, grace: Duration) -> Self {
        Self {
            launch,
            grace,
            phase: Phase::NotStarted,
            pid: None,
            exited: None,
            kill: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Runs the development build. A failure ends the lifecycle.
    pub async fn build(&mut self, bundler: &dyn Bundler) -> anyhow::Result<()> {
        if self.phase != Phase::NotStarted {
            anyhow::bail!("build requested in phase {:?}", self.phase);
        }
        self.phase = Phase::Building;
        let ctx = BundleContext {
            project_dir: self.launch.dir.clone(),
            production: false,
        };
        if let Err(err) = bundler.bundle(&ctx).await {
            self.phase = Phase::Stopped;
            return Err(err).context("failed to bundle project");
        }
        Ok(())
    }

    /// Starts the child and its supervisor. `on_exit` is cancelled when the child exits.
    pub fn start(&mut self, on_exit: CancellationToken) -> anyhow::Result<u32> {
        if self.phase != Phase::Building {
            anyhow::bail!("agent process can only start after a build (phase {:?})", self.phase);
        }

        let mut command = tokio::process::Command::new(&self.launch.program);
        command
            .args(&self.launch.args)
            .current_dir(&self.launch.dir)
            .envs(self.launch.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command
            .spawn()
            .with_context(|| format!("failed to start command: {}", self.launch.program))?;
        let pid = child.id().context("agent process has no pid")?;
        tracing::info!(pid, program=%self.launch.program, "agent process started");

        let (exited_tx, exited_rx) = watch::channel(false);
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx => {
                    if let Err(err) = child.start_kill() {
                        tracing::debug!(error=%err, "failed to kill agent process");
                    }
                    child.wait().await
                }
            };
            match status {
                Ok(status) => tracing::info!(status=%status, "agent process exited"),
                Err(err) => tracing::warn!(error=%err, "failed to wait for agent process"),
            }
            on_exit.cancel();
            let _ = exited_tx.send(true);
        });

        self.pid = Some(pid);
        self.exited = Some(exited_rx);
        self.kill = Some(kill_tx);
        self.phase = Phase::Running;
        Ok(pid)
    }

    fn signal_group(&self, force: bool) {
        #[cfg(unix)]
        {
            use nix::sys::signal::{Signal, killpg};
            use nix::unistd::Pid;
            let Some(pid) = self.pid else { return };
            let signal = if force { Signal::SIGKILL } else { Signal::SIGINT };
            if let Err(err) = killpg(Pid::from_raw(pid as i32), signal) {
                tracing::debug!(error=%err, pid, %signal, "failed to signal agent process group");
            }
        }
        #[cfg(not(unix))]
        let _ = force;
    }

    /// Drives `Stopping → Stopped`. With `interrupt`, the process group gets SIGINT first;
    /// the child then has the grace period to exit before it is killed.
    pub async fn stop(&mut self, interrupt: bool) -> StopOutcome {
        let Some(mut exited) = self.exited.take() else {
            self.phase = Phase::Stopped;
            return StopOutcome::NotRunning;
        };
        self.phase = Phase::Stopping;

        if *exited.borrow() {
            self.phase = Phase::Stopped;
            return StopOutcome::AlreadyExited;
        }

        if interrupt {
            tracing::debug!(pid = self.pid, "interrupting agent process");
            self.signal_group(false);
            #[cfg(not(unix))]
            {
                if let Some(kill) = self.kill.take() {
                    let _ = kill.send(());
                }
            }
        }

        let graceful = tokio::time::timeout(self.grace, exited.wait_for(|done| *done))
            .await
            .is_ok();
        let outcome = if graceful {
            StopOutcome::Graceful
        } else {
            tracing::warn!(grace_secs = self.grace.as_secs(), "agent process did not exit in time; killing");
            self.signal_group(true);
            if let Some(kill) = self.kill.take() {
                let _ = kill.send(());
            }
            let _ = tokio::time::timeout(KILL_WAIT, exited.wait_for(|done| *done)).await;
            StopOutcome::Killed
        };
        self.phase = Phase::Stopped;
        outcome
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct StaticBundler(bool);

    #[async_trait]
    impl Bundler for StaticBundler {
        async fn bundle(&self, _ctx: &BundleContext) -> anyhow::Result<()> {
            if self.0 {
                Ok(())
            } else {
                anyhow::bail!("syntax error")
            }
        }
    }

    fn shell(script: &str, dir: &Path) -> LaunchSpec {
        LaunchSpec {
            program: "sh".into(),
            args: vec!["-c".into(), script.into()],
            dir: dir.to_path_buf(),
            env: vec![("PORT".into(), "0".into())],
        }
    }

    #[tokio::test]
    async fn interrupt_stops_a_running_child_gracefully() {
        let dir = tempfile::tempdir().unwrap();
        let mut pm = ProcessManager::new(shell("sleep 30", dir.path()), Duration::from_secs(10));
        assert_eq!(pm.phase(), Phase::NotStarted);

        pm.build(&StaticBundler(true)).await.unwrap();
        assert_eq!(pm.phase(), Phase::Building);

        let exited = CancellationToken::new();
        pm.start(exited.clone()).unwrap();
        assert_eq!(pm.phase(), Phase::Running);

        assert_eq!(pm.stop(true).await, StopOutcome::Graceful);
        assert_eq!(pm.phase(), Phase::Stopped);
        assert!(exited.is_cancelled());
    }

    #[tokio::test]
    async fn exited_child_cancels_session_and_stops_without_waiting() {
        let dir = tempfile::tempdir().unwrap();
        let mut pm = ProcessManager::new(shell("exit 0", dir.path()), Duration::from_secs(30));
        pm.build(&StaticBundler(true)).await.unwrap();

        let exited = CancellationToken::new();
        pm.start(exited.clone()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), exited.cancelled())
            .await
            .unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(2), pm.stop(true))
            .await
            .unwrap();
        assert_eq!(outcome, StopOutcome::AlreadyExited);
        assert_eq!(pm.phase(), Phase::Stopped);
    }

    #[tokio::test]
    async fn child_ignoring_interrupt_is_killed_after_grace() {
        let dir = tempfile::tempdir().unwrap();
        let ready = dir.path().join("ready");
        let script = format!("trap '' INT; touch {}; sleep 30", ready.display());
        let mut pm = ProcessManager::new(shell(&script, dir.path()), Duration::from_millis(300));
        pm.build(&StaticBundler(true)).await.unwrap();
        pm.start(CancellationToken::new()).unwrap();

        for _ in 0..100 {
            if ready.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(ready.exists());

        assert_eq!(pm.stop(true).await, StopOutcome::Killed);
        assert_eq!(pm.phase(), Phase::Stopped);
    }

    #[tokio::test]
    async fn failed_build_ends_the_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let mut pm = ProcessManager::new(shell("exit 0", dir.path()), Duration::from_secs(1));
        let err = pm.build(&StaticBundler(false)).await.unwrap_err();
        assert!(format!("{err:#}").contains("syntax error"));
        assert_eq!(pm.phase(), Phase::Stopped);
        assert!(pm.start(CancellationToken::new()).is_err());
    }

    #[tokio::test]
    async fn start_requires_a_build() {
        let dir = tempfile::tempdir().unwrap();
        let mut pm = ProcessManager::new(shell("exit 0", dir.path()), Duration::from_secs(1));
        assert!(pm.start(CancellationToken::new()).is_err());
        assert_eq!(pm.stop(false).await, StopOutcome::NotRunning);
    }

    #[tokio::test]
    async fn missing_program_fails_to_start() {
        let dir = tempfile::tempdir().unwrap();
        let launch = LaunchSpec {
            program: "definitely-not-a-real-binary-xyz".into(),
            args: Vec::new(),
            dir: dir.path().to_path_buf(),
            env: Vec::new(),
        };
        let mut pm = ProcessManager::new(launch, Duration::from_secs(1));
        pm.build(&StaticBundler(true)).await.unwrap();
        assert!(pm.start(CancellationToken::new()).is_err());
    }

    #[test]
    fn occupied_preferred_port_falls_back() {
        let held = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let busy = held.local_addr().unwrap().port();
        let port = choose_port(busy, None).unwrap();
        assert_ne!(port, busy);
        assert_ne!(port, 0);
    }
}
