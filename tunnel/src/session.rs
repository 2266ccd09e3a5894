//! Top-level orchestration of one development session.

use anyhow::Context;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio_util::sync::CancellationToken;

use crate::bridge::InvocationBridge;
use crate::bundler::CommandBundler;
use crate::config::Config;
use crate::error::RelayError;
use crate::logsink::{LogSink, log_queue};
use crate::process::{LaunchSpec, ProcessManager, StopOutcome, choose_port};
use crate::project::ProjectContext;
use crate::relay::{ConnectOptions, RelayConnection};
use crate::router::InboundRouter;

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub dir: PathBuf,
    pub session_id: Option<String>,
}

enum Ending {
    ProcessExited,
    ShutdownSignal,
    RelayLost(RelayError),
}

pub fn new_session_id() -> String {
    uuid::Uuid::new_v4().simple().to_string().chars().take(6).collect()
}

pub fn session_url(console_url: &str, session_id: &str) -> String {
    format!(
        "{}/developer/live/{}",
        console_url.trim_end_matches('/'),
        session_id
    )
}

fn print_instructions(url: &str, project: &ProjectContext, port: u16) {
    println!();
    println!("Your development session is live: {url}");
    let agents = project.agents();
    if !agents.is_empty() {
        println!();
        println!("Available agents:");
        for agent in &agents {
            println!("  • {}", agent.name);
            println!("    ID: {}", agent.id);
        }
    }
    let sample = agents.first().map(|a| a.id.as_str()).unwrap_or("<agent-id>");
    println!();
    println!("To interact with your agents locally, you can use:");
    println!(
        "curl -v http://localhost:{port}/{sample} --json '{{\"input\": \"Hello, world!\"}}'"
    );
    println!();
}

async fn open_browser(url: String) {
    open_browser_with(url, |target| open::that(target)).await
}

/// Launch failures are logged and otherwise ignored.
async fn open_browser_with<F>(url: String, launch: F)
where
    F: FnOnce(&str) -> std::io::Result<()> + Send + 'static,
{
    let target = url.clone();
    match tokio::task::spawn_blocking(move || launch(&target)).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => tracing::warn!(error=%err, url=%url, "failed to open browser"),
        Err(err) => tracing::warn!(error=%err, "browser launcher task failed"),
    }
}

async fn reset_events_file(path: &Path) -> anyhow::Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            tracing::debug!(path=%path.display(), "removed previous events file");
            Ok(())
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("remove events file: {}", path.display())),
    }
}

/// Waits for Ctrl-C, or SIGTERM on unix.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                tracing::debug!(error=%err, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

pub async fn run(config: &Config, opts: SessionOptions, log_sink: &LogSink) -> anyhow::Result<()> {
    run_until(config, opts, log_sink, shutdown_signal()).await
}

/// Runs a session until the child exits, `shutdown` resolves, or the relay is lost.
///
/// Needs a multi-thread runtime: log producers block on a full queue, which a
/// current-thread runtime cannot drain.
pub async fn run_until(
    config: &Config,
    opts: SessionOptions,
    log_sink: &LogSink,
    shutdown: impl Future<Output = ()>,
) -> anyhow::Result<()> {
    if Handle::current().runtime_flavor() != RuntimeFlavor::MultiThread {
        anyhow::bail!("a development session needs a multi-thread tokio runtime");
    }
    let project = ProjectContext::load(&opts.dir)?;
    let session_id = opts
        .session_id
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(new_session_id);
    let events_file = project.dir.join(&config.events_file);
    reset_events_file(&events_file).await?;

    let (queue, logs) = log_queue(config.log_queue_capacity);
    let conn = RelayConnection::connect(ConnectOptions {
        session_id: session_id.clone(),
        relay_url: config.relay_url.clone(),
        api_key: config.api_key.clone(),
        events_file: events_file.clone(),
        logs,
    })
    .await
    .context("failed to connect to relay")?;

    let port = choose_port(
        project.development()?.port,
        std::env::var("PORT").ok().and_then(|p| p.parse().ok()),
    )?;

    let url = session_url(&config.console_url, &session_id);
    print_instructions(&url, &project, port);
    if config.open_browser {
        open_browser(url).await;
    }

    if !log_sink.attach(queue) {
        tracing::debug!("log forwarding already attached");
    }

    let result = drive(config, &conn, &project, port, &events_file, shutdown).await;
    if let Err(err) = conn.close().await {
        tracing::warn!(error=%err, "failed to close relay connection cleanly");
    }
    result
}

async fn drive(
    config: &Config,
    conn: &RelayConnection,
    project: &ProjectContext,
    port: u16,
    events_file: &Path,
    shutdown: impl Future<Output = ()>,
) -> anyhow::Result<()> {
    let launch = LaunchSpec::for_project(project, port, events_file)?;
    let mut pm = ProcessManager::new(launch, config.shutdown_timeout);
    pm.build(&CommandBundler::for_project(project)).await?;

    let exited = CancellationToken::new();
    pm.start(exited.clone())?;

    let session = CancellationToken::new();
    conn.set_handler(Arc::new(InboundRouter::new(
        project.agents(),
        conn.sender(),
        InvocationBridge::new(port),
        session.clone(),
    )));
    tracing::info!(session_id=%conn.session_id(), port, "development session started");

    let ending = tokio::select! {
        _ = exited.cancelled() => Ending::ProcessExited,
        _ = shutdown => Ending::ShutdownSignal,
        err = conn.lost() => Ending::RelayLost(err),
    };
    session.cancel();

    let interrupt = match &ending {
        Ending::ProcessExited => {
            tracing::info!("agent process exited, shutting down");
            false
        }
        Ending::ShutdownSignal => {
            tracing::info!("shutdown signal received, shutting down");
            true
        }
        Ending::RelayLost(err) => {
            tracing::error!(error=%err, "lost relay connection, shutting down");
            true
        }
    };

    match pm.stop(interrupt).await {
        StopOutcome::Killed => tracing::warn!("agent process was killed"),
        outcome => tracing::debug!(?outcome, "agent process stopped"),
    }

    match ending {
        Ending::RelayLost(err) => Err(err.into()),
        _ => Ok(()),
    }
}
