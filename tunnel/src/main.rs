use clap::{Parser, Subcommand};
use devtunnel::{
    config::Config,
    error::RelayError,
    logsink::LogSink,
    session::{self, SessionOptions},
};
use std::path::PathBuf;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "devtunnel")]
#[command(version)]
#[command(about = "Expose a locally running agent project through the relay")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build and run the project locally, connected to a live console session
    #[command(alias = "dev")]
    Run {
        /// Reuse a session id instead of generating one
        #[arg(long, env = "DEVTUNNEL_SESSION_ID")]
        session_id: Option<String>,

        /// Project directory
        #[arg(short, long, default_value = ".")]
        dir: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let log_sink = LogSink::new();
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .with(log_sink.layer())
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Run { session_id, dir } => run(SessionOptions { dir, session_id }, &log_sink).await,
    };

    if let Err(err) = result {
        if matches!(err.downcast_ref::<RelayError>(), Some(RelayError::InvalidCredential)) {
            eprintln!("error: the relay rejected your API key; check DEVTUNNEL_API_KEY");
        } else {
            eprintln!("error: {err:#}");
        }
        std::process::exit(1);
    }
}

async fn run(opts: SessionOptions, log_sink: &LogSink) -> anyhow::Result<()> {
    let cfg = Config::from_env()?;
    tracing::info!(relay=%cfg.relay_url, dir=%opts.dir.display(), "devtunnel starting");
    session::run(&cfg, opts, log_sink).await
}
