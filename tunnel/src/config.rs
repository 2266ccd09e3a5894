use anyhow::Context;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub relay_url: String,
    pub console_url: String,
    pub api_key: String,
    pub events_file: String,
    pub log_queue_capacity: usize,
    pub shutdown_timeout: Duration,
    pub open_browser: bool,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let relay_url =
            var("DEVTUNNEL_RELAY_URL").unwrap_or_else(|| "http://127.0.0.1:8787/ws/devmode".into());
        let console_url =
            var("DEVTUNNEL_CONSOLE_URL").unwrap_or_else(|| "http://127.0.0.1:3000".into());
        let api_key = var("DEVTUNNEL_API_KEY")
            .context("missing DEVTUNNEL_API_KEY (create an API key in the console)")?;
        let events_file = var("DEVTUNNEL_EVENTS_FILE").unwrap_or_else(|| "events.log".into());

        let log_queue_capacity = var("DEVTUNNEL_LOG_QUEUE_CAPACITY")
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(1024)
            .clamp(1, 65_536);

        let secs = var("DEVTUNNEL_SHUTDOWN_TIMEOUT_SECS")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(30)
            .clamp(1, 600);

        let open_browser = !var("DEVTUNNEL_NO_BROWSER")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        Ok(Self {
            relay_url,
            console_url,
            api_key,
            events_file,
            log_queue_capacity,
            shutdown_timeout: Duration::from_secs(secs),
            open_browser,
        })
    }
}
