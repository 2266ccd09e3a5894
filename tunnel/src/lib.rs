pub mod bridge;
pub mod bundler;
pub mod config;
pub mod error;
pub mod logsink;
pub mod process;
pub mod project;
pub mod relay;
pub mod router;
pub mod session;
pub mod tail;
