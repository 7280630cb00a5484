//! Client binary entry point: parse CLI args, init logging, run.

use clap::Parser;
use tracing_subscriber::EnvFilter;

use ascii_chat::config::ClientConfig;

fn main() {
    let config = ClientConfig::parse();
    init_logging(config.log_file.as_deref());

    if let Err(e) = ascii_chat::client::run(config) {
        tracing::error!(error = %e, "client exited with fatal error");
        std::process::exit(1);
    }
}

fn init_logging(log_file: Option<&std::path::Path>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match log_file {
        Some(path) => {
            if let Ok(file) = std::fs::OpenOptions::new().create(true).append(true).open(path) {
                tracing_subscriber::fmt().with_env_filter(filter).with_writer(file).init();
                return;
            }
            tracing_subscriber::fmt().with_env_filter(EnvFilter::new("info")).init();
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
}
