use std::io::{self, Write};
use std::net::SocketAddr;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use derive_more::Display;
use error_stack::{Context, IntoReport, ResultExt};
use peerd_client::Client;
use tracing_subscriber::{prelude::__tracing_subscriber_SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Display)]
#[display(fmt = "application error")]
pub struct AppError;

impl Context for AppError {}

pub type AppResult<T> = error_stack::Result<T, AppError>;

/// Submit a script to a peerd cluster leader and print its output
#[derive(Parser, Debug, Clone)]
pub struct Opts {
    #[clap(long = "leader", env = "PEERD_LEADER", default_value = "127.0.0.1:7700")]
    pub leader: SocketAddr,

    #[clap(long = "timeout-ms", default_value = "10000")]
    pub timeout_ms: u64,

    /// Script to run on a follower
    pub script: String,
}

fn main() -> AppResult<ExitCode> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".into()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(atty::is(atty::Stream::Stderr))
                .with_writer(io::stderr),
        )
        .init();

    let opts = Opts::parse();

    let mut client = Client::connect(opts.leader, Duration::from_millis(opts.timeout_ms))
        .report()
        .change_context(AppError)?;

    let outcome = client
        .submit(opts.script.as_bytes())
        .report()
        .change_context(AppError)?;

    if outcome.is_success() {
        io::stdout()
            .write_all(outcome.data())
            .report()
            .change_context(AppError)?;
        Ok(ExitCode::SUCCESS)
    } else {
        eprintln!("task failed: {}", outcome.diagnostic().unwrap_or_default());
        Ok(ExitCode::FAILURE)
    }
}
