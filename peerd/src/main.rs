#![deny(clippy::as_conversions)]
use opts::Opts;
use peerd::api::PeerId;
use peerd::{Node, Parameters, ShellExecutor};
use std::io;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod opts;

fn main() -> anyhow::Result<()> {
    init_logging();

    let opts = Opts::from_args();

    let params = Parameters::builder()
        .id(PeerId(opts.id))
        .epoch(opts.epoch())
        .bind(opts.listen)
        .peers(opts.peer_table()?)
        .poll_interval(
            opts.poll_interval()
                .unwrap_or(Parameters::DEFAULT_POLL_INTERVAL),
        )
        .finalize_wait(
            opts.finalize_wait()
                .unwrap_or(Parameters::DEFAULT_FINALIZE_WAIT),
        )
        .assignment_timeout(opts.assignment_timeout())
        .build();

    let node = Node::new(params, ShellExecutor::new(opts.executor_shell.clone()))?;

    node.get_ctrl().install_signal_handler()?;

    node.wait();
    info!("Bye");

    Ok(())
}

fn init_logging() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(atty::is(atty::Stream::Stderr))
                .with_writer(io::stderr),
        )
        .init();
}
