use clap::Parser;
use mockd::{common::runtime, server::builder::MockdServerBuilder};
use tracing_subscriber::EnvFilter;

/// Standalone mock server.
#[derive(Parser, Debug)]
#[command(name = "mockd", version, about)]
struct Args {
    /// Port to listen on.
    #[arg(short, long, env = "MOCKD_PORT", default_value = "5000")]
    port: u16,

    /// Number of worker threads.
    #[arg(short, long, env = "MOCKD_WORKERS", default_value = "3")]
    workers: usize,

    /// Bind to all interfaces instead of loopback only.
    #[arg(short, long, env = "MOCKD_EXPOSE")]
    expose: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mockd=info")),
        )
        .init();

    let args = Args::parse();

    tracing::info!(
        "starting {} server v{}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );

    let server = MockdServerBuilder::new()
        .port(args.port)
        .expose(args.expose)
        .build();

    runtime::new(args.workers, args.workers)?.block_on(async move {
        let shutdown = async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!("cannot listen for shutdown signal: {}", err);
            }
        };

        server
            .start_with_signals(None, shutdown)
            .await
            .map_err(|err| Box::new(err) as Box<dyn std::error::Error>)
    })
}
