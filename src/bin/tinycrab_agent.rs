//! Per-agent server binary, launched by the supervisor.

use clap::Parser;

use tinycrab::server::bootstrap::{run, AgentServerArgs};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tinycrab=info".into()),
        )
        .init();

    let args = AgentServerArgs::parse();
    if let Err(e) = run(args).await {
        eprintln!("agent server failed: {}", e);
        std::process::exit(1);
    }
}
