//! tinycrab CLI: a thin shell over the supervisor's in-process API.

use clap::{Parser, Subcommand};

use tinycrab::supervisor::{SpawnOptions, Supervisor};
use tinycrab::TinycrabOptions;

#[derive(Parser)]
#[command(name = "tinycrab", about = "Supervisor for conversational agent processes")]
struct Cli {
    /// Data directory (defaults to ./.tinycrab, or AGENT_DATA_DIR).
    #[arg(long, global = true)]
    data_dir: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Spawn an agent (or return the running one).
    Spawn {
        id: String,
        #[arg(long)]
        provider: Option<String>,
        #[arg(long)]
        model: Option<String>,
    },
    /// List agents and their status.
    List,
    /// Send one chat message to an agent.
    Chat {
        id: String,
        message: String,
        /// Reuse a session id from a previous reply.
        #[arg(long)]
        session: Option<String>,
    },
    /// Stop a running agent.
    Stop { id: String },
    /// Stop an agent and remove its data directory.
    Destroy {
        id: String,
        #[arg(long)]
        keep_data: bool,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tinycrab=info".into()),
        )
        .init();

    if let Err(e) = run().await {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let mut options = TinycrabOptions::from_env();
    if let Some(data_dir) = cli.data_dir {
        options.data_dir = data_dir;
    }

    let supervisor = Supervisor::new(options);
    supervisor.init().await?;

    match cli.command {
        Command::Spawn {
            id,
            provider,
            model,
        } => {
            let handle = supervisor
                .spawn(
                    &id,
                    SpawnOptions {
                        provider,
                        model,
                        api_key: None,
                    },
                )
                .await?;
            println!("{} running on port {}", handle.id(), handle.port());
        }
        Command::List => {
            let agents = supervisor.list().await;
            if agents.is_empty() {
                println!("no agents");
            }
            for agent in agents {
                println!(
                    "{:<20} {:<8} port={}",
                    agent.id,
                    match agent.status {
                        tinycrab::supervisor::AgentStatus::Running => "running",
                        tinycrab::supervisor::AgentStatus::Stopped => "stopped",
                    },
                    agent
                        .port
                        .map(|p| p.to_string())
                        .unwrap_or_else(|| "-".to_string()),
                );
            }
        }
        Command::Chat {
            id,
            message,
            session,
        } => {
            let handle = supervisor
                .get(&id)
                .await
                .ok_or_else(|| format!("unknown agent: {}", id))?;
            let reply = handle.chat(&message, session.as_deref()).await?;
            println!("{}", reply.response);
            eprintln!("(session: {})", reply.session_id);
        }
        Command::Stop { id } => {
            let handle = supervisor
                .get(&id)
                .await
                .ok_or_else(|| format!("unknown agent: {}", id))?;
            handle.stop().await?;
            println!("stopped {}", id);
        }
        Command::Destroy { id, keep_data } => {
            let handle = supervisor
                .get(&id)
                .await
                .ok_or_else(|| format!("unknown agent: {}", id))?;
            handle.destroy(!keep_data).await?;
            println!("destroyed {}", id);
        }
    }
    Ok(())
}
