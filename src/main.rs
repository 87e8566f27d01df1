use clap::{Parser, Subcommand};
use deadbeef::{
    auth,
    config::{ClientConfig, ServerConfig},
    logging, LocalAgent, RemoteAgent,
};
use std::path::PathBuf;

/// Two-hop forward proxy
#[derive(Parser)]
#[command(name = "deadbeef")]
#[command(about = "Forward proxy tunnelling HTTP and CONNECT traffic through a remote agent")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the remote agent
    Server {
        /// Path to the remote agent configuration file
        #[arg(long, default_value = "config/server.yml")]
        config: PathBuf,
    },
    /// Start the local agent
    Client {
        /// Path to the local agent configuration file
        #[arg(long, default_value = "config/client.yml")]
        config: PathBuf,
    },
    /// Print a fresh random secret key
    Secret,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Server { config } => {
            let config = ServerConfig::load(&config).await?;
            logging::init(&config.log).await?;
            RemoteAgent::new(config)?.run().await?;
        }
        Commands::Client { config } => {
            let config = ClientConfig::load(&config).await?;
            logging::init(&config.log).await?;
            LocalAgent::new(config)?.run().await?;
        }
        Commands::Secret => {
            println!("{}", auth::generate_secret_key());
        }
    }

    tracing::info!("Shut down");
    Ok(())
}
