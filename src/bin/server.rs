use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::{net::TcpListener, runtime::Runtime, signal};
use tracing::{error, info};

use relay::{
    config::Config,
    server::{self, Listeners},
};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}
#[derive(Subcommand)]
enum Commands {
    /// run with config file: --config config.toml
    Run {
        #[arg(short, long, value_name = "FILE")]
        config: PathBuf,
    },
    /// validate a config file without binding anything
    Check {
        #[arg(short, long, value_name = "FILE")]
        config: PathBuf,
    },
}

async fn bind(host: &str, port: Option<u16>) -> std::io::Result<Option<TcpListener>> {
    match port {
        Some(port) => match TcpListener::bind((host, port)).await {
            Ok(listener) => Ok(Some(listener)),
            Err(err) => {
                error!(host, port, cause = %err, "bind tcp failed");
                Err(err)
            }
        },
        None => Ok(None),
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => {
            let config = Config::from_file(&config)?;
            tracing_subscriber::fmt().init();
            let rt = Runtime::new()?;
            rt.block_on(async move {
                info!("Starting signal relay...");
                let host = config.host().to_string();
                let listeners = Listeners {
                    broadcast: bind(&host, config.broadcast.as_ref().map(|b| b.port)).await?,
                    negotiation: bind(&host, config.negotiation.as_ref().map(|n| n.port)).await?,
                };
                server::run(config, listeners, signal::ctrl_c()).await;
                Ok::<_, std::io::Error>(())
            })?;
        }
        Commands::Check { config } => {
            let config = Config::from_file(&config)?;
            println!("{:#?}", config);
        }
    };

    Ok(())
}
