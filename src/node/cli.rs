use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::node::config::NodeConfig;
use crate::node::Node;
use crate::utils::logging::init_logging;

/// CLI for node control.
#[derive(Parser)]
#[clap(name = "forgemesh-node", version)]
pub struct Cli {
    /// Path to the node config file
    #[clap(long, default_value = "./config.toml")]
    pub config: PathBuf,

    #[clap(subcommand)]
    pub cmd: Cmd,
}

#[derive(Subcommand)]
pub enum Cmd {
    /// Write a starter config file
    Init {
        /// overwrite an existing config
        #[clap(long)]
        force: bool,
    },
    /// Run the node
    Run {
        /// override the advertised public IP
        #[clap(long)]
        public_ip: Option<String>,

        /// override the overlay listen port
        #[clap(long)]
        peer_port: Option<u16>,
    },
}

pub async fn run_cli() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    match cli.cmd {
        Cmd::Init { force } => {
            if cli.config.exists() && !force {
                bail!("{} already exists (use --force to overwrite)", cli.config.display());
            }
            std::fs::write(&cli.config, NodeConfig::template())?;
            println!("wrote starter config to {}", cli.config.display());
            Ok(())
        }
        Cmd::Run { public_ip, peer_port } => {
            let mut cfg = NodeConfig::load(&cli.config)
                .with_context(|| format!("loading {}", cli.config.display()))?;
            if let Some(ip) = public_ip {
                cfg.public_ip = ip;
            }
            if let Some(port) = peer_port {
                cfg.peer_port = port;
            }
            // invalid configuration aborts the process here
            cfg.validate().context("config validation failed")?;

            let node = Node::new(cfg);
            let svc = node.start().await?;
            tokio::signal::ctrl_c().await?;
            println!("shutting down...");
            svc.shutdown().await?;
            println!("node stopped");
            Ok(())
        }
    }
}
