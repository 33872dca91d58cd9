use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use natpmpd::control::{ControlClient, ControlServer, Request, Response, DEFAULT_CONTROL_ADDR};
use natpmpd::notifier::{CommandHook, LogHandler};
use natpmpd::{init_logging, ConfigPatch, ConfigStore, Daemon, LocalHost, Mapper, Notifier};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about = "NAT-PMP port mapping daemon", long_about = None)]
struct Args {
    /// Config file (defaults to the platform config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Control socket address
    #[arg(long, global = true, default_value = DEFAULT_CONTROL_ADDR)]
    control: SocketAddr,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the daemon in the foreground
    Run {
        /// Listen port the local host starts with
        #[arg(long, default_value_t = 6881)]
        listen_port: u16,
    },

    /// Show the last committed mapping
    Status,

    /// Read or change the daemon config
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Check whether a command names a runnable program
    CheckExec { path: String },

    /// Run a refresh cycle now
    Refresh,
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the current config
    Get,

    /// Set one or more keys, e.g. `enabled=true refresh_interval=30`
    Set {
        #[arg(required = true, value_name = "KEY=VALUE")]
        pairs: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    match args.command {
        Command::Run { listen_port } => run_daemon(args.config, args.control, listen_port).await,
        Command::Status => {
            let response = ControlClient::new(args.control).call(Request::GetStatus).await?;
            print_response(&response)
        }
        Command::Config { action } => {
            let request = match action {
                ConfigAction::Get => Request::GetConfig,
                ConfigAction::Set { pairs } => Request::SetConfig {
                    patch: parse_pairs(&pairs)?,
                },
            };
            let response = ControlClient::new(args.control).call(request).await?;
            print_response(&response)
        }
        Command::CheckExec { path } => {
            let response = ControlClient::new(args.control)
                .call(Request::IsExecutableValid { path })
                .await?;
            print_response(&response)
        }
        Command::Refresh => {
            let response = ControlClient::new(args.control).call(Request::Refresh).await?;
            print_response(&response)
        }
    }
}

async fn run_daemon(config: Option<PathBuf>, control: SocketAddr, listen_port: u16) -> Result<()> {
    let store = config.map(ConfigStore::new).unwrap_or_else(ConfigStore::default_location);

    let notifier = Notifier::empty()
        .with_handler(Arc::new(LogHandler))
        .with_handler(Arc::new(CommandHook));

    let daemon = Arc::new(
        Daemon::load(
            store,
            Arc::new(Mapper::new()),
            Arc::new(LocalHost::new(listen_port)),
            notifier,
        )
        .context("Failed to load config")?,
    );
    tracing::info!("Using config file {:?}", daemon.config_path());

    let server = ControlServer::bind(control)
        .await
        .with_context(|| format!("Failed to bind control socket {}", control))?;

    daemon.start().await;

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
        }
    };
    server.serve(daemon.clone(), shutdown).await?;

    daemon.shutdown().await;
    Ok(())
}

fn parse_pairs(pairs: &[String]) -> Result<ConfigPatch> {
    let mut patch = ConfigPatch::default();
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .with_context(|| format!("Expected KEY=VALUE, got '{}'", pair))?;
        patch.set_from_str(key.trim(), value)?;
    }
    Ok(patch)
}

fn print_response(response: &Response) -> Result<()> {
    match response {
        Response::Status { status, scheduler } => {
            println!("Scheduler:   {:?}", scheduler);
            println!("Last update: {}", status.last_update);
            println!("Public IP:   {}", status.public_ip_address);
            println!("Port:        {}", status.current_port);
        }
        Response::ExecutableValid { valid } => {
            println!("{}", if *valid { "valid" } else { "invalid" });
        }
        other => println!("{}", serde_json::to_string_pretty(other)?),
    }
    Ok(())
}
