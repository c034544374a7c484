pub mod config;
pub mod keys;
pub mod msgpack;
pub mod pty;
pub mod reactor;
pub mod rpc;
pub mod script;
pub mod server;
pub mod term;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::script::PassthroughScript;
use crate::server::ServerOptions;

/// Prise - a scriptable terminal multiplexer.
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
  #[command(subcommand)]
  pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
  /// Start the multiplexer server.
  Serve {
    /// Listener socket path (defaults to the runtime dir).
    #[arg(long)]
    socket: Option<PathBuf>,
    /// Config file path (defaults to the XDG location).
    #[arg(long)]
    config: Option<PathBuf>,
    /// Default shell argv for spawns that name no command.
    #[arg(long)]
    shell: Option<Vec<String>>,
  },
}

pub fn parse() -> Cli {
  Cli::parse()
}

pub fn run() -> Result<()> {
  env_logger::init();
  let cli = parse();
  match cli.command {
    Command::Serve {
      socket,
      config,
      shell,
    } => {
      let cfg = config::load(config.as_deref())?;
      let socket_path = socket
        .or_else(|| cfg.socket_path.clone().map(PathBuf::from))
        .unwrap_or_else(server::socket::default_socket_path);
      let default_shell = shell
        .or_else(|| cfg.shell.clone())
        .unwrap_or_else(config::fallback_shell);
      let min_frame_interval = cfg
        .min_frame_interval_ms
        .map_or(server::scheduler::MIN_FRAME_INTERVAL, Duration::from_millis);
      server::run(ServerOptions {
        socket_path,
        min_frame_interval,
        default_shell,
        script: Box::new(PassthroughScript::default()),
      })
    }
  }
}
