use std::{net::SocketAddr, time::Duration};

use clap::{Args, Parser, Subcommand};

use crate::{protocol::DEFAULT_BUFFER_SIZE, relay::RelayConfig};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay, pairing incoming TCP connections two by two.
    Serve(ServeArgs),
    /// Connect to a relay and exchange messages from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Socket address the relay should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "0.0.0.0:8888")]
    pub listen: SocketAddr,

    /// Largest message, in bytes, read from a client at once.
    #[arg(long, default_value_t = DEFAULT_BUFFER_SIZE)]
    pub buffer_size: usize,

    /// Drop connections that send nothing for this many seconds.
    #[arg(long, value_name = "SECS")]
    pub idle_timeout: Option<u64>,

    /// Send "user_disconnected" to a partner whose peer vanished.
    #[arg(long)]
    pub notify_disconnect: bool,

    /// Stop reading from the peer that receives the second role label.
    #[arg(long)]
    pub legacy_second_role: bool,
}

impl From<ServeArgs> for RelayConfig {
    fn from(args: ServeArgs) -> Self {
        Self {
            listen: args.listen,
            buffer_size: args.buffer_size,
            idle_timeout: args.idle_timeout.map(Duration::from_secs),
            notify_disconnect: args.notify_disconnect,
            legacy_second_role: args.legacy_second_role,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Address of the relay to connect to.
    #[arg(long, default_value = "127.0.0.1:8888")]
    pub server: SocketAddr,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serve_defaults_match_relay_defaults() {
        let cli = Cli::parse_from(["rendezvous-relay", "serve"]);
        let Command::Serve(args) = cli.command else {
            panic!("expected serve command");
        };
        let config = RelayConfig::from(args);
        let defaults = RelayConfig::default();

        assert_eq!(config.listen, defaults.listen);
        assert_eq!(config.buffer_size, defaults.buffer_size);
        assert_eq!(config.idle_timeout, None);
        assert!(!config.notify_disconnect);
        assert!(!config.legacy_second_role);
    }

    #[test]
    fn serve_flags_are_applied() {
        let cli = Cli::parse_from([
            "rendezvous-relay",
            "serve",
            "--listen",
            "127.0.0.1:0",
            "--idle-timeout",
            "30",
            "--notify-disconnect",
            "--legacy-second-role",
        ]);
        let Command::Serve(args) = cli.command else {
            panic!("expected serve command");
        };
        let config = RelayConfig::from(args);

        assert_eq!(config.listen.port(), 0);
        assert_eq!(config.idle_timeout, Some(Duration::from_secs(30)));
        assert!(config.notify_disconnect);
        assert!(config.legacy_second_role);
    }
}
