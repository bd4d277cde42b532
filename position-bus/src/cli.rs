use std::{net::IpAddr, time::Duration};

use clap::{Args, Parser, Subcommand};

use crate::config::{
    ClientConfig, DEFAULT_PORT, DEFAULT_QUEUE_CAPACITY, DEFAULT_WORKERS, ServerConfig,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the position server until Ctrl-C.
    Server(ServerArgs),
    /// Connect to a server, publish synthetic positions, and print foreign updates.
    Client(ClientArgs),
}

impl Command {
    pub fn debug_logs(&self) -> bool {
        match self {
            Command::Server(args) => args.debug,
            Command::Client(args) => args.debug,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Address to bind.
    #[arg(long, default_value = "0.0.0.0")]
    pub host: IpAddr,

    /// Port to listen on. Use 0 for an ephemeral port.
    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Broadcast worker count. Use 1 for a strict global order.
    #[arg(long, default_value_t = DEFAULT_WORKERS)]
    pub workers: usize,

    /// Updates buffered between receive loops and workers.
    #[arg(long, default_value_t = DEFAULT_QUEUE_CAPACITY)]
    pub queue_capacity: usize,

    /// Log every broadcast.
    #[arg(long)]
    pub debug: bool,
}

impl From<ServerArgs> for ServerConfig {
    fn from(args: ServerArgs) -> Self {
        Self {
            host: args.host,
            port: args.port,
            debug_logs: args.debug,
            workers: args.workers,
            queue_capacity: args.queue_capacity,
            ..ServerConfig::default()
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Identity published with every update. Must be unique among live clients.
    #[arg(long)]
    pub identity: String,

    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Fixed local source port.
    #[arg(long)]
    pub local_port: Option<u16>,

    /// Number of synthetic positions to publish.
    #[arg(long, default_value_t = 10)]
    pub count: usize,

    /// Pause between published positions, in milliseconds.
    #[arg(long, default_value_t = 500)]
    pub interval_ms: u64,

    /// How long to keep listening after the last publish, in milliseconds.
    #[arg(long, default_value_t = 5000)]
    pub linger_ms: u64,

    /// Disconnect after the first batch, wait this long, reconnect, and
    /// publish a second batch.
    #[arg(long)]
    pub reconnect_after_ms: Option<u64>,

    /// Wait before the first reconnect attempt, in milliseconds.
    #[arg(long, default_value_t = 5000)]
    pub reconnect_delay_ms: u64,

    /// Wait between failed reconnect attempts, in milliseconds.
    #[arg(long, default_value_t = 2000)]
    pub retry_delay_ms: u64,

    /// Log every foreign update.
    #[arg(long)]
    pub debug: bool,
}

impl ClientArgs {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn linger(&self) -> Duration {
        Duration::from_millis(self.linger_ms)
    }

    pub fn reconnect_after(&self) -> Option<Duration> {
        self.reconnect_after_ms.map(Duration::from_millis)
    }

    pub fn session_config(&self) -> ClientConfig {
        ClientConfig {
            local_port: self.local_port,
            debug_logs: self.debug,
            reconnect_delay: Duration::from_millis(self.reconnect_delay_ms),
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            ..ClientConfig::new(self.host.clone(), self.port, self.identity.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_args_fill_config() {
        let cli = Cli::parse_from(["position_bus", "server", "--port", "0", "--workers", "1"]);
        let Command::Server(args) = cli.command else {
            panic!("expected server subcommand");
        };
        let config = ServerConfig::from(args);
        assert_eq!(config.port, 0);
        assert_eq!(config.workers, 1);
        assert_eq!(config.queue_capacity, DEFAULT_QUEUE_CAPACITY);
    }

    #[test]
    fn client_args_fill_config() {
        let cli = Cli::parse_from([
            "position_bus",
            "client",
            "--identity",
            "AAPL",
            "--local-port",
            "40000",
            "--debug",
        ]);
        assert!(cli.command.debug_logs());
        let Command::Client(args) = cli.command else {
            panic!("expected client subcommand");
        };
        let config = args.session_config();
        assert_eq!(config.identity, "AAPL");
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.local_port, Some(40000));
        assert!(config.debug_logs);
        assert_eq!(config.reconnect_delay, Duration::from_secs(5));
        assert_eq!(config.retry_delay, Duration::from_secs(2));
    }

    #[test]
    fn reconnect_cycle_is_opt_in() {
        let cli = Cli::parse_from(["position_bus", "client", "--identity", "AAPL"]);
        let Command::Client(args) = cli.command else {
            panic!("expected client subcommand");
        };
        assert!(args.reconnect_after().is_none());

        let cli = Cli::parse_from([
            "position_bus",
            "client",
            "--identity",
            "AAPL",
            "--reconnect-after-ms",
            "250",
            "--reconnect-delay-ms",
            "100",
        ]);
        let Command::Client(args) = cli.command else {
            panic!("expected client subcommand");
        };
        assert_eq!(args.reconnect_after(), Some(Duration::from_millis(250)));
        assert_eq!(
            args.session_config().reconnect_delay,
            Duration::from_millis(100)
        );
    }
}
