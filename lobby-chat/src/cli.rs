use std::net::SocketAddr;

use clap::{Args, Parser, Subcommand};

use crate::framing::FramingMode;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the master directory server that creates lobbies on demand.
    Master(MasterArgs),
    /// Connect to a master server and chat.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct MasterArgs {
    /// Socket address the master should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:8888")]
    pub listen: SocketAddr,

    /// Host name or IP clients are told to connect to. Defaults to the listen IP.
    #[arg(long)]
    pub advertise_host: Option<String>,

    /// Chunk size for reading messages off a socket.
    #[arg(long, default_value_t = crate::framing::DEFAULT_BUFFER_SIZE)]
    pub buffer_size: usize,

    #[arg(long, value_enum, default_value_t = FramingMode::Legacy)]
    pub framing: FramingMode,

    /// Lowest port a lobby may be given.
    #[arg(long, default_value_t = 10000)]
    pub lobby_port_min: u16,

    /// One past the highest port a lobby may be given.
    #[arg(long, default_value_t = 20000)]
    pub lobby_port_max: u16,

    /// How long to wait when checking whether a candidate port is already in use.
    #[arg(long, default_value_t = 200)]
    pub liveness_timeout_ms: u64,

    /// Candidate ports to try before a `!create` fails.
    #[arg(long, default_value_t = crate::ports::DEFAULT_MAX_ATTEMPTS)]
    pub max_port_attempts: usize,

    /// Seconds a new lobby waits for its first member before closing.
    #[arg(long, default_value_t = 60)]
    pub first_member_timeout_secs: u64,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Address of the master server, as `host:port`.
    #[arg(long, default_value = "127.0.0.1:8888")]
    pub server: String,

    #[arg(long, default_value_t = crate::framing::DEFAULT_BUFFER_SIZE)]
    pub buffer_size: usize,

    #[arg(long, value_enum, default_value_t = FramingMode::Legacy)]
    pub framing: FramingMode,
}
