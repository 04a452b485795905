use std::{net::SocketAddr, ops::Range, time::Duration};

use anyhow::{Result, ensure};

use crate::{
    cli::MasterArgs,
    framing::{Framing, MAX_FRAME_LEN},
    lobby::DEFAULT_FIRST_MEMBER_TIMEOUT,
    ports::{DEFAULT_LOBBY_PORTS, DEFAULT_MAX_ATTEMPTS, DEFAULT_LIVENESS_TIMEOUT, PortPool},
};

/// Validated settings for the master and the lobbies it starts.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub advertise_host: String,
    pub framing: Framing,
    pub lobby_ports: Range<u16>,
    pub liveness_timeout: Duration,
    pub max_port_attempts: usize,
    /// How long a new lobby waits for its creator before stopping.
    pub first_member_timeout: Duration,
}

impl ServerConfig {
    /// Defaults for a master bound to `listen`, advertising its IP.
    pub fn new(listen: SocketAddr) -> Self {
        Self {
            listen,
            advertise_host: listen.ip().to_string(),
            framing: Framing::default(),
            lobby_ports: DEFAULT_LOBBY_PORTS,
            liveness_timeout: DEFAULT_LIVENESS_TIMEOUT,
            max_port_attempts: DEFAULT_MAX_ATTEMPTS,
            first_member_timeout: DEFAULT_FIRST_MEMBER_TIMEOUT,
        }
    }

    pub fn from_args(args: MasterArgs) -> Result<Self> {
        let config = Self {
            listen: args.listen,
            advertise_host: args
                .advertise_host
                .unwrap_or_else(|| args.listen.ip().to_string()),
            framing: Framing::new(args.framing, args.buffer_size),
            lobby_ports: args.lobby_port_min..args.lobby_port_max,
            liveness_timeout: Duration::from_millis(args.liveness_timeout_ms),
            max_port_attempts: args.max_port_attempts,
            first_member_timeout: Duration::from_secs(args.first_member_timeout_secs),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.lobby_ports.is_empty(),
            "lobby port range {}..{} is empty",
            self.lobby_ports.start,
            self.lobby_ports.end
        );
        ensure!(self.framing.buffer_size > 0, "buffer size must be positive");
        ensure!(
            self.framing.buffer_size <= MAX_FRAME_LEN,
            "buffer size {} exceeds the {MAX_FRAME_LEN} byte frame limit",
            self.framing.buffer_size
        );
        ensure!(
            !self.first_member_timeout.is_zero(),
            "first member timeout must be positive"
        );
        ensure!(
            self.max_port_attempts > 0,
            "max port attempts must be positive"
        );
        ensure!(
            !self.advertise_host.is_empty(),
            "advertised host must not be empty"
        );
        Ok(())
    }

    pub fn port_pool(&self) -> PortPool {
        PortPool::new(
            self.lobby_ports.clone(),
            self.liveness_timeout,
            self.max_port_attempts,
        )
    }
}
