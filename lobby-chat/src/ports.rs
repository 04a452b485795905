//! Random port allocation for new lobbies.
//!
//! Allocation is split in two so the owner of the pool never waits on the
//! network: [`PortPool::claim`] draws and reserves candidate ports
//! synchronously, and [`PortClaim::settle`] checks them wherever the caller
//! likes. Candidates the claim did not use go back through
//! [`PortPool::free`].

use std::{collections::BTreeSet, net::IpAddr, ops::Range, time::Duration};

use rand::{Rng, SeedableRng, rngs::StdRng};
use tokio::{net::TcpStream, time::timeout};
use tracing::debug;

use crate::error::PortError;

pub const DEFAULT_LOBBY_PORTS: Range<u16> = 10000..20000;
pub const DEFAULT_LIVENESS_TIMEOUT: Duration = Duration::from_millis(200);
pub const DEFAULT_MAX_ATTEMPTS: usize = 64;

/// Ports currently reserved by a running server, plus the policy for
/// picking new ones.
///
/// Owned by the master; a port stays reserved from [`PortPool::claim`]
/// until the matching [`PortPool::free`].
pub struct PortPool {
    reserved: BTreeSet<u16>,
    range: Range<u16>,
    liveness_timeout: Duration,
    max_attempts: usize,
    rng: StdRng,
}

impl PortPool {
    pub fn new(range: Range<u16>, liveness_timeout: Duration, max_attempts: usize) -> Self {
        Self {
            reserved: BTreeSet::new(),
            range,
            liveness_timeout,
            max_attempts,
            rng: StdRng::from_entropy(),
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Marks a port as taken without checking it, e.g. the master's own.
    pub fn reserve(&mut self, port: u16) -> bool {
        self.reserved.insert(port)
    }

    /// Draws up to `max_attempts` random ports in range that nothing has
    /// reserved, and reserves all of them for one lobby.
    pub fn claim(&mut self, host: IpAddr) -> Result<PortClaim, PortError> {
        if self.range.is_empty() {
            return Err(PortError::PortExhausted { attempts: 0 });
        }

        let mut candidates = Vec::new();
        for _ in 0..self.max_attempts {
            let candidate = self.rng.gen_range(self.range.clone());
            if self.reserved.insert(candidate) {
                candidates.push(candidate);
            }
        }

        if candidates.is_empty() {
            return Err(PortError::PortExhausted {
                attempts: self.max_attempts,
            });
        }

        Ok(PortClaim {
            host,
            candidates,
            liveness_timeout: self.liveness_timeout,
        })
    }

    /// Returns a port to the pool. Returns `false` if it was not reserved.
    pub fn free(&mut self, port: u16) -> bool {
        self.reserved.remove(&port)
    }

    pub fn is_reserved(&self, port: u16) -> bool {
        self.reserved.contains(&port)
    }

    pub fn reserved_count(&self) -> usize {
        self.reserved.len()
    }
}

/// Candidate ports reserved in a [`PortPool`] for one lobby.
#[derive(Debug)]
pub struct PortClaim {
    host: IpAddr,
    candidates: Vec<u16>,
    liveness_timeout: Duration,
}

/// Result of settling a [`PortClaim`]. Every port in `unused` is still
/// reserved and must be freed by the pool's owner.
#[derive(Debug, PartialEq, Eq)]
pub struct ClaimOutcome {
    pub port: Result<u16, PortError>,
    pub unused: Vec<u16>,
}

impl PortClaim {
    pub fn candidates(&self) -> &[u16] {
        &self.candidates
    }

    /// Checks candidates in draw order and settles on the first one that
    /// is not already accepting connections on the claim's host.
    pub async fn settle(self) -> ClaimOutcome {
        let mut unused = Vec::with_capacity(self.candidates.len());
        let mut chosen = None;

        for (attempt, &candidate) in self.candidates.iter().enumerate() {
            if chosen.is_some() {
                unused.push(candidate);
                continue;
            }
            if is_live(self.host, candidate, self.liveness_timeout).await {
                debug!(port = candidate, attempt, "port already accepting connections");
                unused.push(candidate);
                continue;
            }
            chosen = Some(candidate);
        }

        let port = chosen.ok_or(PortError::PortExhausted {
            attempts: self.candidates.len(),
        });
        ClaimOutcome { port, unused }
    }
}

async fn is_live(host: IpAddr, port: u16, liveness_timeout: Duration) -> bool {
    matches!(
        timeout(liveness_timeout, TcpStream::connect((host, port))).await,
        Ok(Ok(_))
    )
}
