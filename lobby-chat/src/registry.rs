use std::{collections::BTreeMap, fmt};

use crate::lobby::LobbyHandle;

pub const MAIN_LOBBY: &str = "main";

/// Where clients should connect to reach a lobby.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LobbyAddr {
    pub host: String,
    pub port: u16,
}

impl LobbyAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for LobbyAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

struct RegistryEntry {
    addr: LobbyAddr,
    handle: Option<LobbyHandle>,
}

/// Name → address table of every lobby the master knows about.
///
/// Seeded with [`MAIN_LOBBY`] pointing at the master itself, which is never
/// evicted. Other entries live from a successful `!create` until the lobby
/// reports that it closed.
pub struct LobbyRegistry {
    entries: BTreeMap<String, RegistryEntry>,
}

impl LobbyRegistry {
    pub fn new(main: LobbyAddr) -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(
            MAIN_LOBBY.to_string(),
            RegistryEntry {
                addr: main,
                handle: None,
            },
        );
        Self { entries }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn lookup(&self, name: &str) -> Option<&LobbyAddr> {
        self.entries.get(name).map(|entry| &entry.addr)
    }

    /// Returns `false` and leaves the table untouched if `name` is taken.
    pub fn register(&mut self, name: String, addr: LobbyAddr, handle: LobbyHandle) -> bool {
        if self.entries.contains_key(&name) {
            return false;
        }
        self.entries.insert(
            name,
            RegistryEntry {
                addr,
                handle: Some(handle),
            },
        );
        true
    }

    pub fn evict(&mut self, name: &str) -> Option<LobbyAddr> {
        if name == MAIN_LOBBY {
            return None;
        }
        self.entries.remove(name).map(|entry| entry.addr)
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn handles(&self) -> impl Iterator<Item = &LobbyHandle> {
        self.entries
            .values()
            .filter_map(|entry| entry.handle.as_ref())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
