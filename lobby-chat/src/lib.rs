//! Multi-room text chat: a master directory server that spins up lobby
//! servers on demand.
//!
//! A client connects to the master, creates or joins a lobby by name, and
//! is redirected to that lobby's own socket. Each lobby is a separate
//! broadcast domain with an optional password and an admin (its first
//! member) who can change the password or evict everyone.
//!
//! - [`cli`] parses the command line for master and client modes.
//! - [`config`] validates master settings.
//! - [`master`] accepts clients, dispatches commands and owns the lobby
//!   registry and port pool.
//! - [`lobby`] runs one chat room: admission, password gate, fan-out and
//!   admin commands.
//! - [`ports`] picks free ports for new lobbies.
//! - [`registry`] maps lobby names to addresses.
//! - [`envelope`] and [`framing`] implement the wire protocol.
//! - [`command`] parses `!`-prefixed commands.
//! - [`client`] is a terminal client that follows redirects.

pub mod cli;
pub mod client;
pub mod command;
pub mod config;
pub mod envelope;
pub mod error;
pub mod framing;
pub mod lobby;
pub mod master;
pub mod ports;
pub mod registry;
