//! The master directory server.
//!
//! Clients connect here first. A session task per client parses commands
//! and forwards anything touching shared state to the directory, which
//! lives inside the master's own accept loop. The lobby registry, the port
//! pool, the connected-client table and the running lobby tasks are only
//! mutated there. A successful `!join` or `!create` ends the master session
//! with a change-server envelope; the client reconnects to the lobby on its
//! own socket.
//!
//! Creating a lobby touches the network, so it runs in three steps: the
//! directory reserves a name and candidate ports, a spawned task checks
//! the ports and binds the listener, and the directory registers the
//! result when it comes back.

use std::{
    collections::{HashMap, HashSet},
    future::Future,
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    time::Duration,
};

use anyhow::{Context, Result, anyhow};
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream, tcp::OwnedWriteHalf},
    select,
    sync::{mpsc, oneshot, watch},
    task::{self, JoinError, JoinSet},
};
use tracing::{debug, info, warn};

use crate::{
    command::{HELP_TEXT, MasterCommand},
    config::ServerConfig,
    envelope::Envelope,
    error::{CommandError, CreateError},
    framing::{Framing, frame_text},
    lobby::{Lobby, LobbyConfig, LobbyReport},
    ports::{ClaimOutcome, PortClaim, PortPool},
    registry::{LobbyAddr, LobbyRegistry},
};

const REQUEST_CAPACITY: usize = 256;

/// Sent on connect. Names every command the master understands.
pub const WELCOME_TEXT: &str = "[main] You joined the main lobby! \
Commands: !help, !lobbies, !join <lobby>, !create <lobby>, !exit";
pub const UNKNOWN_COMMAND: &str = "unknown command";

type ClientId = u64;

pub struct Master {
    listener: TcpListener,
    config: ServerConfig,
}

impl Master {
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        config.validate()?;
        let listener = TcpListener::bind(config.listen)
            .await
            .with_context(|| format!("failed to bind {}", config.listen))?;
        Ok(Self { listener, config })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Master { listener, config } = self;
        let local = listener.local_addr()?;
        let (requests_tx, mut requests_rx) = mpsc::channel(REQUEST_CAPACITY);
        let mut directory = Directory::new(&config, local, requests_tx.clone());
        let (closing_tx, _) = watch::channel(false);
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let id = directory.connect(peer);
                        spawn_client_session(stream, peer, ClientContext {
                            id,
                            host: config.advertise_host.clone(),
                            framing: config.framing,
                            requests: requests_tx.clone(),
                            closing: closing_tx.subscribe(),
                        });
                    }
                    Err(err) => warn!(error = ?err, "failed to accept connection"),
                },
                Some(request) = requests_rx.recv() => directory.handle(request),
                Some(finished) = directory.lobbies.join_next_with_id(),
                    if !directory.lobbies.is_empty() =>
                {
                    directory.lobby_finished(finished);
                }
            }
        }

        info!("master shutting down");
        closing_tx.send_replace(true);
        directory.shutdown().await;
        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

enum DirectoryRequest {
    Lookup {
        name: String,
        respond_to: oneshot::Sender<Option<LobbyAddr>>,
    },
    Create {
        name: String,
        creator: SocketAddr,
        respond_to: oneshot::Sender<Result<LobbyAddr, CreateError>>,
    },
    /// A creation whose ports were checked off the accept loop.
    Settled {
        settled: SettledLobby,
        respond_to: oneshot::Sender<Result<LobbyAddr, CreateError>>,
    },
    List {
        respond_to: oneshot::Sender<Vec<String>>,
    },
    Disconnected {
        id: ClientId,
    },
}

/// Master-owned state. Only touched from the accept loop in [`Master::run_until`].
struct Directory {
    host: String,
    bind_ip: IpAddr,
    framing: Framing,
    first_member_timeout: Duration,
    registry: LobbyRegistry,
    /// Names reserved by creations still binding their listener.
    pending: HashSet<String>,
    ports: PortPool,
    lobbies: JoinSet<LobbyReport>,
    lobby_tasks: HashMap<task::Id, String>,
    clients: HashMap<ClientId, SocketAddr>,
    next_client: ClientId,
    requests: mpsc::Sender<DirectoryRequest>,
}

impl Directory {
    fn new(
        config: &ServerConfig,
        local: SocketAddr,
        requests: mpsc::Sender<DirectoryRequest>,
    ) -> Self {
        let mut ports = config.port_pool();
        ports.reserve(local.port());
        let main = LobbyAddr::new(config.advertise_host.clone(), local.port());
        Self {
            host: config.advertise_host.clone(),
            bind_ip: local.ip(),
            framing: config.framing,
            first_member_timeout: config.first_member_timeout,
            registry: LobbyRegistry::new(main),
            pending: HashSet::new(),
            ports,
            lobbies: JoinSet::new(),
            lobby_tasks: HashMap::new(),
            clients: HashMap::new(),
            next_client: 1,
            requests,
        }
    }

    fn connect(&mut self, peer: SocketAddr) -> ClientId {
        let id = self.next_client;
        self.next_client += 1;
        self.clients.insert(id, peer);
        info!(%peer, clients = self.clients.len(), "client connected");
        id
    }

    fn handle(&mut self, request: DirectoryRequest) {
        match request {
            DirectoryRequest::Lookup { name, respond_to } => {
                let _ = respond_to.send(self.registry.lookup(&name).cloned());
            }
            DirectoryRequest::Create {
                name,
                creator,
                respond_to,
            } => match self.begin_create(name, creator) {
                Ok(pending) => {
                    let requests = self.requests.clone();
                    tokio::spawn(async move {
                        let settled = pending.settle().await;
                        let request = DirectoryRequest::Settled {
                            settled,
                            respond_to,
                        };
                        let _ = requests.send(request).await;
                    });
                }
                Err(err) => {
                    let _ = respond_to.send(Err(err));
                }
            },
            DirectoryRequest::Settled {
                settled,
                respond_to,
            } => {
                let _ = respond_to.send(self.finish_create(settled));
            }
            DirectoryRequest::List { respond_to } => {
                let _ = respond_to.send(self.registry.names());
            }
            DirectoryRequest::Disconnected { id } => {
                if let Some(peer) = self.clients.remove(&id) {
                    info!(%peer, clients = self.clients.len(), "client left the master");
                }
            }
        }
    }

    /// Reserves the name and a set of candidate ports without waiting on
    /// the network.
    fn begin_create(
        &mut self,
        name: String,
        creator: SocketAddr,
    ) -> Result<PendingLobby, CreateError> {
        if self.registry.contains(&name) || self.pending.contains(&name) {
            return Err(CreateError::NameTaken(name));
        }

        let claim = self.ports.claim(liveness_host(self.bind_ip))?;
        debug!(lobby = %name, candidates = claim.candidates().len(), "claimed lobby ports");
        self.pending.insert(name.clone());
        Ok(PendingLobby {
            config: LobbyConfig {
                name,
                creator,
                host: self.host.clone(),
                framing: self.framing,
                first_member_timeout: self.first_member_timeout,
            },
            bind_ip: self.bind_ip,
            claim,
        })
    }

    /// Releases every port the creation does not keep, then registers and
    /// starts the lobby if its listener is bound.
    fn finish_create(&mut self, settled: SettledLobby) -> Result<LobbyAddr, CreateError> {
        let SettledLobby {
            name,
            chosen,
            unused,
            lobby,
        } = settled;
        self.pending.remove(&name);
        for port in unused {
            self.ports.free(port);
        }

        let lobby = match lobby {
            Ok(lobby) => lobby,
            Err(err) => {
                if let Some(port) = chosen {
                    self.ports.free(port);
                }
                return Err(err);
            }
        };

        let addr = lobby.addr().clone();
        if !self.registry.register(name.clone(), addr.clone(), lobby.handle()) {
            self.ports.free(addr.port);
            return Err(CreateError::NameTaken(name));
        }
        let task = self.lobbies.spawn(lobby.run());
        self.lobby_tasks.insert(task.id(), name.clone());
        info!(lobby = %name, %addr, reserved = self.ports.reserved_count(), "lobby created");
        Ok(addr)
    }

    /// Evicts the lobby and frees its port however its task ended.
    fn lobby_finished(&mut self, finished: Result<(task::Id, LobbyReport), JoinError>) {
        let (id, report) = match finished {
            Ok((id, report)) => (id, Ok(report)),
            Err(err) => (err.id(), Err(err)),
        };
        let Some(name) = self.lobby_tasks.remove(&id) else {
            warn!(task = %id, "finished task was not a known lobby");
            return;
        };

        let port = self.registry.evict(&name).map(|addr| addr.port);
        if let Some(port) = port {
            self.ports.free(port);
        }
        match report {
            Ok(report) => info!(lobby = %name, ?port, reason = ?report.reason, "lobby released"),
            Err(err) => warn!(lobby = %name, ?port, error = ?err, "lobby task failed"),
        }
    }

    async fn shutdown(&mut self) {
        let handles: Vec<_> = self.registry.handles().cloned().collect();
        for handle in &handles {
            debug!(lobby = handle.name(), addr = %handle.addr(), "closing lobby");
            handle.close().await;
        }
        while let Some(finished) = self.lobbies.join_next_with_id().await {
            self.lobby_finished(finished);
        }
    }
}

/// A creation that has a name and candidate ports but no listener yet.
struct PendingLobby {
    config: LobbyConfig,
    bind_ip: IpAddr,
    claim: PortClaim,
}

/// What [`PendingLobby::settle`] hands back to the directory.
struct SettledLobby {
    name: String,
    chosen: Option<u16>,
    unused: Vec<u16>,
    lobby: Result<Lobby, CreateError>,
}

impl PendingLobby {
    async fn settle(self) -> SettledLobby {
        let PendingLobby {
            config,
            bind_ip,
            claim,
        } = self;
        let name = config.name.clone();
        let ClaimOutcome { port, unused } = claim.settle().await;

        let (chosen, lobby) = match port {
            Ok(port) => {
                let lobby = Lobby::bind(config, SocketAddr::new(bind_ip, port))
                    .await
                    .map_err(|source| CreateError::Bind { port, source });
                (Some(port), lobby)
            }
            Err(err) => (None, Err(err.into())),
        };

        SettledLobby {
            name,
            chosen,
            unused,
            lobby,
        }
    }
}

/// Where to look for a live listener when the master binds a wildcard address.
fn liveness_host(bind_ip: IpAddr) -> IpAddr {
    match bind_ip {
        IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        ip => ip,
    }
}

struct ClientContext {
    id: ClientId,
    host: String,
    framing: Framing,
    requests: mpsc::Sender<DirectoryRequest>,
    closing: watch::Receiver<bool>,
}

impl ClientContext {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> DirectoryRequest,
    ) -> Result<T> {
        let (respond_to, response) = oneshot::channel();
        self.requests
            .send(make(respond_to))
            .await
            .map_err(|_| anyhow!("master is shutting down"))?;
        response.await.context("master dropped the request")
    }
}

/// What to send back, and whether the master session ends afterwards.
struct Reply {
    envelope: Envelope,
    ends_session: bool,
}

impl Reply {
    fn stay(envelope: Envelope) -> Self {
        Self {
            envelope,
            ends_session: false,
        }
    }

    fn end(envelope: Envelope) -> Self {
        Self {
            envelope,
            ends_session: true,
        }
    }
}

fn spawn_client_session(stream: TcpStream, peer: SocketAddr, ctx: ClientContext) {
    tokio::spawn(async move {
        let id = ctx.id;
        let requests = ctx.requests.clone();
        if let Err(err) = handle_connection(stream, peer, ctx).await {
            warn!(%peer, error = ?err, "client connection closed with error");
        }
        let _ = requests.send(DirectoryRequest::Disconnected { id }).await;
    });
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    mut ctx: ClientContext,
) -> Result<()> {
    let (mut reader, mut writer) = stream.into_split();
    send(&mut writer, ctx.framing, &Envelope::message(&ctx.host, WELCOME_TEXT)).await?;

    loop {
        let frame = select! {
            frame = ctx.framing.read_frame(&mut reader) => frame?,
            _ = ctx.closing.changed() => {
                send(&mut writer, ctx.framing, &Envelope::close(&ctx.host)).await?;
                break;
            }
        };
        let Some(frame) = frame else {
            debug!(%peer, "client disconnected");
            break;
        };

        let line = frame_text(&frame);
        let reply = dispatch(&line, peer, &ctx).await?;
        send(&mut writer, ctx.framing, &reply.envelope).await?;
        if reply.ends_session {
            break;
        }
    }

    if let Err(err) = writer.shutdown().await {
        debug!(%peer, error = ?err, "failed to shut down client writer");
    }
    Ok(())
}

async fn dispatch(line: &str, peer: SocketAddr, ctx: &ClientContext) -> Result<Reply> {
    let host = ctx.host.as_str();
    let command = match MasterCommand::parse(line) {
        Ok(command) => command,
        Err(err @ CommandError::Arity { .. }) => {
            warn!(%peer, error = %err, "command parameter error");
            return Ok(Reply::stay(Envelope::client_error(host, UNKNOWN_COMMAND)));
        }
        Err(err) => {
            debug!(%peer, error = %err, "unrecognized command");
            return Ok(Reply::stay(Envelope::client_error(host, UNKNOWN_COMMAND)));
        }
    };

    let reply = match command {
        MasterCommand::Help => Reply::stay(Envelope::message(host, HELP_TEXT)),
        MasterCommand::Exit => Reply::end(Envelope::close(host)),
        MasterCommand::Lobbies => {
            let names = ctx
                .request(|respond_to| DirectoryRequest::List { respond_to })
                .await?;
            Reply::stay(Envelope::message(
                host,
                format!("[lobbies] {}", names.join(", ")),
            ))
        }
        MasterCommand::Join { name } => {
            let found = ctx
                .request(|respond_to| DirectoryRequest::Lookup {
                    name: name.clone(),
                    respond_to,
                })
                .await?;
            match found {
                Some(addr) => Reply::end(Envelope::change_server(host, addr.host, addr.port)),
                None => Reply::stay(Envelope::client_error(
                    host,
                    format!("lobby '{name}' not found"),
                )),
            }
        }
        MasterCommand::Create { name } => {
            let created = ctx
                .request(|respond_to| DirectoryRequest::Create {
                    name,
                    creator: peer,
                    respond_to,
                })
                .await?;
            match created {
                Ok(addr) => Reply::end(Envelope::change_server(host, addr.host, addr.port)),
                Err(err) if err.is_client_error() => {
                    Reply::stay(Envelope::client_error(host, err.to_string()))
                }
                Err(err) => {
                    warn!(%peer, error = %err, "failed to create lobby");
                    Reply::stay(Envelope::server_error(host, err.to_string()))
                }
            }
        }
    };

    Ok(reply)
}

async fn send(writer: &mut OwnedWriteHalf, framing: Framing, envelope: &Envelope) -> Result<()> {
    let payload = envelope.encode()?;
    framing.write_frame(writer, &payload).await?;
    Ok(())
}
