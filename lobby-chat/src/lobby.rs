//! A lobby is an independent chat room with its own listening socket.
//!
//! One task owns the room: it accepts connections and applies
//! [`LobbyEvent`]s sent by member sessions, so membership, the password
//! and the admin binding are only ever touched from that task. Each
//! connection gets a session task that reads frames and a writer task that
//! drains the member's outbox, so a slow recipient never holds up the
//! sender or the room.
//!
//! Phases run `Starting → Accepting → Closing → Closed`. The room stops
//! when its last member leaves, when the admin sends `!kickall`, or when
//! [`LobbyHandle::close`] is called. A room nobody joins gives up after
//! [`LobbyConfig::first_member_timeout`].

use std::{collections::BTreeMap, io, net::SocketAddr, time::Duration};

use anyhow::Result;
use tokio::{
    io::AsyncWriteExt,
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    sync::{mpsc, oneshot, watch},
};
use tracing::{debug, info, warn};

use crate::{
    command::{AdminCommand, SIGIL, is_departure},
    envelope::Envelope,
    framing::{Framing, frame_text},
    registry::LobbyAddr,
};

const EVENT_CAPACITY: usize = 256;
pub const DEFAULT_FIRST_MEMBER_TIMEOUT: Duration = Duration::from_secs(60);

type MemberId = u64;
type Outbox = mpsc::UnboundedSender<Envelope>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LobbyPhase {
    Starting,
    Accepting,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The last member left.
    Empty,
    /// The admin sent `!kickall`.
    KickAll,
    /// [`LobbyHandle::close`] was called.
    Closed,
    /// Nobody was admitted before the first-member timeout.
    Abandoned,
}

#[derive(Debug, Clone)]
pub struct LobbyConfig {
    pub name: String,
    /// Address of the client that issued `!create`.
    pub creator: SocketAddr,
    /// Host advertised in envelopes and redirects.
    pub host: String,
    pub framing: Framing,
    /// How long the room waits for its first member before stopping.
    pub first_member_timeout: Duration,
}

/// Returned by [`Lobby::run`] once the listener is closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LobbyReport {
    pub name: String,
    pub port: u16,
    pub reason: StopReason,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LobbySnapshot {
    pub name: String,
    /// Usernames in admission order.
    pub members: Vec<String>,
    pub admin: Option<String>,
    pub password_protected: bool,
}

enum LobbyEvent {
    Join {
        peer: SocketAddr,
        outbox: Outbox,
        respond_to: oneshot::Sender<Admission>,
    },
    Said {
        id: MemberId,
        text: String,
    },
    Left {
        id: MemberId,
    },
    Close,
    Snapshot {
        respond_to: oneshot::Sender<LobbySnapshot>,
    },
}

struct Admission {
    id: MemberId,
    username: String,
}

pub struct Lobby {
    config: LobbyConfig,
    addr: LobbyAddr,
    listener: TcpListener,
    events_tx: mpsc::Sender<LobbyEvent>,
    events_rx: mpsc::Receiver<LobbyEvent>,
    phase: watch::Sender<LobbyPhase>,
}

impl Lobby {
    /// Binds the lobby's listener. Port 0 picks an ephemeral port; the
    /// advertised address always carries the port actually bound.
    pub async fn bind(config: LobbyConfig, bind_addr: SocketAddr) -> io::Result<Self> {
        let (phase, _) = watch::channel(LobbyPhase::Starting);
        let listener = TcpListener::bind(bind_addr).await?;
        let addr = LobbyAddr::new(config.host.clone(), listener.local_addr()?.port());
        let (events_tx, events_rx) = mpsc::channel(EVENT_CAPACITY);

        Ok(Self {
            config,
            addr,
            listener,
            events_tx,
            events_rx,
            phase,
        })
    }

    pub fn addr(&self) -> &LobbyAddr {
        &self.addr
    }

    pub fn handle(&self) -> LobbyHandle {
        LobbyHandle {
            name: self.config.name.clone(),
            addr: self.addr.clone(),
            events: self.events_tx.clone(),
            phase: self.phase.subscribe(),
        }
    }

    /// Runs the room until it stops, then releases the listener.
    pub async fn run(self) -> LobbyReport {
        let Lobby {
            config,
            addr,
            listener,
            events_tx,
            mut events_rx,
            phase,
        } = self;
        let (stop_tx, _) = watch::channel(false);
        let (password_tx, _) = watch::channel(String::new());
        let mut room = Room::new(&config, password_tx);
        let abandoned = tokio::time::sleep(config.first_member_timeout);
        tokio::pin!(abandoned);

        phase.send_replace(LobbyPhase::Accepting);
        info!(
            lobby = %config.name,
            creator = %config.creator,
            %addr,
            "lobby accepting members"
        );

        let reason = loop {
            select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(lobby = %config.name, %peer, "connection accepted");
                        spawn_session(stream, peer, SessionContext {
                            lobby: config.name.clone(),
                            host: config.host.clone(),
                            framing: config.framing,
                            events: events_tx.clone(),
                            stop: stop_tx.subscribe(),
                            password: room.password.subscribe(),
                        });
                    }
                    Err(err) => {
                        warn!(lobby = %config.name, error = ?err, "failed to accept connection");
                    }
                },
                Some(event) = events_rx.recv() => {
                    if let Some(reason) = room.apply(event) {
                        break reason;
                    }
                }
                _ = &mut abandoned, if room.admin.is_none() => {
                    info!(lobby = %config.name, "nobody joined in time");
                    break StopReason::Abandoned;
                }
            }
        };

        phase.send_replace(LobbyPhase::Closing);
        info!(lobby = %config.name, ?reason, "lobby closing");
        stop_tx.send_replace(true);
        room.dismiss_all();
        drop(events_rx);
        drop(listener);
        phase.send_replace(LobbyPhase::Closed);
        info!(lobby = %config.name, port = addr.port, "lobby closed");

        LobbyReport {
            name: config.name,
            port: addr.port,
            reason,
        }
    }
}

/// Cheap, cloneable access to a running lobby.
#[derive(Clone)]
pub struct LobbyHandle {
    name: String,
    addr: LobbyAddr,
    events: mpsc::Sender<LobbyEvent>,
    phase: watch::Receiver<LobbyPhase>,
}

impl LobbyHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn addr(&self) -> &LobbyAddr {
        &self.addr
    }

    pub fn phase(&self) -> LobbyPhase {
        *self.phase.borrow()
    }

    /// Asks the lobby to stop. A no-op if it already stopped.
    pub async fn close(&self) {
        let _ = self.events.send(LobbyEvent::Close).await;
    }

    /// `None` once the lobby has stopped.
    pub async fn snapshot(&self) -> Option<LobbySnapshot> {
        let (respond_to, response) = oneshot::channel();
        self.events
            .send(LobbyEvent::Snapshot { respond_to })
            .await
            .ok()?;
        response.await.ok()
    }

    pub async fn wait_closed(&self) {
        let mut phase = self.phase.clone();
        let _ = phase.wait_for(|phase| *phase == LobbyPhase::Closed).await;
    }
}

struct Member {
    username: String,
    peer: SocketAddr,
    outbox: Outbox,
}

/// State owned by the lobby task.
struct Room {
    name: String,
    host: String,
    members: BTreeMap<MemberId, Member>,
    /// First member ever admitted; not reassigned when they leave.
    admin: Option<MemberId>,
    user_counter: MemberId,
    password: watch::Sender<String>,
}

impl Room {
    fn new(config: &LobbyConfig, password: watch::Sender<String>) -> Self {
        Self {
            name: config.name.clone(),
            host: config.host.clone(),
            members: BTreeMap::new(),
            admin: None,
            user_counter: 0,
            password,
        }
    }

    fn apply(&mut self, event: LobbyEvent) -> Option<StopReason> {
        match event {
            LobbyEvent::Join {
                peer,
                outbox,
                respond_to,
            } => self.admit(peer, outbox, respond_to),
            LobbyEvent::Said { id, text } => self.said(id, text),
            LobbyEvent::Left { id } => self.depart(id),
            LobbyEvent::Close => Some(StopReason::Closed),
            LobbyEvent::Snapshot { respond_to } => {
                let _ = respond_to.send(self.snapshot());
                None
            }
        }
    }

    fn admit(
        &mut self,
        peer: SocketAddr,
        outbox: Outbox,
        respond_to: oneshot::Sender<Admission>,
    ) -> Option<StopReason> {
        let id = self.user_counter;
        self.user_counter += 1;
        let username = username_for(id);
        let is_admin = *self.admin.get_or_insert(id) == id;

        let ack = if is_admin {
            format!("[{}] joined as {username} (admin)", self.name)
        } else {
            format!("[{}] joined as {username}", self.name)
        };
        let _ = outbox.send(Envelope::message(&self.host, ack));

        info!(lobby = %self.name, %peer, %username, is_admin, "member admitted");
        self.members.insert(
            id,
            Member {
                username: username.clone(),
                peer,
                outbox,
            },
        );

        if respond_to.send(Admission { id, username }).is_err() {
            return self.depart(id);
        }
        None
    }

    fn said(&mut self, id: MemberId, text: String) -> Option<StopReason> {
        let username = self.members.get(&id)?.username.clone();

        if self.admin == Some(id) && text.starts_with(SIGIL) {
            if let Some(command) = AdminCommand::parse(&text) {
                return self.run_admin_command(command);
            }
        }

        self.broadcast(id, &format!("{username} >> {text}"));
        None
    }

    fn run_admin_command(
        &mut self,
        command: Result<AdminCommand, crate::error::CommandError>,
    ) -> Option<StopReason> {
        match command {
            Ok(AdminCommand::SetPassword { password }) => {
                info!(lobby = %self.name, "admin changed the lobby password");
                self.password.send_replace(password);
                None
            }
            Ok(AdminCommand::KickAll) => {
                info!(lobby = %self.name, "admin kicked everyone");
                Some(StopReason::KickAll)
            }
            Err(err) => {
                warn!(lobby = %self.name, error = %err, "invalid admin command");
                None
            }
        }
    }

    /// Fan-out to every member except the sender.
    fn broadcast(&self, from: MemberId, line: &str) {
        for (id, member) in &self.members {
            if *id == from {
                continue;
            }
            if member
                .outbox
                .send(Envelope::message(&self.host, line))
                .is_err()
            {
                debug!(
                    lobby = %self.name,
                    username = %member.username,
                    "dropping message for departed member"
                );
            }
        }
    }

    fn depart(&mut self, id: MemberId) -> Option<StopReason> {
        let member = self.members.remove(&id)?;
        info!(
            lobby = %self.name,
            peer = %member.peer,
            username = %member.username,
            "member left"
        );
        self.members.is_empty().then_some(StopReason::Empty)
    }

    fn dismiss_all(&mut self) {
        for member in self.members.values() {
            let _ = member.outbox.send(Envelope::close(&self.host));
        }
        self.members.clear();
    }

    fn snapshot(&self) -> LobbySnapshot {
        LobbySnapshot {
            name: self.name.clone(),
            members: self
                .members
                .values()
                .map(|member| member.username.clone())
                .collect(),
            admin: self.admin.map(username_for),
            password_protected: !self.password.borrow().is_empty(),
        }
    }
}

fn username_for(id: MemberId) -> String {
    format!("user-{id}")
}

struct SessionContext {
    lobby: String,
    host: String,
    framing: Framing,
    events: mpsc::Sender<LobbyEvent>,
    stop: watch::Receiver<bool>,
    password: watch::Receiver<String>,
}

fn spawn_session(stream: TcpStream, peer: SocketAddr, ctx: SessionContext) {
    tokio::spawn(async move {
        if let Err(err) = run_session(stream, peer, ctx).await {
            debug!(%peer, error = ?err, "lobby session ended with error");
        }
    });
}

async fn run_session(
    stream: TcpStream,
    peer: SocketAddr,
    mut ctx: SessionContext,
) -> Result<()> {
    let (mut reader, writer) = stream.into_split();
    let (outbox, inbox) = mpsc::unbounded_channel();
    let writer_task = tokio::spawn(run_writer(writer, inbox, ctx.framing));

    let result = serve_member(&mut reader, peer, &outbox, &mut ctx).await;

    drop(outbox);
    let _ = writer_task.await;
    result
}

async fn serve_member(
    reader: &mut OwnedReadHalf,
    peer: SocketAddr,
    outbox: &Outbox,
    ctx: &mut SessionContext,
) -> Result<()> {
    if !authenticate(reader, peer, outbox, ctx).await? {
        return Ok(());
    }

    let (respond_to, admitted) = oneshot::channel();
    let join = LobbyEvent::Join {
        peer,
        outbox: outbox.clone(),
        respond_to,
    };
    if ctx.events.send(join).await.is_err() {
        return Ok(());
    }
    // The lobby drops `respond_to` if it stops before admitting us.
    let Ok(Admission { id, username }) = admitted.await else {
        return Ok(());
    };

    loop {
        select! {
            frame = ctx.framing.read_frame(reader) => match frame {
                Ok(Some(frame)) => {
                    let text = frame_text(&frame);
                    if is_departure(&text) {
                        debug!(lobby = %ctx.lobby, %username, "member asked to leave");
                        break;
                    }
                    if ctx.events.send(LobbyEvent::Said { id, text }).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    debug!(lobby = %ctx.lobby, %username, error = ?err, "read failed");
                    break;
                }
            },
            _ = ctx.stop.changed() => break,
        }
    }

    let _ = ctx.events.send(LobbyEvent::Left { id }).await;
    Ok(())
}

/// Returns `false` if the session must end without admission.
async fn authenticate(
    reader: &mut OwnedReadHalf,
    peer: SocketAddr,
    outbox: &Outbox,
    ctx: &mut SessionContext,
) -> Result<bool> {
    let expected = ctx.password.borrow().clone();
    if expected.is_empty() {
        return Ok(true);
    }

    let _ = outbox.send(Envelope::message(
        &ctx.host,
        format!("[{}] enter password", ctx.lobby),
    ));
    let attempt = select! {
        frame = ctx.framing.read_frame(reader) => frame?,
        _ = ctx.stop.changed() => return Ok(false),
    };
    let Some(attempt) = attempt else {
        return Ok(false);
    };

    if frame_text(&attempt) == expected {
        return Ok(true);
    }

    info!(lobby = %ctx.lobby, %peer, "rejected connection with incorrect password");
    let _ = outbox.send(Envelope::client_error(&ctx.host, "incorrect password"));
    Ok(false)
}

async fn run_writer(
    mut writer: OwnedWriteHalf,
    mut inbox: mpsc::UnboundedReceiver<Envelope>,
    framing: Framing,
) {
    while let Some(envelope) = inbox.recv().await {
        let payload = match envelope.encode() {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, "failed to encode envelope");
                continue;
            }
        };
        if let Err(err) = framing.write_frame(&mut writer, &payload).await {
            debug!(error = ?err, "failed to deliver envelope");
            break;
        }
    }

    if let Err(err) = writer.shutdown().await {
        debug!(error = ?err, "failed to shut down member writer");
    }
}
