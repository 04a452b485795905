use std::{collections::VecDeque, net::SocketAddr, time::Duration};

use anyhow::{Result, bail};
use lobby_chat::{
    envelope::{Body, Envelope},
    framing::{Framing, FramingMode},
    lobby::{Lobby, LobbyConfig, LobbyHandle, LobbyPhase, LobbyReport, StopReason},
};
use tokio::{
    io::AsyncWriteExt,
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    task::JoinHandle,
    time::{sleep, timeout},
};

const READ_TIMEOUT: Duration = Duration::from_secs(2);
const QUIET_PERIOD: Duration = Duration::from_millis(200);
const HOST: &str = "127.0.0.1";

struct Member {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    framing: Framing,
    /// Envelopes that arrived in the same frame as an earlier one.
    pending: VecDeque<Envelope>,
}

impl Member {
    async fn connect(addr: SocketAddr, framing: Framing) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader,
            writer,
            framing,
            pending: VecDeque::new(),
        })
    }

    /// Connects and consumes the admission acknowledgement.
    async fn join(addr: SocketAddr, framing: Framing, expected_ack: &str) -> Result<Self> {
        let mut member = Self::connect(addr, framing).await?;
        assert_eq!(member.recv_msg().await?, expected_ack);
        Ok(member)
    }

    async fn send(&mut self, text: &str) -> Result<()> {
        self.framing
            .write_frame(&mut self.writer, text.as_bytes())
            .await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Envelope> {
        while self.pending.is_empty() {
            match timeout(READ_TIMEOUT, self.framing.read_frame(&mut self.reader)).await?? {
                Some(frame) => self.pending.extend(Envelope::decode_all(&frame)?),
                None => bail!("connection closed"),
            }
        }
        match self.pending.pop_front() {
            Some(envelope) => Ok(envelope),
            None => bail!("no envelope buffered"),
        }
    }

    async fn recv_msg(&mut self) -> Result<String> {
        match self.recv().await?.body {
            Body::Message { msg } => Ok(msg),
            other => bail!("expected a message, got {other:?}"),
        }
    }

    async fn expect_silence(&mut self) -> Result<()> {
        if let Some(envelope) = self.pending.front() {
            bail!("expected silence, got {envelope:?}");
        }
        match timeout(QUIET_PERIOD, self.framing.read_frame(&mut self.reader)).await {
            Err(_) => Ok(()),
            Ok(frame) => bail!("expected silence, got {frame:?}"),
        }
    }

    async fn expect_closed(&mut self) -> Result<()> {
        if let Some(envelope) = self.pending.front() {
            bail!("expected close, got {envelope:?}");
        }
        match timeout(READ_TIMEOUT, self.framing.read_frame(&mut self.reader)).await?? {
            None => Ok(()),
            Some(frame) => bail!("expected close, got {:?}", String::from_utf8_lossy(&frame)),
        }
    }
}

fn lobby_config(framing: Framing) -> Result<LobbyConfig> {
    Ok(LobbyConfig {
        name: "room1".into(),
        creator: "127.0.0.1:40000".parse()?,
        host: HOST.into(),
        framing,
        first_member_timeout: Duration::from_secs(30),
    })
}

async fn spawn_lobby(
    framing: Framing,
) -> Result<(LobbyHandle, SocketAddr, JoinHandle<LobbyReport>)> {
    start_lobby(lobby_config(framing)?).await
}

async fn start_lobby(
    config: LobbyConfig,
) -> Result<(LobbyHandle, SocketAddr, JoinHandle<LobbyReport>)> {
    let lobby = Lobby::bind(config, "127.0.0.1:0".parse()?).await?;
    let handle = lobby.handle();
    let addr: SocketAddr = format!("{HOST}:{}", lobby.addr().port).parse()?;
    assert_eq!(handle.phase(), LobbyPhase::Starting);
    let task = tokio::spawn(lobby.run());
    Ok((handle, addr, task))
}

async fn wait_for_report(task: JoinHandle<LobbyReport>) -> Result<LobbyReport> {
    Ok(timeout(READ_TIMEOUT, task).await??)
}

#[tokio::test]
async fn fan_out_skips_the_sender() -> Result<()> {
    let framing = Framing::default();
    let (handle, addr, _task) = spawn_lobby(framing).await?;

    let mut first = Member::join(addr, framing, "[room1] joined as user-0 (admin)").await?;
    let mut second = Member::join(addr, framing, "[room1] joined as user-1").await?;
    let mut third = Member::join(addr, framing, "[room1] joined as user-2").await?;

    second.send("hello").await?;

    assert_eq!(first.recv_msg().await?, "user-1 >> hello");
    assert_eq!(third.recv_msg().await?, "user-1 >> hello");
    second.expect_silence().await?;

    let snapshot = handle.snapshot().await.expect("lobby running");
    assert_eq!(snapshot.members, vec!["user-0", "user-1", "user-2"]);
    assert_eq!(snapshot.admin.as_deref(), Some("user-0"));
    Ok(())
}

#[tokio::test]
async fn messages_from_one_sender_arrive_in_order() -> Result<()> {
    let framing = Framing::default();
    let (_handle, addr, _task) = spawn_lobby(framing).await?;

    let mut listener = Member::join(addr, framing, "[room1] joined as user-0 (admin)").await?;
    let mut talker = Member::join(addr, framing, "[room1] joined as user-1").await?;

    for n in 0..5 {
        talker.send(&format!("line {n}")).await?;
        assert_eq!(listener.recv_msg().await?, format!("user-1 >> line {n}"));
    }
    Ok(())
}

#[tokio::test]
async fn simultaneous_senders_both_reach_the_listener() -> Result<()> {
    let framing = Framing::default();
    let (_handle, addr, _task) = spawn_lobby(framing).await?;

    let mut listener = Member::join(addr, framing, "[room1] joined as user-0 (admin)").await?;
    let mut left = Member::join(addr, framing, "[room1] joined as user-1").await?;
    let mut right = Member::join(addr, framing, "[room1] joined as user-2").await?;

    let (sent_left, sent_right) = tokio::join!(left.send("one"), right.send("two"));
    sent_left?;
    sent_right?;

    // Both relays may land in one read; each must still be delivered.
    let mut heard = vec![listener.recv_msg().await?, listener.recv_msg().await?];
    heard.sort();
    assert_eq!(heard, vec!["user-1 >> one", "user-2 >> two"]);
    assert_eq!(left.recv_msg().await?, "user-2 >> two");
    assert_eq!(right.recv_msg().await?, "user-1 >> one");
    Ok(())
}

#[tokio::test]
async fn lone_member_hears_nothing_back() -> Result<()> {
    let framing = Framing::default();
    let (_handle, addr, _task) = spawn_lobby(framing).await?;

    let mut alone = Member::join(addr, framing, "[room1] joined as user-0 (admin)").await?;
    alone.send("hello").await?;
    alone.expect_silence().await?;
    Ok(())
}

#[tokio::test]
async fn wrong_password_is_never_admitted() -> Result<()> {
    let framing = Framing::default();
    let (handle, addr, _task) = spawn_lobby(framing).await?;

    let mut admin = Member::join(addr, framing, "[room1] joined as user-0 (admin)").await?;
    admin.send("!set_password secret").await?;
    wait_until_protected(&handle).await?;

    let mut intruder = Member::connect(addr, framing).await?;
    assert_eq!(intruder.recv_msg().await?, "[room1] enter password");
    intruder.send("guess").await?;
    assert_eq!(
        intruder.recv().await?,
        Envelope::client_error(HOST, "incorrect password")
    );
    intruder.expect_closed().await?;

    let snapshot = handle.snapshot().await.expect("lobby running");
    assert_eq!(snapshot.members, vec!["user-0"]);

    let mut guest = Member::connect(addr, framing).await?;
    assert_eq!(guest.recv_msg().await?, "[room1] enter password");
    guest.send("secret").await?;
    assert_eq!(guest.recv_msg().await?, "[room1] joined as user-1");

    admin.send("welcome").await?;
    assert_eq!(guest.recv_msg().await?, "user-0 >> welcome");
    Ok(())
}

#[tokio::test]
async fn admin_commands_from_others_are_chat() -> Result<()> {
    let framing = Framing::default();
    let (handle, addr, _task) = spawn_lobby(framing).await?;

    let mut admin = Member::join(addr, framing, "[room1] joined as user-0 (admin)").await?;
    let mut other = Member::join(addr, framing, "[room1] joined as user-1").await?;

    other.send("!kickall").await?;
    assert_eq!(admin.recv_msg().await?, "user-1 >> !kickall");

    other.send("!set_password mine").await?;
    assert_eq!(admin.recv_msg().await?, "user-1 >> !set_password mine");

    let snapshot = handle.snapshot().await.expect("lobby still running");
    assert!(!snapshot.password_protected);
    assert_eq!(snapshot.members.len(), 2);
    Ok(())
}

#[tokio::test]
async fn admin_set_password_is_not_echoed() -> Result<()> {
    let framing = Framing::default();
    let (handle, addr, _task) = spawn_lobby(framing).await?;

    let mut admin = Member::join(addr, framing, "[room1] joined as user-0 (admin)").await?;
    let mut other = Member::join(addr, framing, "[room1] joined as user-1").await?;

    admin.send("!set_password secret").await?;
    wait_until_protected(&handle).await?;
    admin.expect_silence().await?;
    other.expect_silence().await?;
    Ok(())
}

#[tokio::test]
async fn kickall_closes_everyone() -> Result<()> {
    let framing = Framing::default();
    let (handle, addr, task) = spawn_lobby(framing).await?;

    let mut admin = Member::join(addr, framing, "[room1] joined as user-0 (admin)").await?;
    let mut other = Member::join(addr, framing, "[room1] joined as user-1").await?;

    admin.send("!kickall").await?;

    assert_eq!(other.recv().await?, Envelope::close(HOST));
    assert_eq!(admin.recv().await?, Envelope::close(HOST));
    other.expect_closed().await?;
    admin.expect_closed().await?;

    let report = wait_for_report(task).await?;
    assert_eq!(report.reason, StopReason::KickAll);
    assert_eq!(report.port, addr.port());
    assert_eq!(handle.phase(), LobbyPhase::Closed);
    Ok(())
}

#[tokio::test]
async fn lobby_closes_when_the_last_member_leaves() -> Result<()> {
    let framing = Framing::default();
    let (handle, addr, task) = spawn_lobby(framing).await?;

    let mut first = Member::join(addr, framing, "[room1] joined as user-0 (admin)").await?;
    let mut second = Member::join(addr, framing, "[room1] joined as user-1").await?;
    let mut third = Member::join(addr, framing, "[room1] joined as user-2").await?;

    first.send("!leave").await?;
    first.expect_closed().await?;
    second.send("!exit").await?;
    second.expect_closed().await?;
    assert_eq!(handle.phase(), LobbyPhase::Accepting);

    third.writer.shutdown().await?;
    drop(third);

    let report = wait_for_report(task).await?;
    assert_eq!(report.reason, StopReason::Empty);
    handle.wait_closed().await;
    assert!(handle.snapshot().await.is_none());
    assert!(TcpStream::connect(addr).await.is_err());
    Ok(())
}

#[tokio::test]
async fn explicit_close_dismisses_members() -> Result<()> {
    let framing = Framing::default();
    let (handle, addr, task) = spawn_lobby(framing).await?;

    let mut member = Member::join(addr, framing, "[room1] joined as user-0 (admin)").await?;
    handle.close().await;

    assert_eq!(member.recv().await?, Envelope::close(HOST));
    member.expect_closed().await?;
    assert_eq!(wait_for_report(task).await?.reason, StopReason::Closed);
    Ok(())
}

#[tokio::test]
async fn length_prefixed_lobby_relays() -> Result<()> {
    let framing = Framing::new(FramingMode::LengthPrefixed, 16);
    let (_handle, addr, _task) = spawn_lobby(framing).await?;

    let mut first = Member::join(addr, framing, "[room1] joined as user-0 (admin)").await?;
    let mut second = Member::join(addr, framing, "[room1] joined as user-1").await?;

    let long = "x".repeat(64);
    second.send(&long).await?;
    assert_eq!(first.recv_msg().await?, format!("user-1 >> {long}"));
    Ok(())
}

async fn wait_until_protected(handle: &LobbyHandle) -> Result<()> {
    for _ in 0..40 {
        if let Some(snapshot) = handle.snapshot().await {
            if snapshot.password_protected {
                return Ok(());
            }
        }
        sleep(Duration::from_millis(25)).await;
    }
    bail!("password was never set")
}

#[tokio::test]
async fn unjoined_lobby_gives_up() -> Result<()> {
    let mut config = lobby_config(Framing::default())?;
    config.first_member_timeout = Duration::from_millis(100);
    let (handle, addr, task) = start_lobby(config).await?;

    assert_eq!(wait_for_report(task).await?.reason, StopReason::Abandoned);
    handle.wait_closed().await;
    assert!(TcpStream::connect(addr).await.is_err());
    Ok(())
}

#[tokio::test]
async fn admitted_lobby_outlives_the_first_member_timeout() -> Result<()> {
    let framing = Framing::default();
    let mut config = lobby_config(framing)?;
    config.first_member_timeout = Duration::from_millis(100);
    let (handle, addr, _task) = start_lobby(config).await?;

    let mut admin = Member::join(addr, framing, "[room1] joined as user-0 (admin)").await?;
    sleep(Duration::from_millis(300)).await;

    assert_eq!(handle.phase(), LobbyPhase::Accepting);
    let mut other = Member::join(addr, framing, "[room1] joined as user-1").await?;
    other.send("still here").await?;
    assert_eq!(admin.recv_msg().await?, "user-1 >> still here");
    Ok(())
}
