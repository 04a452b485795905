use anyhow::{Context, Result, ensure};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin},
    net::{TcpStream, tcp::OwnedWriteHalf},
    select,
    sync::mpsc,
};
use tracing::{info, warn};

use crate::{
    cli::ClientArgs,
    envelope::{Body, Envelope},
    framing::{Framing, MAX_FRAME_LEN},
};

/// Where the client goes after a connection ends.
enum Next {
    Connect(String),
    Home,
    Quit,
}

pub async fn run(args: ClientArgs) -> Result<()> {
    let framing = client_framing(&args)?;
    let home = args.server;
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut target = home.clone();

    loop {
        let in_lobby = target != home;
        match run_connection(&target, framing, &mut stdin, in_lobby).await? {
            Next::Connect(next) => target = next,
            Next::Home => target = home.clone(),
            Next::Quit => break,
        }
    }

    Ok(())
}

fn client_framing(args: &ClientArgs) -> Result<Framing> {
    ensure!(
        (1..=MAX_FRAME_LEN).contains(&args.buffer_size),
        "buffer size must be between 1 and {MAX_FRAME_LEN} bytes"
    );
    Ok(Framing::new(args.framing, args.buffer_size))
}

async fn run_connection(
    target: &str,
    framing: Framing,
    stdin: &mut Lines<BufReader<Stdin>>,
    in_lobby: bool,
) -> Result<Next> {
    let stream = TcpStream::connect(target)
        .await
        .with_context(|| format!("failed to connect to {target}"))?;
    info!("connected to {}", target);

    let (reader, mut writer) = stream.into_split();
    let (envelopes_tx, mut envelopes) = mpsc::unbounded_channel();
    let receiver = tokio::spawn(async move {
        let mut reader = reader;
        while let Ok(Some(frame)) = framing.read_frame(&mut reader).await {
            let decoded = match Envelope::decode_all(&frame) {
                Ok(decoded) => decoded,
                Err(err) => {
                    warn!(error = %err, "discarding malformed payload");
                    continue;
                }
            };
            for envelope in decoded {
                if envelopes_tx.send(envelope).is_err() {
                    return;
                }
            }
        }
    });

    let mut exiting = false;
    let next = loop {
        select! {
            envelope = envelopes.recv() => {
                let Some(envelope) = envelope else {
                    write_stdout("*** server closed the connection").await?;
                    // Back to the master when a lobby lets us go.
                    break if in_lobby && !exiting { Next::Home } else { Next::Quit };
                };
                if let Some(next) = handle_envelope(envelope, in_lobby).await? {
                    break next;
                }
            }
            line = stdin.next_line() => {
                let Some(line) = line? else {
                    break Next::Quit;
                };
                let text = line.trim_end();
                if text.is_empty() {
                    continue;
                }
                exiting = text == "!exit";
                framing.write_frame(&mut writer, text.as_bytes()).await?;
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                break Next::Quit;
            }
        }
    };

    receiver.abort();
    shutdown_connection(&mut writer).await;
    Ok(next)
}

async fn handle_envelope(envelope: Envelope, in_lobby: bool) -> Result<Option<Next>> {
    match envelope.body {
        Body::Message { msg } => write_stdout(&msg).await?,
        Body::ChangeServer { host, port } => {
            write_stdout(&format!("*** moving to {host}:{port}")).await?;
            return Ok(Some(Next::Connect(format!("{host}:{port}"))));
        }
        Body::ClientError { msg } => write_stderr(&format!("!!! {msg}")).await?,
        Body::ServerError { msg } => write_stderr(&format!("!!! server error: {msg}")).await?,
        Body::Close => {
            write_stdout("*** connection closed by server").await?;
            let next = if in_lobby {
                Next::Home
            } else {
                Next::Quit
            };
            return Ok(Some(next));
        }
    }
    Ok(None)
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn shutdown_connection(writer: &mut OwnedWriteHalf) {
    if let Err(error) = writer.shutdown().await {
        warn!(?error, "failed to shutdown client writer cleanly");
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

async fn write_stderr(line: &str) -> io::Result<()> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(line.as_bytes()).await?;
    stderr.write_all(b"\n").await?;
    stderr.flush().await
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;
    use crate::cli::{Cli, Command};

    fn client_args(buffer_size: usize) -> ClientArgs {
        let buffer_size = buffer_size.to_string();
        let argv = ["lobby_chat", "client", "--buffer-size", buffer_size.as_str()];
        match Cli::try_parse_from(argv).expect("parse").command {
            Command::Client(args) => args,
            Command::Master(_) => panic!("expected client args"),
        }
    }

    #[test]
    fn buffer_size_is_bounded_by_the_frame_limit() {
        assert!(client_framing(&client_args(0)).is_err());
        assert!(client_framing(&client_args(MAX_FRAME_LEN + 1)).is_err());

        let framing = client_framing(&client_args(MAX_FRAME_LEN)).expect("framing");
        assert_eq!(framing.buffer_size, MAX_FRAME_LEN);
    }
}
