//! Message framing over a byte stream.
//!
//! `Legacy` framing has no delimiter: the receiver reads chunks of at most
//! `buffer_size` bytes and treats the first short read as the end of the
//! message. A payload whose length is an exact multiple of `buffer_size`
//! therefore leaves the receiver waiting for a chunk that never comes
//! until the peer writes again or disconnects. `LengthPrefixed` framing
//! avoids that by sending a big-endian `u32` length before each payload;
//! both ends must agree on the mode.

use std::io;

use clap::ValueEnum;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const DEFAULT_BUFFER_SIZE: usize = 1024;
/// Upper bound on a single length-prefixed payload.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum FramingMode {
    #[default]
    Legacy,
    LengthPrefixed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Framing {
    pub mode: FramingMode,
    pub buffer_size: usize,
}

impl Default for Framing {
    fn default() -> Self {
        Self {
            mode: FramingMode::Legacy,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

impl Framing {
    pub fn new(mode: FramingMode, buffer_size: usize) -> Self {
        Self { mode, buffer_size }
    }

    /// Reads one complete message. `Ok(None)` means the peer closed the
    /// stream before sending anything.
    pub async fn read_frame<R>(&self, reader: &mut R) -> io::Result<Option<Vec<u8>>>
    where
        R: AsyncRead + Unpin,
    {
        match self.mode {
            FramingMode::Legacy => self.read_short_terminated(reader).await,
            FramingMode::LengthPrefixed => read_length_prefixed(reader).await,
        }
    }

    pub async fn write_frame<W>(&self, writer: &mut W, payload: &[u8]) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        if self.mode == FramingMode::LengthPrefixed {
            if payload.len() > MAX_FRAME_LEN {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("payload of {} bytes exceeds frame limit", payload.len()),
                ));
            }
            let len = payload.len() as u32;
            writer.write_all(&len.to_be_bytes()).await?;
        }
        writer.write_all(payload).await?;
        writer.flush().await
    }

    async fn read_short_terminated<R>(&self, reader: &mut R) -> io::Result<Option<Vec<u8>>>
    where
        R: AsyncRead + Unpin,
    {
        let mut message = Vec::new();
        let mut chunk = vec![0u8; self.buffer_size];
        loop {
            let read = reader.read(&mut chunk).await?;
            if read == 0 {
                // EOF after full-size chunks still yields what arrived.
                return Ok((!message.is_empty()).then_some(message));
            }
            message.extend_from_slice(&chunk[..read]);
            if read < self.buffer_size {
                return Ok(Some(message));
            }
        }
    }
}

async fn read_length_prefixed<R>(reader: &mut R) -> io::Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit"),
        ));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

/// Decodes client text, dropping the line terminator a terminal or netcat appends.
pub fn frame_text(frame: &[u8]) -> String {
    String::from_utf8_lossy(frame)
        .trim_end_matches(['\r', '\n'])
        .to_string()
}
