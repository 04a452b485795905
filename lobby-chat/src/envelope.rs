//! Server-to-client response envelopes.
//!
//! Every response travels as a JSON object of the shape
//! `{"code": <int>, "host": <string>, ...}` where the code decides which
//! extra field is present:
//!
//! | code | meaning        | field                      |
//! |------|----------------|----------------------------|
//! | 1    | message        | `msg`                      |
//! | 2    | change server  | `connection: [host, port]` |
//! | 3    | client error   | `msg`                      |
//! | 4    | server error   | `msg`                      |
//! | 5    | close          | none                       |
//!
//! Clients send plain UTF-8 text back, never JSON.

use serde::{Deserialize, Serialize};

use crate::error::{InvalidEnvelope, ProtocolError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResponseCode {
    Message = 1,
    ChangeServer = 2,
    ClientError = 3,
    ServerError = 4,
    Close = 5,
}

/// Payload of an envelope, one variant per response code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Message { msg: String },
    ChangeServer { host: String, port: u16 },
    ClientError { msg: String },
    ServerError { msg: String },
    Close,
}

impl Body {
    pub fn code(&self) -> ResponseCode {
        match self {
            Body::Message { .. } => ResponseCode::Message,
            Body::ChangeServer { .. } => ResponseCode::ChangeServer,
            Body::ClientError { .. } => ResponseCode::ClientError,
            Body::ServerError { .. } => ResponseCode::ServerError,
            Body::Close => ResponseCode::Close,
        }
    }
}

/// A response stamped with the host of the server that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WireEnvelope", into = "WireEnvelope")]
pub struct Envelope {
    pub host: String,
    pub body: Body,
}

impl Envelope {
    pub fn new(host: impl Into<String>, body: Body) -> Self {
        Self {
            host: host.into(),
            body,
        }
    }

    pub fn message(host: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::new(host, Body::Message { msg: msg.into() })
    }

    pub fn change_server(
        host: impl Into<String>,
        target_host: impl Into<String>,
        port: u16,
    ) -> Self {
        Self::new(
            host,
            Body::ChangeServer {
                host: target_host.into(),
                port,
            },
        )
    }

    pub fn client_error(host: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::new(host, Body::ClientError { msg: msg.into() })
    }

    pub fn server_error(host: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::new(host, Body::ServerError { msg: msg.into() })
    }

    pub fn close(host: impl Into<String>) -> Self {
        Self::new(host, Body::Close)
    }

    pub fn code(&self) -> ResponseCode {
        self.body.code()
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Decodes every envelope in a frame.
    ///
    /// Legacy framing has no delimiter, so envelopes written back to back
    /// can arrive as a single frame of concatenated JSON objects.
    pub fn decode_all(bytes: &[u8]) -> Result<Vec<Self>, ProtocolError> {
        let envelopes = serde_json::Deserializer::from_slice(bytes)
            .into_iter::<Envelope>()
            .collect::<Result<Vec<_>, _>>()?;
        Ok(envelopes)
    }
}

#[derive(Serialize, Deserialize)]
struct WireEnvelope {
    code: u8,
    host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    msg: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    connection: Option<(String, u16)>,
}

impl From<Envelope> for WireEnvelope {
    fn from(envelope: Envelope) -> Self {
        let code = envelope.code() as u8;
        let (msg, connection) = match envelope.body {
            Body::Message { msg } | Body::ClientError { msg } | Body::ServerError { msg } => {
                (Some(msg), None)
            }
            Body::ChangeServer { host, port } => (None, Some((host, port))),
            Body::Close => (None, None),
        };
        WireEnvelope {
            code,
            host: envelope.host,
            msg,
            connection,
        }
    }
}

impl TryFrom<WireEnvelope> for Envelope {
    type Error = InvalidEnvelope;

    fn try_from(wire: WireEnvelope) -> Result<Self, Self::Error> {
        let WireEnvelope {
            code,
            host,
            msg,
            connection,
        } = wire;
        let missing = |field| InvalidEnvelope::MissingField { code, field };
        let require_msg = |msg: Option<String>| msg.ok_or(missing("msg"));

        let body = match code {
            1 => Body::Message {
                msg: require_msg(msg)?,
            },
            2 => {
                let (host, port) = connection.ok_or(missing("connection"))?;
                Body::ChangeServer { host, port }
            }
            3 => Body::ClientError {
                msg: require_msg(msg)?,
            },
            4 => Body::ServerError {
                msg: require_msg(msg)?,
            },
            5 => Body::Close,
            other => return Err(InvalidEnvelope::UnknownCode(other)),
        };

        Ok(Envelope { host, body })
    }
}
