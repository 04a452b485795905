use std::io;

use thiserror::Error;

/// Failure to turn received bytes into an [`Envelope`](crate::envelope::Envelope).
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed payload: {0}")]
    MalformedPayload(#[from] serde_json::Error),
}

/// A syntactically valid JSON object that is not a valid envelope.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvalidEnvelope {
    #[error("unknown response code {0}")]
    UnknownCode(u8),
    #[error("response code {code} requires field '{field}'")]
    MissingField { code: u8, field: &'static str },
}

/// Command text that could not be interpreted.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("empty command")]
    Empty,
    #[error("unknown command '{0}'")]
    Unknown(String),
    #[error("{command} expects {expected} parameter(s), but {given} were given")]
    Arity {
        command: &'static str,
        expected: usize,
        given: usize,
    },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PortError {
    #[error("no free lobby port found after {attempts} attempts")]
    PortExhausted { attempts: usize },
}

/// Reasons a `!create` request fails inside the master.
#[derive(Debug, Error)]
pub enum CreateError {
    #[error("lobby '{0}' already exists")]
    NameTaken(String),
    #[error(transparent)]
    Ports(#[from] PortError),
    #[error("failed to bind lobby listener on port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },
}

impl CreateError {
    /// Whether the requester caused the failure (code 3) or the server did (code 4).
    pub fn is_client_error(&self) -> bool {
        matches!(self, CreateError::NameTaken(_))
    }
}
