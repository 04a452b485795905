//! Parsing of the `!`-prefixed commands clients type.
//!
//! The master understands [`MasterCommand`]s. Inside a lobby, any member may
//! leave with `!leave`/`!exit`, and only the admin's [`AdminCommand`]s are
//! intercepted; everything else is chat.

use crate::error::CommandError;

pub const SIGIL: char = '!';

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MasterCommand {
    Help,
    Exit,
    Lobbies,
    Join { name: String },
    Create { name: String },
}

impl MasterCommand {
    /// Parses one whitespace-separated command line.
    pub fn parse(line: &str) -> Result<Self, CommandError> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some((&head, args)) = parts.split_first() else {
            return Err(CommandError::Empty);
        };

        match head {
            "!help" => Ok(MasterCommand::Help),
            "!exit" => Ok(MasterCommand::Exit),
            "!lobbies" => Ok(MasterCommand::Lobbies),
            "!join" => {
                let name = single_arg("!join", args)?;
                Ok(MasterCommand::Join { name })
            }
            "!create" => {
                let name = single_arg("!create", args)?;
                Ok(MasterCommand::Create { name })
            }
            other => Err(CommandError::Unknown(other.to_string())),
        }
    }
}

/// Commands only the lobby admin may issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminCommand {
    SetPassword { password: String },
    KickAll,
}

impl AdminCommand {
    /// Returns `None` when `text` is not an admin command at all, so the
    /// caller can relay it as chat.
    pub fn parse(text: &str) -> Option<Result<Self, CommandError>> {
        let parts: Vec<&str> = text.split_whitespace().collect();
        let (&head, args) = parts.split_first()?;

        match head {
            "!set_password" => Some(
                single_arg("!set_password", args)
                    .map(|password| AdminCommand::SetPassword { password }),
            ),
            "!kickall" if args.is_empty() => Some(Ok(AdminCommand::KickAll)),
            "!kickall" => Some(Err(CommandError::Arity {
                command: "!kickall",
                expected: 0,
                given: args.len(),
            })),
            _ => None,
        }
    }
}

/// `!leave` and `!exit` end a member's lobby session.
pub fn is_departure(text: &str) -> bool {
    matches!(text.trim(), "!leave" | "!exit")
}

fn single_arg(command: &'static str, args: &[&str]) -> Result<String, CommandError> {
    match args {
        [value] => Ok((*value).to_string()),
        _ => Err(CommandError::Arity {
            command,
            expected: 1,
            given: args.len(),
        }),
    }
}

pub const HELP_TEXT: &str = "[help] List of commands to use in this lobby.\n\
!help\t\t\t:\tlists all available commands.\n\
!lobbies\t\t:\tlists all available lobbies.\n\
!join [lobby name]\t:\tconnects you to another lobby.\n\
!create [lobby name]\t:\tcreates a new lobby and moves you into it.\n\
!exit\t\t\t:\tcloses the connection.";
