//! Text command protocol spoken on top of the framing layer.
//!
//! Every request is one frame holding a single UTF-8 line: a case-insensitive
//! verb followed by space-separated arguments.  Textual replies are also one
//! frame each.  File transfers switch the connection into a raw data phase
//! where frames carry file bytes instead of text (see the server's command
//! handler for the exact sequence).
//!
//! | request                 | reply                                 |
//! |-------------------------|---------------------------------------|
//! | `ECHO <text>`           | `<text>`                              |
//! | `TIME`                  | `YYYY-MM-DD HH:MM:SS`                 |
//! | `LIST`                  | `a, b, c` / `No files on server.`     |
//! | `CLOSE`                 | `BYE`                                 |
//! | `UPLOAD <name> <size>`  | `OFFSET <n>` … `UPLOAD COMPLETE`      |
//! | `DOWNLOAD <name>`       | `SIZE <n>` / `ERROR: File not found`  |
//! | `OFFSET <n>`            | (download resume point, client → server) |

use std::fmt;
use std::path::Path;

use thiserror::Error;

/// Errors produced while parsing a command line.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CommandError {
    /// The line was empty or whitespace only.
    #[error("empty command")]
    Empty,

    /// A required argument is absent.
    #[error("{command} requires a {argument} argument")]
    MissingArgument {
        command: &'static str,
        argument: &'static str,
    },

    /// A numeric argument could not be parsed.
    #[error("invalid number for {argument}: {value:?}")]
    InvalidNumber {
        argument: &'static str,
        value: String,
    },

    /// The file name reduces to nothing usable (e.g. `..` or `/`).
    #[error("invalid file name: {0:?}")]
    InvalidFileName(String),
}

/// A parsed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Client-side only: print the command list.
    Help,
    /// Echo the text back.
    Echo(String),
    /// Report the server's local time.
    Time,
    /// List stored files.
    List,
    /// Say goodbye and close the connection.
    Close,
    /// Start (or resume) storing `size` bytes under `name`.
    Upload { name: String, size: u64 },
    /// Start sending the stored file `name`.
    Download { name: String },
    /// Resume point for a download, sent after `SIZE`.
    Offset(u64),
    /// Anything else, kept verbatim.
    Unknown(String),
}

impl Command {
    /// Parses one request line.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError`] for an empty line or malformed arguments.
    /// Unrecognised verbs are *not* an error; they parse to
    /// [`Command::Unknown`].
    ///
    /// # Examples
    ///
    /// ```rust
    /// use netlab_core::Command;
    ///
    /// assert_eq!(Command::parse("echo hi there").unwrap(), Command::Echo("hi there".into()));
    /// assert_eq!(
    ///     Command::parse("UPLOAD notes.txt 12").unwrap(),
    ///     Command::Upload { name: "notes.txt".into(), size: 12 },
    /// );
    /// ```
    pub fn parse(line: &str) -> Result<Self, CommandError> {
        let line = line.trim();
        if line.is_empty() {
            return Err(CommandError::Empty);
        }

        let (verb, rest) = match line.split_once(' ') {
            Some((verb, rest)) => (verb, rest),
            None => (line, ""),
        };
        let mut args = rest.split_whitespace();

        let command = match verb.to_ascii_uppercase().as_str() {
            "HELP" => Command::Help,
            "ECHO" => Command::Echo(rest.to_string()),
            "TIME" => Command::Time,
            "LIST" => Command::List,
            "CLOSE" => Command::Close,
            "UPLOAD" => {
                let name = args.next().ok_or(CommandError::MissingArgument {
                    command: "UPLOAD",
                    argument: "file name",
                })?;
                let size = args.next().ok_or(CommandError::MissingArgument {
                    command: "UPLOAD",
                    argument: "size",
                })?;
                Command::Upload {
                    name: base_name(name)?,
                    size: parse_number("size", size)?,
                }
            }
            "DOWNLOAD" => {
                let name = args.next().ok_or(CommandError::MissingArgument {
                    command: "DOWNLOAD",
                    argument: "file name",
                })?;
                Command::Download {
                    name: base_name(name)?,
                }
            }
            "OFFSET" => {
                let offset = args.next().ok_or(CommandError::MissingArgument {
                    command: "OFFSET",
                    argument: "offset",
                })?;
                Command::Offset(parse_number("offset", offset)?)
            }
            _ => Command::Unknown(line.to_string()),
        };
        Ok(command)
    }
}

impl fmt::Display for Command {
    /// Renders the command as the request line sent on the wire.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Help => f.write_str("HELP"),
            Command::Echo(text) => write!(f, "ECHO {text}"),
            Command::Time => f.write_str("TIME"),
            Command::List => f.write_str("LIST"),
            Command::Close => f.write_str("CLOSE"),
            Command::Upload { name, size } => write!(f, "UPLOAD {name} {size}"),
            Command::Download { name } => write!(f, "DOWNLOAD {name}"),
            Command::Offset(offset) => write!(f, "OFFSET {offset}"),
            Command::Unknown(line) => f.write_str(line),
        }
    }
}

fn parse_number(argument: &'static str, value: &str) -> Result<u64, CommandError> {
    value.parse().map_err(|_| CommandError::InvalidNumber {
        argument,
        value: value.to_string(),
    })
}

/// Reduces a client-supplied path to its final component so a request can
/// never reach outside the storage directory.
///
/// # Errors
///
/// Returns [`CommandError::InvalidFileName`] when nothing usable remains.
pub fn base_name(name: &str) -> Result<String, CommandError> {
    // Normalise Windows separators so `..\secret` is reduced too.
    let normalised = name.replace('\\', "/");
    Path::new(&normalised)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty() && *n != "." && *n != "..")
        .map(str::to_string)
        .ok_or_else(|| CommandError::InvalidFileName(name.to_string()))
}

/// Fixed reply lines and helpers shared by server and client.
pub mod replies {
    /// Reply to `CLOSE`.
    pub const BYE: &str = "BYE";
    /// Reply to an unrecognised verb.
    pub const UNKNOWN_COMMAND: &str = "UNKNOWN COMMAND";
    /// Final reply of a successful upload.
    pub const UPLOAD_COMPLETE: &str = "UPLOAD COMPLETE";
    /// `LIST` reply when the storage directory is empty.
    pub const NO_FILES: &str = "No files on server.";
    /// `DOWNLOAD` reply for a missing file.
    pub const FILE_NOT_FOUND: &str = "ERROR: File not found";
    /// Prefix of every error reply.
    pub const ERROR_PREFIX: &str = "ERROR:";

    /// `OFFSET <n>` line.
    pub fn offset_line(offset: u64) -> String {
        format!("OFFSET {offset}")
    }

    /// `SIZE <n>` line.
    pub fn size_line(size: u64) -> String {
        format!("SIZE {size}")
    }

    /// `ERROR: <reason>` line.
    pub fn error_line(reason: impl std::fmt::Display) -> String {
        format!("{ERROR_PREFIX} {reason}")
    }

    /// Extracts `n` from an `OFFSET <n>` line.
    pub fn parse_offset_line(line: &str) -> Option<u64> {
        parse_keyword_number(line, "OFFSET")
    }

    /// Extracts `n` from a `SIZE <n>` line.
    pub fn parse_size_line(line: &str) -> Option<u64> {
        parse_keyword_number(line, "SIZE")
    }

    fn parse_keyword_number(line: &str, keyword: &str) -> Option<u64> {
        let mut parts = line.split_whitespace();
        if !parts.next()?.eq_ignore_ascii_case(keyword) {
            return None;
        }
        parts.next()?.parse().ok()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
