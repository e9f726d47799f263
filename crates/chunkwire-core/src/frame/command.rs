//! Control-channel grammar.
//!
//! Every control message parses into exactly one [`Request`] (client to
//! server) or [`Reply`] (server to client). Parsing is strict: unknown verbs
//! and wrong argument counts are errors, never silently ignored.

use crate::error::CommandError;
use crate::token::SessionToken;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const CONNECT: &str = "!CONNECT";
const DISCONNECT: &str = "!DISCONNECT";
const LIST_FILES: &str = "GET DOWNLOADED FILES LIST";

/// Client-to-server control request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Ask to become the bound client
    Connect,
    /// Release the session; the token is optional on the binding connection
    Disconnect {
        /// Session being released
        token: Option<SessionToken>,
    },
    /// Ask for the catalog
    ListFiles,
    /// Ask for the byte range `[start, end)` of `file`
    GetChunk {
        /// File name
        file: String,
        /// First byte offset
        start: u64,
        /// Exclusive end offset
        end: u64,
        /// Sequence number to stamp on the packet
        sequence: u32,
        /// Session token, required on connections other than the binding one
        token: Option<SessionToken>,
    },
    /// Packet with this sequence verified (ACK mode only)
    Ack {
        /// Sequence acknowledged
        sequence: u32,
    },
    /// Packet with this sequence failed verification (ACK mode only)
    Nak {
        /// Sequence rejected
        sequence: u32,
    },
}

fn parse_number<T: FromStr>(verb: &'static str, what: &str, value: &str) -> Result<T, CommandError> {
    value.parse().map_err(|_| CommandError::Malformed {
        verb,
        reason: format!("{what} {value:?} is not a number"),
    })
}

fn parse_sequence_only(verb: &'static str, args: &[&str]) -> Result<u32, CommandError> {
    match args {
        [seq] => parse_number(verb, "sequence", seq),
        _ => Err(CommandError::Malformed {
            verb,
            reason: format!("expected 1 argument, got {}", args.len()),
        }),
    }
}

impl FromStr for Request {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let text = s.trim();
        if text == LIST_FILES {
            return Ok(Self::ListFiles);
        }

        let words: Vec<&str> = text.split_whitespace().collect();
        let Some((&verb, args)) = words.split_first() else {
            return Err(CommandError::Unknown(String::new()));
        };

        match verb {
            CONNECT if args.is_empty() => Ok(Self::Connect),
            CONNECT => Err(CommandError::Malformed {
                verb: CONNECT,
                reason: "takes no arguments".to_string(),
            }),
            DISCONNECT => match args {
                [] => Ok(Self::Disconnect { token: None }),
                [token] => Ok(Self::Disconnect {
                    token: Some(token.parse()?),
                }),
                _ => Err(CommandError::Malformed {
                    verb: DISCONNECT,
                    reason: format!("expected at most 1 argument, got {}", args.len()),
                }),
            },
            "GET" => {
                let (file, start, end, rest) = match args {
                    [file, start, end, rest @ ..] if rest.len() <= 2 => (*file, *start, *end, rest),
                    _ => {
                        return Err(CommandError::Malformed {
                            verb: "GET",
                            reason: format!("expected 3 to 5 arguments, got {}", args.len()),
                        });
                    }
                };
                let start = parse_number("GET", "start", start)?;
                let end = parse_number("GET", "end", end)?;
                let sequence = match rest.first() {
                    Some(seq) => parse_number("GET", "sequence", seq)?,
                    None => 0,
                };
                let token = rest.get(1).map(|t| t.parse()).transpose()?;
                Ok(Self::GetChunk {
                    file: file.to_string(),
                    start,
                    end,
                    sequence,
                    token,
                })
            }
            "ACK" => Ok(Self::Ack {
                sequence: parse_sequence_only("ACK", args)?,
            }),
            "NAK" => Ok(Self::Nak {
                sequence: parse_sequence_only("NAK", args)?,
            }),
            other => Err(CommandError::Unknown(other.to_string())),
        }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect => f.write_str(CONNECT),
            Self::Disconnect { token: None } => f.write_str(DISCONNECT),
            Self::Disconnect { token: Some(t) } => write!(f, "{DISCONNECT} {t}"),
            Self::ListFiles => f.write_str(LIST_FILES),
            Self::GetChunk {
                file,
                start,
                end,
                sequence,
                token,
            } => {
                write!(f, "GET {file} {start} {end} {sequence}")?;
                if let Some(t) = token {
                    write!(f, " {t}")?;
                }
                Ok(())
            }
            Self::Ack { sequence } => write!(f, "ACK {sequence}"),
            Self::Nak { sequence } => write!(f, "NAK {sequence}"),
        }
    }
}

/// Category carried by an `ERROR` reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// File missing on the server
    NotFound,
    /// No bound session, or the token does not match it
    Unauthorized,
    /// Request did not parse or made no sense
    BadRequest,
    /// Server-side failure unrelated to the request
    Internal,
}

impl ErrorKind {
    /// Wire spelling
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "NOT_FOUND",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::BadRequest => "BAD_REQUEST",
            Self::Internal => "INTERNAL",
        }
    }
}

impl FromStr for ErrorKind {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NOT_FOUND" => Ok(Self::NotFound),
            "UNAUTHORIZED" => Ok(Self::Unauthorized),
            "BAD_REQUEST" => Ok(Self::BadRequest),
            "INTERNAL" => Ok(Self::Internal),
            other => Err(CommandError::Malformed {
                verb: "ERROR",
                reason: format!("unknown kind {other:?}"),
            }),
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Server-to-client control reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Session granted
    Welcome(SessionToken),
    /// Another client holds the session
    Busy,
    /// Disconnect acknowledged
    Bye,
    /// Request accepted; the data (catalog or chunk packet) follows
    Ok,
    /// Request refused
    Error {
        /// Error category
        kind: ErrorKind,
        /// Human-readable detail
        detail: String,
    },
}

impl Reply {
    /// Shorthand for an `ERROR` reply
    pub fn error(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self::Error {
            kind,
            detail: detail.into(),
        }
    }
}

impl FromStr for Reply {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let text = s.trim();
        let (verb, rest) = text.split_once(' ').unwrap_or((text, ""));
        let rest = rest.trim();

        match verb {
            "WELCOME" => Ok(Self::Welcome(rest.parse()?)),
            "BUSY" if rest.is_empty() => Ok(Self::Busy),
            "BYE" if rest.is_empty() => Ok(Self::Bye),
            "OK" if rest.is_empty() => Ok(Self::Ok),
            "ERROR" => {
                let (kind, detail) = rest.split_once(' ').unwrap_or((rest, ""));
                Ok(Self::Error {
                    kind: kind.parse()?,
                    detail: detail.trim().to_string(),
                })
            }
            other => Err(CommandError::Unknown(other.to_string())),
        }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Welcome(token) => write!(f, "WELCOME {token}"),
            Self::Busy => f.write_str("BUSY"),
            Self::Bye => f.write_str("BYE"),
            Self::Ok => f.write_str("OK"),
            Self::Error { kind, detail } if detail.is_empty() => write!(f, "ERROR {kind}"),
            Self::Error { kind, detail } => write!(f, "ERROR {kind} {detail}"),
        }
    }
}

/// Whether chunk packets are individually acknowledged.
///
/// Both peers must be configured with the same mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AckMode {
    /// Fire-and-forget: the client closes the socket after reading a packet
    #[default]
    None,
    /// The client answers each packet with `ACK <seq>` or `NAK <seq>`
    PerChunk,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::TokenError;

    #[test]
    fn test_parse_simple_requests() {
        assert_eq!("!CONNECT".parse::<Request>().unwrap(), Request::Connect);
        assert_eq!(
            "!DISCONNECT".parse::<Request>().unwrap(),
            Request::Disconnect { token: None }
        );
        assert_eq!(
            "GET DOWNLOADED FILES LIST".parse::<Request>().unwrap(),
            Request::ListFiles
        );
        assert_eq!(
            "ACK 7".parse::<Request>().unwrap(),
            Request::Ack { sequence: 7 }
        );
        assert_eq!(
            "NAK 0".parse::<Request>().unwrap(),
            Request::Nak { sequence: 0 }
        );
    }

    #[test]
    fn test_parse_get_forms() {
        assert_eq!(
            "GET a.bin 0 100".parse::<Request>().unwrap(),
            Request::GetChunk {
                file: "a.bin".to_string(),
                start: 0,
                end: 100,
                sequence: 0,
                token: None,
            }
        );

        let token = SessionToken::generate().unwrap();
        let text = format!("GET a.bin 100 200 1 {token}");
        assert_eq!(
            text.parse::<Request>().unwrap(),
            Request::GetChunk {
                file: "a.bin".to_string(),
                start: 100,
                end: 200,
                sequence: 1,
                token: Some(token),
            }
        );
    }

    #[test]
    fn test_request_display_parses_back() {
        let token = SessionToken::generate().unwrap();
        let requests = [
            Request::Connect,
            Request::Disconnect {
                token: Some(token.clone()),
            },
            Request::ListFiles,
            Request::GetChunk {
                file: "movie.mkv".to_string(),
                start: 1024,
                end: 4096,
                sequence: 3,
                token: Some(token),
            },
            Request::Nak { sequence: 12 },
        ];
        for request in requests {
            assert_eq!(request.to_string().parse::<Request>().unwrap(), request);
        }
    }

    #[test]
    fn test_malformed_requests() {
        assert_eq!(
            "FETCH x".parse::<Request>(),
            Err(CommandError::Unknown("FETCH".to_string()))
        );
        assert!(matches!(
            "GET a.bin 0".parse::<Request>(),
            Err(CommandError::Malformed { verb: "GET", .. })
        ));
        assert!(matches!(
            "GET a.bin zero 10".parse::<Request>(),
            Err(CommandError::Malformed { verb: "GET", .. })
        ));
        assert!(matches!(
            "!CONNECT now".parse::<Request>(),
            Err(CommandError::Malformed { verb: "!CONNECT", .. })
        ));
        assert_eq!(
            "!DISCONNECT nothex".parse::<Request>(),
            Err(CommandError::Token(TokenError::InvalidHex(
                hex::FromHexError::InvalidHexCharacter { c: 'n', index: 0 }
            )))
        );
        assert!(matches!(
            "ACK".parse::<Request>(),
            Err(CommandError::Malformed { verb: "ACK", .. })
        ));
        assert!("".parse::<Request>().is_err());
    }

    #[test]
    fn test_reply_grammar() {
        let token = SessionToken::generate().unwrap();
        assert_eq!(
            format!("WELCOME {token}").parse::<Reply>().unwrap(),
            Reply::Welcome(token)
        );
        assert_eq!("BUSY".parse::<Reply>().unwrap(), Reply::Busy);
        assert_eq!("BYE".parse::<Reply>().unwrap(), Reply::Bye);
        assert_eq!("OK".parse::<Reply>().unwrap(), Reply::Ok);

        let error = Reply::error(ErrorKind::NotFound, "gone.bin is not available");
        assert_eq!(
            error.to_string(),
            "ERROR NOT_FOUND gone.bin is not available"
        );
        assert_eq!(error.to_string().parse::<Reply>().unwrap(), error);
        assert_eq!(
            "ERROR UNAUTHORIZED".parse::<Reply>().unwrap(),
            Reply::error(ErrorKind::Unauthorized, "")
        );
    }

    #[test]
    fn test_reply_rejects_unknown() {
        assert!("HELLO".parse::<Reply>().is_err());
        assert!("ERROR TEAPOT x".parse::<Reply>().is_err());
        assert!("BUSY now".parse::<Reply>().is_err());
    }
}
