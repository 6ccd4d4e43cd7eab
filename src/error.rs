//! Error types for the filtering proxy.
//!
//! Every error surfaced while handling one connection is fatal to that
//! connection only; the listener keeps accepting new clients.

use std::io;

use thiserror::Error;

/// A frame that cannot be decoded, or that must not be relayed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("message is shorter than the fixed header")]
    TooShort,
    #[error("invalid byte order marker {0:#04x}")]
    InvalidEndianness(u8),
    #[error("unsupported protocol version {0}")]
    InvalidProtocol(u8),
    #[error("serial must not be zero")]
    ZeroSerial,
    #[error("message of {0} bytes exceeds the maximum message size")]
    TooLarge(usize),
    #[error("header fields overrun the message")]
    Truncated,
    #[error("header field {code} has signature {signature:?}")]
    FieldSignature { code: u8, signature: String },
    #[error("unknown header field {0}")]
    UnknownField(u8),
    #[error("string is not valid UTF-8 or contains a NUL byte")]
    InvalidString,
    #[error("unknown message type {0}")]
    UnknownType(u8),
    #[error("{0} message lacks a required header field")]
    MissingField(&'static str),
    #[error("signal uses the reserved local interface or path")]
    LocalSignal,
    #[error("message declares {0} unix fds")]
    TooManyFds(u32),
}

/// A malformed SASL line.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("first byte of the connection was {0:#04x}, not NUL")]
    InvalidFirstByte(u8),
    #[error("auth line contains a non-printable or non-ASCII byte")]
    InvalidLine,
    #[error("auth line does not start with a command")]
    MissingCommand,
    #[error("auth line exceeds {0} bytes")]
    LineTooLong(usize),
}

/// A `--see`/`--call`/... declaration that cannot be turned into a rule.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RuleError {
    #[error("'{0}' is not a valid well-known bus name")]
    InvalidName(String),
    #[error("'{0}' is not of the form NAME=RULE")]
    MissingRule(String),
    #[error("'{0}' is not a valid object path")]
    InvalidPath(String),
    #[error("'{0}' is not a valid interface or member")]
    InvalidMember(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("bus address is empty")]
    Empty,
    #[error("bus address entry '{0}' has no transport")]
    MissingTransport(String),
    #[error("unsupported transport '{0}'")]
    UnsupportedTransport(String),
    #[error("unix address '{0}' needs a path or abstract key")]
    MissingPath(String),
    #[error("invalid escape sequence in '{0}'")]
    InvalidEscape(String),
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("malformed message: {0}")]
    Wire(#[from] WireError),
    #[error("malformed authentication: {0}")]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Rule(#[from] RuleError),
    #[error(transparent)]
    Address(#[from] AddressError),
    #[error("client serial {serial} does not follow {last}")]
    NonMonotonicSerial { serial: u32, last: u32 },
    #[error("client serial {0} exceeds the maximum client serial")]
    SerialOverflow(u32),
    #[error("serial {0} already has a pending reply expectation")]
    DuplicateSerial(u32),
    #[error("message declares {declared} fds but only {available} were received")]
    MissingFds { declared: u32, available: usize },
    #[error("message declares {declared} fds but {received} were received with it")]
    ExtraFds { declared: u32, received: usize },
    #[error("could not connect to the bus")]
    Connect(#[source] io::Error),
    #[error("event loop error")]
    EventLoop(#[source] calloop::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}
