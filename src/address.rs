//! Bus address parsing and connection.
//!
//! Addresses are `;`-separated lists of `transport:key=value,...` entries,
//! tried in order. Only the `unix` transport with a `path` or `abstract` key
//! can be connected to; values may contain `%xx` escapes.

use std::fmt;
use std::io;
use std::os::unix::ffi::OsStringExt;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::str::FromStr;

use rustix::net::{self, AddressFamily, SocketAddrUnix, SocketFlags, SocketType};

use crate::error::{AddressError, ProxyError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    /// Socket file on disk
    Path(PathBuf),
    /// Linux abstract socket name (without the leading NUL)
    Abstract(Vec<u8>),
}

impl Transport {
    /// Connect without blocking the event loop. A listener whose backlog is
    /// full fails with `WouldBlock` instead of making us wait.
    fn connect(&self) -> io::Result<UnixStream> {
        let addr = match self {
            Transport::Path(path) => SocketAddrUnix::new(path.as_path())?,
            Transport::Abstract(name) => abstract_addr(name)?,
        };
        let fd = net::socket_with(
            AddressFamily::UNIX,
            SocketType::STREAM,
            SocketFlags::NONBLOCK | SocketFlags::CLOEXEC,
            None,
        )?;
        net::connect(&fd, &addr)?;
        Ok(UnixStream::from(fd))
    }
}

#[cfg(target_os = "linux")]
fn abstract_addr(name: &[u8]) -> io::Result<SocketAddrUnix> {
    Ok(SocketAddrUnix::new_abstract_name(name)?)
}

#[cfg(not(target_os = "linux"))]
fn abstract_addr(_name: &[u8]) -> io::Result<SocketAddrUnix> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "abstract sockets are only available on Linux",
    ))
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Path(path) => write!(f, "unix:path={}", path.display()),
            Transport::Abstract(name) => write!(f, "unix:abstract={}", String::from_utf8_lossy(name)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusAddress {
    entries: Vec<Transport>,
}

impl BusAddress {
    pub fn entries(&self) -> &[Transport] {
        &self.entries
    }

    /// Connect to the first entry that accepts the connection.
    pub fn connect(&self) -> Result<UnixStream, ProxyError> {
        let mut last_error = io::Error::new(io::ErrorKind::NotFound, "no usable bus address");
        for entry in &self.entries {
            match entry.connect() {
                Ok(stream) => {
                    log::debug!("[BUS] Connected to {}", entry);
                    return Ok(stream);
                }
                Err(e) => {
                    log::debug!("[BUS] Failed to connect to {}: {}", entry, e);
                    last_error = e;
                }
            }
        }
        Err(ProxyError::Connect(last_error))
    }
}

impl FromStr for BusAddress {
    type Err = AddressError;

    fn from_str(address: &str) -> Result<Self, Self::Err> {
        let mut entries = Vec::new();
        let mut unsupported = None;

        for entry in address.split(';').filter(|e| !e.is_empty()) {
            let (transport, params) = entry
                .split_once(':')
                .ok_or_else(|| AddressError::MissingTransport(entry.to_owned()))?;
            if transport != "unix" {
                log::warn!("[BUS] Skipping unsupported address {}", entry);
                unsupported = Some(transport.to_owned());
                continue;
            }
            entries.push(parse_unix(entry, params)?);
        }

        if entries.is_empty() {
            return Err(match unsupported {
                Some(transport) => AddressError::UnsupportedTransport(transport),
                None => AddressError::Empty,
            });
        }
        Ok(Self { entries })
    }
}

fn parse_unix(entry: &str, params: &str) -> Result<Transport, AddressError> {
    for param in params.split(',').filter(|p| !p.is_empty()) {
        let Some((key, value)) = param.split_once('=') else {
            continue;
        };
        match key {
            "path" => {
                let path = unescape(value)?;
                return Ok(Transport::Path(PathBuf::from(std::ffi::OsString::from_vec(path))));
            }
            "abstract" => return Ok(Transport::Abstract(unescape(value)?)),
            _ => {}
        }
    }
    Err(AddressError::MissingPath(entry.to_owned()))
}

/// Decode `%xx` escapes into raw bytes.
fn unescape(value: &str) -> Result<Vec<u8>, AddressError> {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes
                .get(i + 1..i + 3)
                .and_then(|h| std::str::from_utf8(h).ok())
                .and_then(|h| u8::from_str_radix(h, 16).ok())
                .ok_or_else(|| AddressError::InvalidEscape(value.to_owned()))?;
            out.push(hex);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    Ok(out)
}
