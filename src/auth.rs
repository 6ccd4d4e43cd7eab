//! SASL handshake passthrough.
//!
//! The handshake is relayed byte for byte; the proxy only splits it into
//! CRLF-terminated lines to find where it ends. The client finishes with a
//! `BEGIN` line. The bus answers every other client command with exactly one
//! line, so the bus side is done once it has answered them all.

use crate::error::AuthError;

/// Longest partial line kept while waiting for its CRLF (same as dbus-daemon)
pub const MAX_AUTH_LINE: usize = 16 * 1024;

const LINE_END: &[u8] = b"\r\n";
const BEGIN: &[u8] = b"BEGIN";

/// A command line is printable ASCII starting with an upper-case letter.
fn validate_line(line: &[u8]) -> Result<(), AuthError> {
    if line.iter().any(|b| !(0x20..=0x7e).contains(b)) {
        return Err(AuthError::InvalidLine);
    }
    match line.first() {
        Some(b) if b.is_ascii_uppercase() => Ok(()),
        _ => Err(AuthError::MissingCommand),
    }
}

/// `BEGIN` alone or followed by whitespace, as dbus-daemon accepts it.
pub fn is_begin(line: &[u8]) -> bool {
    match line.strip_prefix(BEGIN) {
        Some(rest) => matches!(rest.first(), None | Some(b' ') | Some(b'\t')),
        None => false,
    }
}

/// Splits a byte stream into validated auth lines across reads.
#[derive(Debug, Default)]
pub struct LineScanner {
    partial: Vec<u8>,
}

impl LineScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed newly read bytes, calling `on_line` for each complete line.
    ///
    /// When `on_line` returns `true` scanning stops and the number of bytes
    /// of `data` up to and including that line's CRLF is returned; anything
    /// after it is not auth traffic. `Ok(None)` means more input is needed.
    pub fn feed<F>(&mut self, data: &[u8], mut on_line: F) -> Result<Option<usize>, AuthError>
    where
        F: FnMut(&[u8]) -> bool,
    {
        let carried = self.partial.len();
        self.partial.extend_from_slice(data);

        let mut start = 0;
        while let Some(found) = self.partial[start..]
            .windows(LINE_END.len())
            .position(|w| w == LINE_END)
        {
            let line_end = start + found;
            let line = &self.partial[start..line_end];
            validate_line(line)?;
            start = line_end + LINE_END.len();
            if on_line(line) {
                self.partial.clear();
                return Ok(Some(start - carried));
            }
        }

        self.partial.drain(..start);
        if self.partial.len() >= MAX_AUTH_LINE {
            return Err(AuthError::LineTooLong(MAX_AUTH_LINE));
        }
        Ok(None)
    }
}

/// Client half of the handshake: counts commands until `BEGIN`.
#[derive(Debug, Default)]
pub struct ClientAuth {
    scanner: LineScanner,
    commands: usize,
    done: bool,
}

impl ClientAuth {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns how many bytes of `data` belong to the handshake once `BEGIN`
    /// was seen.
    pub fn feed(&mut self, data: &[u8]) -> Result<Option<usize>, AuthError> {
        let commands = &mut self.commands;
        let end = self.scanner.feed(data, |line| {
            if is_begin(line) {
                return true;
            }
            *commands += 1;
            false
        })?;
        if end.is_some() {
            log::debug!("[AUTH] Client sent BEGIN after {} commands", self.commands);
            self.done = true;
        }
        Ok(end)
    }

    #[inline]
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Commands the bus has to answer.
    #[inline]
    pub fn commands(&self) -> usize {
        self.commands
    }
}

/// Bus half of the handshake: counts replies.
#[derive(Debug, Default)]
pub struct BusAuth {
    scanner: LineScanner,
    replies: usize,
}

impl BusAuth {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns how many bytes of `data` belong to the handshake once
    /// `expected` replies have been seen. Pass `None` while the client has
    /// not finished, so every line is counted.
    pub fn feed(&mut self, data: &[u8], expected: Option<usize>) -> Result<Option<usize>, AuthError> {
        if expected.is_some_and(|n| self.replies >= n) {
            return Ok(Some(0));
        }
        let replies = &mut self.replies;
        self.scanner.feed(data, |_| {
            *replies += 1;
            expected.is_some_and(|n| *replies >= n)
        })
    }

    /// Whether every client command has been answered.
    pub fn is_complete(&self, expected: usize) -> bool {
        self.replies >= expected && self.scanner.partial.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_detection() {
        assert!(is_begin(b"BEGIN"));
        assert!(is_begin(b"BEGIN extra"));
        assert!(!is_begin(b"BEGINX"));
        assert!(!is_begin(b"AUTH EXTERNAL"));
    }

    #[test]
    fn test_client_auth_split_across_reads() {
        let mut auth = ClientAuth::new();
        assert_eq!(auth.feed(b"AUTH EXTERNAL 31303030\r"), Ok(None));
        assert_eq!(auth.feed(b"\nNEGOTIATE_UNIX_FD\r\nBEG"), Ok(None));
        let tail = b"IN\r\nl\x01\x00\x01";
        assert_eq!(auth.feed(tail), Ok(Some(4)));
        assert!(auth.is_done());
        assert_eq!(auth.commands(), 2);
    }

    #[test]
    fn test_client_auth_rejects_bad_lines() {
        assert_eq!(ClientAuth::new().feed(b"AUTH \x01\r\n"), Err(AuthError::InvalidLine));
        assert_eq!(ClientAuth::new().feed("AUTH \u{e9}\r\n".as_bytes()), Err(AuthError::InvalidLine));
        assert_eq!(ClientAuth::new().feed(b"auth external\r\n"), Err(AuthError::MissingCommand));
        assert_eq!(ClientAuth::new().feed(b"\r\n"), Err(AuthError::MissingCommand));

        let mut auth = ClientAuth::new();
        let long = vec![b'A'; MAX_AUTH_LINE];
        assert_eq!(auth.feed(&long), Err(AuthError::LineTooLong(MAX_AUTH_LINE)));
    }

    #[test]
    fn test_bus_auth_counts_replies() {
        let mut bus = BusAuth::new();
        assert_eq!(bus.feed(b"OK 1234\r\n", None), Ok(None));
        assert_eq!(bus.feed(b"AGREE_UNIX_FD\r\nl\x02", Some(2)), Ok(Some(15)));
        assert!(bus.is_complete(2));

        let mut bus = BusAuth::new();
        assert_eq!(bus.feed(b"OK 1234\r\n", None), Ok(None));
        assert!(bus.is_complete(1));
        assert_eq!(bus.feed(b"l\x02", Some(1)), Ok(Some(0)));
    }
}
