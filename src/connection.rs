//! One proxied client connection.
//!
//! A [`ProxyConnection`] pairs the socket of an accepted client with a fresh
//! connection to the real bus. It relays the SASL handshake, then hands
//! every framed message to the [`Router`] and queues whatever comes out.
//!
//! # Architecture
//!
//! ```text
//! Client <-> Side(client) <-> Router <-> Side(bus) <-> Bus
//! ```
//!
//! # Security Model
//!
//! - **Clients are untrusted**: malformed handshakes or frames close the
//!   connection
//! - **The bus is trusted to frame correctly**, but what it relays from
//!   other peers is filtered by policy
//! - **Closing is graceful**: data already queued for a side is flushed
//!   before that side is closed

use std::io;
use std::os::unix::net::UnixStream;
use std::rc::Rc;

use crate::address::BusAddress;
use crate::auth::{BusAuth, ClientAuth};
use crate::buffer::Buffer;
use crate::error::{AuthError, ProxyError};
use crate::policy::PolicyTable;
use crate::pump::{ReadOutcome, Side, SideKind, AUTH_READ_SIZE};
use crate::router::{Routed, Router, RouterOptions};

/// Where the client is in the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthPhase {
    /// Waiting for the NUL byte that opens every connection
    FirstByte,
    /// Relaying SASL lines until `BEGIN`
    Lines,
    /// Framed messages
    Done,
}

pub struct ProxyConnection {
    /// Connection ID for logging
    id: usize,
    client: Side,
    bus: Side,
    router: Router,
    client_phase: AuthPhase,
    client_auth: ClientAuth,
    bus_auth: BusAuth,
    bus_authenticated: bool,
    /// Client reads were resumed and must be retried
    resume_pending: bool,
}

impl ProxyConnection {
    /// Connect to the bus on behalf of a newly accepted client.
    ///
    /// # Errors
    /// Returns an error if no bus address entry accepts the connection.
    pub fn new(
        id: usize,
        client: UnixStream,
        address: &BusAddress,
        table: Rc<PolicyTable>,
        options: RouterOptions,
    ) -> Result<Self, ProxyError> {
        log::debug!("[CONN:{}] Connecting to bus", id);
        let bus = address.connect()?;
        let connection = Self::from_streams(id, client, bus, table, options)?;
        log::info!(
            "[CONN:{}] Established (filter={}, sloppy_names={})",
            id,
            options.filter,
            options.sloppy_names
        );
        Ok(connection)
    }

    /// Proxy between two already connected sockets.
    pub fn from_streams(
        id: usize,
        client: UnixStream,
        bus: UnixStream,
        table: Rc<PolicyTable>,
        options: RouterOptions,
    ) -> Result<Self, ProxyError> {
        Ok(Self {
            id,
            client: Side::new(SideKind::Client, client)?,
            bus: Side::new(SideKind::Bus, bus)?,
            router: Router::new(id, table, options),
            client_phase: AuthPhase::FirstByte,
            client_auth: ClientAuth::new(),
            bus_auth: BusAuth::new(),
            bus_authenticated: false,
            resume_pending: false,
        })
    }

    /// A second handle to one socket, for event loop registration.
    pub fn try_clone_stream(&self, kind: SideKind) -> io::Result<UnixStream> {
        self.side(kind).try_clone_stream()
    }

    /// Both sides are closed; the connection can be dropped.
    #[inline]
    pub fn is_finished(&self) -> bool {
        self.client.is_closed() && self.bus.is_closed()
    }

    fn side(&self, kind: SideKind) -> &Side {
        match kind {
            SideKind::Client => &self.client,
            SideKind::Bus => &self.bus,
        }
    }

    fn side_mut(&mut self, kind: SideKind) -> &mut Side {
        match kind {
            SideKind::Client => &mut self.client,
            SideKind::Bus => &mut self.bus,
        }
    }

    /// Handle readiness reported for one side.
    ///
    /// Any error closes both sides at once; nothing more is relayed after a
    /// protocol violation.
    pub fn handle_event(&mut self, kind: SideKind, readable: bool, writable: bool) {
        if self.is_finished() {
            return;
        }
        if let Err(e) = self.process(kind, readable, writable) {
            log::warn!("[CONN:{}] Closing after {} error: {}", self.id, kind, e);
            self.client.close();
            self.bus.close();
        }
    }

    fn process(&mut self, kind: SideKind, readable: bool, writable: bool) -> Result<(), ProxyError> {
        if writable {
            self.flush(kind);
        }
        if readable {
            match kind {
                SideKind::Client => self.read_client()?,
                SideKind::Bus => self.read_bus()?,
            }
        }
        if std::mem::take(&mut self.resume_pending) {
            self.read_client()?;
        }
        self.flush(SideKind::Client);
        self.flush(SideKind::Bus);
        self.settle();
        Ok(())
    }

    // =========================================================================
    // Client → Bus
    // =========================================================================

    fn read_client(&mut self) -> Result<(), ProxyError> {
        while self.client.can_read() {
            let more = match self.client_phase {
                AuthPhase::FirstByte => self.read_first_byte()?,
                AuthPhase::Lines => self.read_client_auth()?,
                AuthPhase::Done => self.read_client_message()?,
            };
            if !more {
                break;
            }
        }
        Ok(())
    }

    /// Read a raw chunk from `kind`. `None` means stop reading for now.
    fn read_chunk(&mut self, kind: SideKind, buf: &mut [u8]) -> Result<Option<usize>, ProxyError> {
        match self.side_mut(kind).read_raw(buf) {
            Ok(0) => {
                self.side_closed(kind);
                Ok(None)
            }
            Ok(n) => Ok(Some(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn read_first_byte(&mut self) -> Result<bool, ProxyError> {
        let mut byte = [0u8; 1];
        if self.read_chunk(SideKind::Client, &mut byte)?.is_none() {
            return Ok(false);
        }
        if byte[0] != 0 {
            return Err(AuthError::InvalidFirstByte(byte[0]).into());
        }

        let mut buffer = Buffer::from_vec(vec![0]);
        buffer.set_send_credentials(true);
        self.bus.queue(buffer);
        self.client_phase = AuthPhase::Lines;
        log::trace!("[CONN:{}] [AUTH] First byte relayed with credentials", self.id);
        Ok(true)
    }

    fn read_client_auth(&mut self) -> Result<bool, ProxyError> {
        let mut chunk = vec![0u8; AUTH_READ_SIZE];
        let Some(n) = self.read_chunk(SideKind::Client, &mut chunk)? else {
            return Ok(false);
        };
        let data = &chunk[..n];

        match self.client_auth.feed(data)? {
            Some(end) => {
                queue_bytes(&mut self.bus, &data[..end]);
                self.client.stash(&data[end..]);
                self.client_phase = AuthPhase::Done;
                if self.bus_auth.is_complete(self.client_auth.commands()) {
                    self.bus_authenticated = true;
                }
                log::debug!("[CONN:{}] [AUTH] Client finished authentication", self.id);
            }
            None => queue_bytes(&mut self.bus, data),
        }
        Ok(true)
    }

    fn read_client_message(&mut self) -> Result<bool, ProxyError> {
        match self.client.read_message()? {
            ReadOutcome::Decoded(buffer) => {
                let client = &mut self.client;
                let routed = self
                    .router
                    .on_client_message(buffer, |count| client.claim_fds(count))?;
                self.apply(routed);
                Ok(true)
            }
            ReadOutcome::Incomplete => Ok(false),
            ReadOutcome::Eof => {
                self.side_closed(SideKind::Client);
                Ok(false)
            }
        }
    }

    // =========================================================================
    // Bus → Client
    // =========================================================================

    fn read_bus(&mut self) -> Result<(), ProxyError> {
        while self.bus.can_read() {
            let more = if self.bus_authenticated {
                self.read_bus_message()?
            } else {
                self.read_bus_auth()?
            };
            if !more {
                break;
            }
        }
        Ok(())
    }

    fn read_bus_auth(&mut self) -> Result<bool, ProxyError> {
        let mut chunk = vec![0u8; AUTH_READ_SIZE];
        let Some(n) = self.read_chunk(SideKind::Bus, &mut chunk)? else {
            return Ok(false);
        };
        let data = &chunk[..n];

        let expected = self.client_auth.is_done().then(|| self.client_auth.commands());
        match self.bus_auth.feed(data, expected)? {
            Some(end) => {
                queue_bytes(&mut self.client, &data[..end]);
                self.bus.stash(&data[end..]);
                self.bus_authenticated = true;
                log::debug!("[CONN:{}] [AUTH] Bus finished authentication", self.id);
            }
            None => queue_bytes(&mut self.client, data),
        }
        Ok(true)
    }

    fn read_bus_message(&mut self) -> Result<bool, ProxyError> {
        match self.bus.read_message()? {
            ReadOutcome::Decoded(buffer) => {
                let bus = &mut self.bus;
                let routed = self
                    .router
                    .on_bus_message(buffer, |count| bus.claim_fds(count))?;
                self.apply(routed);
                Ok(true)
            }
            ReadOutcome::Incomplete => Ok(false),
            ReadOutcome::Eof => {
                self.side_closed(SideKind::Bus);
                Ok(false)
            }
        }
    }

    // =========================================================================
    // Output and Teardown
    // =========================================================================

    fn apply(&mut self, routed: Routed) {
        for buffer in routed.to_bus {
            self.bus.queue(buffer);
        }
        for buffer in routed.to_client {
            self.client.queue(buffer);
        }
        match routed.client_reading {
            Some(false) => self.client.set_paused(true),
            Some(true) => {
                self.client.set_paused(false);
                self.resume_pending = true;
            }
            None => {}
        }
    }

    fn flush(&mut self, kind: SideKind) {
        if let Err(e) = self.side_mut(kind).flush() {
            log::debug!("[CONN:{}] Write to {} failed: {}", self.id, kind, e);
            self.side_closed(kind);
        }
    }

    /// Close `kind` and stop reading from its peer, which is closed once
    /// everything queued for it has been written.
    fn side_closed(&mut self, kind: SideKind) {
        log::debug!("[CONN:{}] {} side closed", self.id, kind);
        self.side_mut(kind).close();
        self.side_mut(kind.other()).shutdown_read();
    }

    fn settle(&mut self) {
        for kind in [SideKind::Client, SideKind::Bus] {
            let peer_closed = self.side(kind.other()).is_closed();
            let side = self.side_mut(kind);
            if peer_closed && !side.is_closed() && !side.has_pending_writes() {
                side.close();
            }
        }
    }
}

fn queue_bytes(side: &mut Side, bytes: &[u8]) {
    if !bytes.is_empty() {
        side.queue(Buffer::from_vec(bytes.to_vec()));
    }
}

impl Drop for ProxyConnection {
    fn drop(&mut self) {
        log::debug!(
            "[CONN:{}] Dropped ({} calls and {} bus calls awaiting replies)",
            self.id,
            self.router.state().client_calls.len(),
            self.router.state().bus_calls.len()
        );
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::Policy;
    use crate::wire::{self, Arg, Endian, Header, MessageBuilder, BUS_NAME, FIXED_HEADER_SIZE};
    use std::io::{Read, Write};
    use std::time::Duration;

    struct Harness {
        connection: ProxyConnection,
        client: UnixStream,
        bus: UnixStream,
    }

    fn harness(table: PolicyTable) -> Harness {
        let (client, client_end) = UnixStream::pair().unwrap();
        let (bus_end, bus) = UnixStream::pair().unwrap();
        for peer in [&client, &bus] {
            peer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        }
        let options = RouterOptions {
            filter: true,
            ..RouterOptions::default()
        };
        let connection = ProxyConnection::from_streams(1, client_end, bus_end, Rc::new(table), options).unwrap();
        Harness { connection, client, bus }
    }

    fn read_bytes(stream: &mut UnixStream, len: usize) -> Vec<u8> {
        let mut data = vec![0u8; len];
        stream.read_exact(&mut data).unwrap();
        data
    }

    fn read_message(stream: &mut UnixStream) -> Vec<u8> {
        let mut data = read_bytes(stream, FIXED_HEADER_SIZE);
        let size = wire::message_size(&data).unwrap();
        data.resize(size, 0);
        stream.read_exact(&mut data[FIXED_HEADER_SIZE..]).unwrap();
        data
    }

    fn assert_nothing_pending(stream: &mut UnixStream) {
        stream.set_nonblocking(true).unwrap();
        let mut byte = [0u8; 1];
        let err = stream.read(&mut byte).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        stream.set_nonblocking(false).unwrap();
    }

    impl Harness {
        fn client_sends(&mut self, data: &[u8]) {
            self.client.write_all(data).unwrap();
            self.connection.handle_event(SideKind::Client, true, true);
        }

        fn bus_sends(&mut self, data: &[u8]) {
            self.bus.write_all(data).unwrap();
            self.connection.handle_event(SideKind::Bus, true, true);
        }

        /// Run the handshake and Hello, pipelined the way most clients do.
        fn open(&mut self, unique_id: &str, extra: &[u8]) {
            let mut opening = b"\0AUTH EXTERNAL 31303030\r\nNEGOTIATE_UNIX_FD\r\nBEGIN\r\n".to_vec();
            let auth_len = opening.len();
            opening.extend_from_slice(&MessageBuilder::bus_call("Hello").serial(1).build(Endian::Little));
            opening.extend_from_slice(extra);
            self.client_sends(&opening);

            assert_eq!(read_bytes(&mut self.bus, auth_len), opening[..auth_len]);
            let hello = read_message(&mut self.bus);
            assert_eq!(Header::parse(&hello).unwrap().member.as_deref(), Some("Hello"));

            let mut answer = b"OK 1234deadbeef\r\nAGREE_UNIX_FD\r\n".to_vec();
            let answer_len = answer.len();
            let reply = MessageBuilder::method_return(1)
                .serial(1)
                .sender(Some(BUS_NAME))
                .destination(Some(unique_id))
                .arg_str(unique_id)
                .build(Endian::Little);
            answer.extend_from_slice(&reply);
            self.bus_sends(&answer);

            assert_eq!(read_bytes(&mut self.client, answer_len), answer[..answer_len]);
            assert_eq!(read_message(&mut self.client), reply);
        }
    }

    #[test]
    fn test_session_with_denied_call() {
        let mut h = harness(PolicyTable::new());
        h.open(":1.7", &[]);

        let call = MessageBuilder::bus_call("RequestName")
            .serial(2)
            .arg_str("com.other.App")
            .arg(Arg::Bool(false))
            .build(Endian::Little);
        h.client_sends(&call);
        let ping = Header::parse(&read_message(&mut h.bus)).unwrap();
        assert_eq!(ping.member.as_deref(), Some("Ping"));
        assert_eq!(ping.serial, 2);

        h.bus_sends(&MessageBuilder::method_return(2).serial(2).build(Endian::Little));
        let denied = Header::parse(&read_message(&mut h.client)).unwrap();
        assert_eq!(denied.error_name.as_deref(), Some("org.freedesktop.DBus.Error.AccessDenied"));
        assert_eq!(denied.reply_serial, Some(2));

        drop(h.client);
        h.connection.handle_event(SideKind::Client, true, false);
        assert!(h.connection.is_finished());
    }

    #[test]
    fn test_client_is_paused_during_wildcard_lookup() {
        let mut table = PolicyTable::new();
        table.add_policy("org.example", true, Policy::Talk);
        let mut h = harness(table);

        let get_id = MessageBuilder::bus_call("GetId").serial(2).build(Endian::Little);
        let (client, bus) = (&mut h.client, &mut h.bus);
        let mut opening = b"\0AUTH EXTERNAL 31303030\r\nBEGIN\r\n".to_vec();
        let auth_len = opening.len();
        opening.extend_from_slice(&MessageBuilder::bus_call("Hello").serial(1).build(Endian::Little));
        opening.extend_from_slice(&get_id);
        client.write_all(&opening).unwrap();
        h.connection.handle_event(SideKind::Client, true, true);

        read_bytes(bus, auth_len);
        let members: Vec<_> = (0..3)
            .map(|_| Header::parse(&read_message(bus)).unwrap().member.unwrap())
            .collect();
        assert_eq!(members, ["Hello", "AddMatch", "ListNames"]);
        assert!(h.connection.client.is_paused());
        // GetId stays unread until the lookup is done
        assert_nothing_pending(bus);

        let mut answer = b"OK 1234deadbeef\r\n".to_vec();
        for reply in [
            MessageBuilder::method_return(1).serial(1).arg_str(":1.7"),
            MessageBuilder::method_return(2).serial(2),
            MessageBuilder::method_return(3).serial(3).arg(Arg::StrArray(Vec::new())),
        ] {
            answer.extend_from_slice(&reply.build(Endian::Little));
        }
        bus.write_all(&answer).unwrap();
        h.connection.handle_event(SideKind::Bus, true, true);
        assert!(!h.connection.client.is_paused());

        let forwarded = Header::parse(&read_message(bus)).unwrap();
        assert_eq!(forwarded.member.as_deref(), Some("GetId"));
        assert_eq!(forwarded.serial, 4);
    }

    #[test]
    fn test_invalid_first_byte_closes_connection() {
        let mut h = harness(PolicyTable::new());
        h.client_sends(b"X");
        assert!(h.connection.is_finished());
    }

    #[test]
    fn test_malformed_frame_closes_connection() {
        let mut h = harness(PolicyTable::new());
        h.open(":1.7", &[]);
        let mut bad = MessageBuilder::bus_call("GetId").serial(2).build(Endian::Little);
        bad[3] = 9;
        h.client_sends(&bad);
        assert!(h.connection.is_finished());
    }

    #[test]
    fn test_bus_close_drains_pending_client_data() {
        let mut h = harness(PolicyTable::new());
        h.open(":1.7", &[]);
        let signal = MessageBuilder::signal("/org/freedesktop/DBus", "org.freedesktop.DBus", "NameAcquired")
            .serial(5)
            .sender(Some(BUS_NAME))
            .destination(Some(":1.7"))
            .arg_str(":1.7")
            .build(Endian::Little);
        h.bus.write_all(&signal).unwrap();
        h.bus.shutdown(std::net::Shutdown::Both).unwrap();
        h.connection.handle_event(SideKind::Bus, true, false);

        assert_eq!(read_message(&mut h.client), signal);
        assert!(h.connection.is_finished());
    }
}
