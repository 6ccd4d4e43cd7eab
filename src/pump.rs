//! One non-blocking side of a proxied connection.
//!
//! A [`Side`] owns one socket. It assembles incoming bytes into complete
//! messages (fixed header first, then a buffer sized to exactly the rest),
//! collects file descriptors received alongside them, and drains a queue of
//! outgoing buffers whenever the socket accepts more data.
//!
//! # Security
//! - Message sizes are validated from the fixed header before allocating
//! - Received fds are bounded and only handed out in the exact count a
//!   message declares
//! - Sends use `MSG_NOSIGNAL` so a vanished peer is an error, not a signal

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, IoSlice, IoSliceMut};
use std::mem::MaybeUninit;
use std::net::Shutdown;
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::os::unix::net::UnixStream;

use rustix::net::{
    recvmsg, sendmsg, RecvAncillaryBuffer, RecvAncillaryMessage, RecvFlags, ReturnFlags,
    SendAncillaryBuffer, SendAncillaryMessage, SendFlags, UCred,
};

use crate::buffer::Buffer;
use crate::error::ProxyError;
use crate::wire::{self, FIXED_HEADER_SIZE, MAX_UNIX_FDS};

// =============================================================================
// Constants and Limits
// =============================================================================

/// Maximum file descriptors accepted by one read
const MAX_FDS_PER_READ: usize = MAX_UNIX_FDS as usize;

/// Maximum file descriptors received but not yet claimed by a message
const MAX_PENDING_FDS: usize = 4 * MAX_FDS_PER_READ;

/// Read size while relaying the handshake
pub const AUTH_READ_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SideKind {
    Client,
    Bus,
}

impl SideKind {
    pub fn other(self) -> Self {
        match self {
            SideKind::Client => SideKind::Bus,
            SideKind::Bus => SideKind::Client,
        }
    }
}

impl fmt::Display for SideKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SideKind::Client => "client",
            SideKind::Bus => "bus",
        })
    }
}

/// Result of trying to read one message.
#[derive(Debug)]
pub enum ReadOutcome {
    Decoded(Buffer),
    Incomplete,
    Eof,
}

// =============================================================================
// Socket I/O with File Descriptors
// =============================================================================

/// Receive data and file descriptors from a Unix socket.
fn recv_with_fds(
    socket: &UnixStream,
    buf: &mut [u8],
    fds: &mut VecDeque<OwnedFd>,
) -> io::Result<usize> {
    let mut cmsg_space = [MaybeUninit::uninit(); rustix::cmsg_space!(ScmRights(MAX_FDS_PER_READ))];
    let mut cmsg_buffer = RecvAncillaryBuffer::new(&mut cmsg_space);
    let mut iov = [IoSliceMut::new(buf)];

    let msg = recvmsg(
        socket.as_fd(),
        &mut iov[..],
        &mut cmsg_buffer,
        RecvFlags::DONTWAIT | RecvFlags::CMSG_CLOEXEC,
    )?;

    for cmsg in cmsg_buffer.drain() {
        if let RecvAncillaryMessage::ScmRights(received_fds) = cmsg {
            for fd in received_fds {
                log::trace!("[FD] Received fd={}", fd.as_raw_fd());
                fds.push_back(fd);
            }
        }
    }

    if msg.flags.contains(ReturnFlags::CTRUNC) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "ancillary data truncated",
        ));
    }

    if msg.bytes > 0 {
        log::trace!("[RECV] {} bytes, {} fds pending", msg.bytes, fds.len());
    }

    Ok(msg.bytes)
}

/// Credentials of this process, relayed with the first byte of a connection.
fn own_credentials() -> UCred {
    UCred {
        pid: rustix::process::getpid(),
        uid: rustix::process::getuid(),
        gid: rustix::process::getgid(),
    }
}

/// Send data, plus file descriptors and credentials if given, to a Unix socket.
///
/// The kernel duplicates the fds into the message; the caller still owns
/// (and eventually closes) its copies.
fn send_with_fds(
    socket: &UnixStream,
    buf: &[u8],
    fds: &[OwnedFd],
    credentials: bool,
) -> io::Result<usize> {
    let iov = [IoSlice::new(buf)];
    let flags = SendFlags::DONTWAIT | SendFlags::NOSIGNAL;

    if fds.is_empty() && !credentials {
        let mut empty_cmsg = [];
        let mut cmsg_buffer = SendAncillaryBuffer::new(&mut empty_cmsg);
        let result = sendmsg(socket.as_fd(), &iov, &mut cmsg_buffer, flags)?;
        log::trace!("[SEND] {} bytes", result);
        return Ok(result);
    }

    let borrowed: Vec<BorrowedFd<'_>> = fds.iter().map(|fd| fd.as_fd()).collect();
    let space = rustix::cmsg_space!(ScmRights(borrowed.len()))
        + rustix::cmsg_space!(ScmCredentials(1));
    let mut cmsg_space = vec![MaybeUninit::uninit(); space];
    let mut cmsg_buffer = SendAncillaryBuffer::new(&mut cmsg_space);
    if !borrowed.is_empty() {
        cmsg_buffer.push(SendAncillaryMessage::ScmRights(&borrowed));
    }
    if credentials {
        cmsg_buffer.push(SendAncillaryMessage::ScmCredentials(own_credentials()));
    }

    let result = sendmsg(socket.as_fd(), &iov, &mut cmsg_buffer, flags)?;
    log::trace!(
        "[SEND] {} bytes, {} fds{}",
        result,
        borrowed.len(),
        if credentials { ", credentials" } else { "" }
    );
    Ok(result)
}

/// Fill `target` from bytes left over from the handshake, else from the socket.
fn fill(
    replay: &mut Vec<u8>,
    stream: &UnixStream,
    fds: &mut VecDeque<OwnedFd>,
    target: &mut [u8],
) -> io::Result<usize> {
    if replay.is_empty() {
        return recv_with_fds(stream, target, fds);
    }
    let n = replay.len().min(target.len());
    target[..n].copy_from_slice(&replay[..n]);
    replay.drain(..n);
    Ok(n)
}

// =============================================================================
// Side
// =============================================================================

pub struct Side {
    kind: SideKind,
    stream: UnixStream,
    /// Fixed header of the message being read
    header: [u8; FIXED_HEADER_SIZE],
    header_filled: usize,
    /// Message being read, sized from its fixed header
    current: Option<Buffer>,
    /// Bytes read past the end of the handshake
    replay: Vec<u8>,
    pending_fds: VecDeque<OwnedFd>,
    outgoing: VecDeque<Buffer>,
    closed: bool,
    read_shut: bool,
    paused: bool,
}

impl Side {
    pub fn new(kind: SideKind, stream: UnixStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self {
            kind,
            stream,
            header: [0; FIXED_HEADER_SIZE],
            header_filled: 0,
            current: None,
            replay: Vec::new(),
            pending_fds: VecDeque::new(),
            outgoing: VecDeque::new(),
            closed: false,
            read_shut: false,
            paused: false,
        })
    }

    /// A second handle to the socket, for event loop registration.
    pub fn try_clone_stream(&self) -> io::Result<UnixStream> {
        self.stream.try_clone()
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    #[inline]
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn set_paused(&mut self, paused: bool) {
        if self.paused != paused {
            log::debug!("[{}] Reading {}", self.kind, if paused { "paused" } else { "resumed" });
        }
        self.paused = paused;
    }

    #[inline]
    pub fn can_read(&self) -> bool {
        !self.closed && !self.read_shut && !self.paused
    }

    /// Unframed read, used while the handshake is relayed.
    pub fn read_raw(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = fill(&mut self.replay, &self.stream, &mut self.pending_fds, buf)?;
        self.check_pending_fds()?;
        Ok(n)
    }

    /// Keep bytes that were read with the handshake but start the framed
    /// traffic.
    pub fn stash(&mut self, bytes: &[u8]) {
        if !bytes.is_empty() {
            log::trace!("[{}] Replaying {} bytes after handshake", self.kind, bytes.len());
            self.replay.extend_from_slice(bytes);
        }
    }

    fn check_pending_fds(&self) -> io::Result<()> {
        if self.pending_fds.len() > MAX_PENDING_FDS {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "too many unclaimed file descriptors",
            ));
        }
        Ok(())
    }

    /// Read until one complete message is assembled or the socket runs dry.
    pub fn read_message(&mut self) -> Result<ReadOutcome, ProxyError> {
        if self.current.is_none() {
            while self.header_filled < FIXED_HEADER_SIZE {
                let target = &mut self.header[self.header_filled..];
                match fill(&mut self.replay, &self.stream, &mut self.pending_fds, target) {
                    Ok(0) => return Ok(ReadOutcome::Eof),
                    Ok(n) => self.header_filled += n,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return Ok(ReadOutcome::Incomplete)
                    }
                    Err(e) => return Err(e.into()),
                }
                self.check_pending_fds()?;
            }

            let size = wire::message_size(&self.header)?;
            let mut buffer = Buffer::with_size(size);
            buffer.data_mut()[..FIXED_HEADER_SIZE].copy_from_slice(&self.header);
            buffer.advance(FIXED_HEADER_SIZE);
            self.header_filled = 0;
            self.current = Some(buffer);
        }

        if let Some(buffer) = self.current.as_mut() {
            while !buffer.is_complete() {
                match fill(&mut self.replay, &self.stream, &mut self.pending_fds, buffer.remaining_mut()) {
                    Ok(0) => return Ok(ReadOutcome::Eof),
                    Ok(n) => buffer.advance(n),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return Ok(ReadOutcome::Incomplete)
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
        self.check_pending_fds()?;

        match self.current.take() {
            Some(mut buffer) => {
                buffer.rewind();
                Ok(ReadOutcome::Decoded(buffer))
            }
            None => Ok(ReadOutcome::Incomplete),
        }
    }

    /// Hand out the fds received with the message just read. Fds arrive with
    /// the first byte of their message and reads never cross a message
    /// boundary, so the count must match exactly.
    pub fn claim_fds(&mut self, count: u32) -> Result<Vec<OwnedFd>, ProxyError> {
        let declared = count as usize;
        let received = self.pending_fds.len();
        if received < declared {
            return Err(ProxyError::MissingFds {
                declared: count,
                available: received,
            });
        }
        if received > declared {
            self.pending_fds.clear();
            return Err(ProxyError::ExtraFds { declared: count, received });
        }
        Ok(self.pending_fds.drain(..).collect())
    }

    /// Queue a buffer for sending. Buffers for a closed side are dropped.
    pub fn queue(&mut self, buffer: Buffer) {
        if self.closed {
            log::trace!("[{}] Dropping {} bytes for closed side", self.kind, buffer.len());
            return;
        }
        self.outgoing.push_back(buffer);
    }

    #[inline]
    pub fn has_pending_writes(&self) -> bool {
        !self.outgoing.is_empty()
    }

    /// Write queued buffers until the queue is empty or the socket is full.
    pub fn flush(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        while let Some(front) = self.outgoing.front_mut() {
            let first_chunk = front.pos() == 0;
            let fds = if first_chunk { front.fds() } else { &[] };
            let credentials = first_chunk && front.send_credentials();
            match send_with_fds(&self.stream, front.remaining(), fds, credentials) {
                Ok(n) => {
                    if n > 0 && first_chunk {
                        // Ancillary data went out with the first byte; close our copies
                        drop(front.take_fds());
                        front.set_send_credentials(false);
                    }
                    front.advance(n);
                    if front.is_complete() {
                        self.outgoing.pop_front();
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Stop reading but keep writing what is queued.
    pub fn shutdown_read(&mut self) {
        if !self.read_shut && !self.closed {
            let _ = self.stream.shutdown(Shutdown::Read);
            self.read_shut = true;
        }
    }

    /// Close the socket and discard anything not yet sent or claimed.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        log::debug!(
            "[{}] Closing ({} buffers unsent, {} fds unclaimed)",
            self.kind,
            self.outgoing.len(),
            self.pending_fds.len()
        );
        let _ = self.stream.shutdown(Shutdown::Both);
        self.closed = true;
        self.outgoing.clear();
        self.pending_fds.clear();
        self.current = None;
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{Endian, Header, MessageBuilder};
    use std::io::{Read, Write};

    fn pair() -> (Side, Side) {
        let (a, b) = UnixStream::pair().unwrap();
        (
            Side::new(SideKind::Client, a).unwrap(),
            Side::new(SideKind::Bus, b).unwrap(),
        )
    }

    fn message(serial: u32) -> Vec<u8> {
        MessageBuilder::method_call("org.example.App", "/", "org.example.Iface", "Frob")
            .serial(serial)
            .arg_str("payload")
            .build(Endian::Little)
    }

    #[test]
    fn test_roundtrip_through_queue() {
        let (mut a, mut b) = pair();
        a.queue(Buffer::from_vec(message(1)));
        a.queue(Buffer::from_vec(message(2)));
        a.flush().unwrap();
        assert!(!a.has_pending_writes());

        for serial in [1, 2] {
            match b.read_message().unwrap() {
                ReadOutcome::Decoded(buffer) => {
                    assert_eq!(buffer.data(), message(serial).as_slice());
                }
                other => panic!("expected a message, got {:?}", other),
            }
        }
        assert!(matches!(b.read_message().unwrap(), ReadOutcome::Incomplete));
    }

    #[test]
    fn test_message_split_across_writes() {
        let (a, mut b) = UnixStream::pair().map(|(a, b)| (a, Side::new(SideKind::Bus, b).unwrap())).unwrap();
        let mut a = a;
        let data = message(9);
        a.write_all(&data[..10]).unwrap();
        assert!(matches!(b.read_message().unwrap(), ReadOutcome::Incomplete));
        a.write_all(&data[10..30]).unwrap();
        assert!(matches!(b.read_message().unwrap(), ReadOutcome::Incomplete));
        a.write_all(&data[30..]).unwrap();
        match b.read_message().unwrap() {
            ReadOutcome::Decoded(buffer) => assert_eq!(buffer.data(), data.as_slice()),
            other => panic!("expected a message, got {:?}", other),
        }
    }

    #[test]
    fn test_replayed_bytes_come_first() {
        let (mut a, mut b) = UnixStream::pair()
            .map(|(a, b)| (a, Side::new(SideKind::Client, b).unwrap()))
            .unwrap();
        let data = message(4);
        b.stash(&data[..20]);
        a.write_all(&data[20..]).unwrap();
        match b.read_message().unwrap() {
            ReadOutcome::Decoded(buffer) => assert_eq!(buffer.data(), data.as_slice()),
            other => panic!("expected a message, got {:?}", other),
        }
    }

    #[test]
    fn test_eof_and_oversized_header() {
        let (a, mut b) = UnixStream::pair()
            .map(|(a, b)| (a, Side::new(SideKind::Bus, b).unwrap()))
            .unwrap();
        let mut a = a;
        let mut data = message(1);
        Endian::Little.write_u32(&mut data, 4, u32::MAX);
        a.write_all(&data[..FIXED_HEADER_SIZE]).unwrap();
        assert!(matches!(b.read_message(), Err(ProxyError::Wire(_))));

        let (a, mut b) = pair();
        drop(a);
        assert!(matches!(b.read_message().unwrap(), ReadOutcome::Eof));
    }

    #[test]
    fn test_fds_travel_with_their_message() {
        let (mut a, mut b) = pair();
        let (pipe_read, pipe_write) = rustix::pipe::pipe().unwrap();

        let mut buffer = Buffer::from_vec(message(3));
        buffer.attach_fds(vec![pipe_write]);
        a.queue(buffer);
        a.flush().unwrap();

        let received = match b.read_message().unwrap() {
            ReadOutcome::Decoded(buffer) => buffer,
            other => panic!("expected a message, got {:?}", other),
        };
        assert_eq!(Header::parse(received.data()).unwrap().serial, 3);
        assert!(matches!(
            b.claim_fds(2),
            Err(ProxyError::MissingFds { declared: 2, available: 1 })
        ));
        let mut fds = b.claim_fds(1).unwrap();
        let write_end = fds.pop().unwrap();

        let mut writer = std::fs::File::from(write_end);
        writer.write_all(b"ok").unwrap();
        drop(writer);
        let mut reader = std::fs::File::from(pipe_read);
        let mut out = String::new();
        reader.read_to_string(&mut out).unwrap();
        assert_eq!(out, "ok");
    }

    #[test]
    fn test_undeclared_fds_are_fatal() {
        let (mut a, mut b) = pair();
        let (_pipe_read, pipe_write) = rustix::pipe::pipe().unwrap();

        let mut buffer = Buffer::from_vec(message(4));
        buffer.attach_fds(vec![pipe_write]);
        a.queue(buffer);
        a.flush().unwrap();

        assert!(matches!(b.read_message().unwrap(), ReadOutcome::Decoded(_)));
        assert!(matches!(
            b.claim_fds(0),
            Err(ProxyError::ExtraFds { declared: 0, received: 1 })
        ));
        // Nothing is left over for the next message
        assert!(b.claim_fds(0).unwrap().is_empty());
    }

    #[test]
    fn test_closed_side_drops_output() {
        let (mut a, _b) = pair();
        a.close();
        a.queue(Buffer::from_vec(message(1)));
        assert!(!a.has_pending_writes());
        assert!(a.is_closed());
        assert!(!a.can_read());
    }
}
