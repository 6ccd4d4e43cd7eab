//! D-Bus message wire codec.
//!
//! Decodes message headers from untrusted bytes, rewrites serial numbers in
//! place, reads the handful of body arguments the router needs, and builds
//! the messages the proxy synthesizes.
//!
//! # Wire Format
//! ```text
//! ┌────────┬──────┬───────┬─────────┬──────────┬──────────┬───────────────┬─────┬──────┐
//! │ endian │ type │ flags │ version │ body len │  serial  │ fields length │ ... │ body │
//! │ (1 b)  │ (1 b)│ (1 b) │  (1 b)  │  (4 b)   │  (4 b)   │    (4 b)      │     │      │
//! └────────┴──────┴───────┴─────────┴──────────┴──────────┴───────────────┴─────┴──────┘
//! ```
//! The header-fields array is a sequence of 8-byte aligned `(byte, variant)`
//! structs and the body starts at the next 8-byte boundary after it.
//!
//! # Security
//! - Every length is checked against the end of the region it lives in
//! - Unknown header fields and mismatched field signatures fail the parse
//! - Signals on the reserved local path/interface are rejected

use std::fmt;

use bitflags::bitflags;

use crate::error::WireError;

// =============================================================================
// Constants and Limits
// =============================================================================

/// Size of the fixed part of every message header
pub const FIXED_HEADER_SIZE: usize = 16;

/// Largest message the reference bus accepts (128 MiB)
pub const MAX_MESSAGE_SIZE: usize = 128 * 1024 * 1024;

/// Largest array, including the header-fields array (64 MiB)
pub const MAX_ARRAY_SIZE: usize = 64 * 1024 * 1024;

/// Largest number of fds a single message may carry
pub const MAX_UNIX_FDS: u32 = 253;

const PROTOCOL_VERSION: u8 = 1;

pub const BUS_NAME: &str = "org.freedesktop.DBus";
pub const BUS_PATH: &str = "/org/freedesktop/DBus";
pub const BUS_INTERFACE: &str = "org.freedesktop.DBus";
pub const PEER_INTERFACE: &str = "org.freedesktop.DBus.Peer";
pub const INTROSPECTABLE_INTERFACE: &str = "org.freedesktop.DBus.Introspectable";
const LOCAL_PATH: &str = "/org/freedesktop/DBus/Local";
const LOCAL_INTERFACE: &str = "org.freedesktop.DBus.Local";

/// Header field codes
mod fields {
    pub const PATH: u8 = 1;
    pub const INTERFACE: u8 = 2;
    pub const MEMBER: u8 = 3;
    pub const ERROR_NAME: u8 = 4;
    pub const REPLY_SERIAL: u8 = 5;
    pub const DESTINATION: u8 = 6;
    pub const SENDER: u8 = 7;
    pub const SIGNATURE: u8 = 8;
    pub const UNIX_FDS: u8 = 9;
}

// =============================================================================
// Basic Types
// =============================================================================

/// Byte order of one message, taken from its first byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

impl Endian {
    pub fn native() -> Self {
        if cfg!(target_endian = "big") {
            Endian::Big
        } else {
            Endian::Little
        }
    }

    fn from_marker(marker: u8) -> Result<Self, WireError> {
        match marker {
            b'l' => Ok(Endian::Little),
            b'B' => Ok(Endian::Big),
            other => Err(WireError::InvalidEndianness(other)),
        }
    }

    fn marker(self) -> u8 {
        match self {
            Endian::Little => b'l',
            Endian::Big => b'B',
        }
    }

    /// Read a u32 at `at`, or `None` if it does not fit in `data`.
    #[inline]
    pub fn read_u32(self, data: &[u8], at: usize) -> Option<u32> {
        let bytes: [u8; 4] = data.get(at..at.checked_add(4)?)?.try_into().ok()?;
        Some(match self {
            Endian::Little => u32::from_le_bytes(bytes),
            Endian::Big => u32::from_be_bytes(bytes),
        })
    }

    #[inline]
    fn u32_bytes(self, value: u32) -> [u8; 4] {
        match self {
            Endian::Little => value.to_le_bytes(),
            Endian::Big => value.to_be_bytes(),
        }
    }

    /// Overwrite the u32 at `at`. Out-of-range writes are ignored.
    #[inline]
    pub fn write_u32(self, data: &mut [u8], at: usize, value: u32) {
        if let Some(slot) = data.get_mut(at..at + 4) {
            slot.copy_from_slice(&self.u32_bytes(value));
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    MethodCall = 1,
    MethodReturn = 2,
    Error = 3,
    Signal = 4,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Result<Self, WireError> {
        match value {
            1 => Ok(MessageType::MethodCall),
            2 => Ok(MessageType::MethodReturn),
            3 => Ok(MessageType::Error),
            4 => Ok(MessageType::Signal),
            other => Err(WireError::UnknownType(other)),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MessageType::MethodCall => "call",
            MessageType::MethodReturn => "return",
            MessageType::Error => "error",
            MessageType::Signal => "signal",
        })
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MessageFlags: u8 {
        const NO_REPLY_EXPECTED = 0x1;
        const NO_AUTO_START = 0x2;
        const ALLOW_INTERACTIVE_AUTHORIZATION = 0x4;
    }
}

#[inline]
pub fn align_to(offset: usize, alignment: usize) -> usize {
    (offset + alignment - 1) & !(alignment - 1)
}

/// Total size of the message whose fixed header is at the start of `fixed`.
///
/// Used by the reader to size the buffer for the rest of the message before
/// any of it has been received.
pub fn message_size(fixed: &[u8]) -> Result<usize, WireError> {
    if fixed.len() < FIXED_HEADER_SIZE {
        return Err(WireError::TooShort);
    }
    let endian = Endian::from_marker(fixed[0])?;
    if fixed[3] != PROTOCOL_VERSION {
        return Err(WireError::InvalidProtocol(fixed[3]));
    }
    let body_len = endian.read_u32(fixed, 4).ok_or(WireError::TooShort)? as usize;
    let array_len = endian.read_u32(fixed, 12).ok_or(WireError::TooShort)? as usize;
    if array_len > MAX_ARRAY_SIZE {
        return Err(WireError::TooLarge(array_len));
    }
    let total = align_to(FIXED_HEADER_SIZE + array_len, 8)
        .checked_add(body_len)
        .ok_or(WireError::TooLarge(usize::MAX))?;
    if total > MAX_MESSAGE_SIZE {
        return Err(WireError::TooLarge(total));
    }
    Ok(total)
}

// =============================================================================
// Bounded Reader
// =============================================================================

/// Cursor over `data[pos..end]`. Alignment is computed on absolute offsets,
/// which is correct because the header and the body both start 8-aligned.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
    end: usize,
    endian: Endian,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8], pos: usize, end: usize, endian: Endian) -> Self {
        Self {
            data,
            pos,
            end: end.min(data.len()),
            endian,
        }
    }

    fn align(&mut self, alignment: usize) -> Result<(), WireError> {
        let pos = align_to(self.pos, alignment);
        if pos > self.end {
            return Err(WireError::Truncated);
        }
        self.pos = pos;
        Ok(())
    }

    fn u8(&mut self) -> Result<u8, WireError> {
        if self.pos >= self.end {
            return Err(WireError::Truncated);
        }
        let value = self.data[self.pos];
        self.pos += 1;
        Ok(value)
    }

    fn u32(&mut self) -> Result<u32, WireError> {
        self.align(4)?;
        if self.pos + 4 > self.end {
            return Err(WireError::Truncated);
        }
        let value = self
            .endian
            .read_u32(self.data, self.pos)
            .ok_or(WireError::Truncated)?;
        self.pos += 4;
        Ok(value)
    }

    /// `len` bytes followed by a NUL, all inside the region.
    fn terminated(&mut self, len: usize) -> Result<&'a str, WireError> {
        let start = self.pos;
        let nul = start.checked_add(len).ok_or(WireError::Truncated)?;
        if nul >= self.end {
            return Err(WireError::Truncated);
        }
        if self.data[nul] != 0 {
            return Err(WireError::InvalidString);
        }
        let bytes = &self.data[start..nul];
        if bytes.contains(&0) {
            return Err(WireError::InvalidString);
        }
        let text = std::str::from_utf8(bytes).map_err(|_| WireError::InvalidString)?;
        self.pos = nul + 1;
        Ok(text)
    }

    fn string(&mut self) -> Result<&'a str, WireError> {
        let len = self.u32()? as usize;
        self.terminated(len)
    }

    fn signature(&mut self) -> Result<&'a str, WireError> {
        let len = self.u8()? as usize;
        self.terminated(len)
    }

    fn string_array(&mut self) -> Result<Vec<&'a str>, WireError> {
        let len = self.u32()? as usize;
        if len > MAX_ARRAY_SIZE {
            return Err(WireError::TooLarge(len));
        }
        // Elements are strings, which need no padding beyond the length word.
        let end = self.pos.checked_add(len).ok_or(WireError::Truncated)?;
        if end > self.end {
            return Err(WireError::Truncated);
        }
        let mut items = Vec::new();
        while self.pos < end {
            items.push(self.string()?);
        }
        if self.pos != end {
            return Err(WireError::Truncated);
        }
        Ok(items)
    }
}

// =============================================================================
// Header
// =============================================================================

/// Decoded view of one message header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub endian: Endian,
    pub kind: MessageType,
    pub flags: MessageFlags,
    pub body_len: u32,
    pub serial: u32,
    pub reply_serial: Option<u32>,
    pub path: Option<String>,
    pub interface: Option<String>,
    pub member: Option<String>,
    pub error_name: Option<String>,
    pub destination: Option<String>,
    pub sender: Option<String>,
    pub signature: Option<String>,
    pub unix_fds: u32,
    /// Offset of the body within the message
    pub body_offset: usize,
    reply_serial_pos: Option<usize>,
}

fn expect_signature(code: u8, signature: &str, expected: &str) -> Result<(), WireError> {
    if signature == expected {
        Ok(())
    } else {
        Err(WireError::FieldSignature {
            code,
            signature: signature.to_owned(),
        })
    }
}

impl Header {
    /// Decode and validate the header of the complete message in `data`.
    pub fn parse(data: &[u8]) -> Result<Self, WireError> {
        if data.len() < FIXED_HEADER_SIZE {
            return Err(WireError::TooShort);
        }

        let endian = Endian::from_marker(data[0])?;
        let kind_byte = data[1];
        let flags = MessageFlags::from_bits_retain(data[2]);
        if data[3] != PROTOCOL_VERSION {
            return Err(WireError::InvalidProtocol(data[3]));
        }

        let body_len = endian.read_u32(data, 4).ok_or(WireError::TooShort)?;
        let serial = endian.read_u32(data, 8).ok_or(WireError::TooShort)?;
        if serial == 0 {
            return Err(WireError::ZeroSerial);
        }
        let array_len = endian.read_u32(data, 12).ok_or(WireError::TooShort)? as usize;
        if array_len > MAX_ARRAY_SIZE {
            return Err(WireError::TooLarge(array_len));
        }

        let fields_end = FIXED_HEADER_SIZE + array_len;
        let body_offset = align_to(fields_end, 8);
        if body_offset > data.len() || body_offset + body_len as usize > data.len() {
            log::trace!(
                "[WIRE] Header needs {} + {} bytes, have {}",
                body_offset,
                body_len,
                data.len()
            );
            return Err(WireError::Truncated);
        }

        let kind = MessageType::from_u8(kind_byte)?;
        let mut header = Header {
            endian,
            kind,
            flags,
            body_len,
            serial,
            reply_serial: None,
            path: None,
            interface: None,
            member: None,
            error_name: None,
            destination: None,
            sender: None,
            signature: None,
            unix_fds: 0,
            body_offset,
            reply_serial_pos: None,
        };

        let mut reader = Reader::new(data, FIXED_HEADER_SIZE, fields_end, endian);
        while reader.pos < fields_end {
            reader.align(8)?;
            let code = reader.u8()?;
            let signature = reader.signature()?;
            match code {
                fields::PATH => {
                    expect_signature(code, signature, "o")?;
                    header.path = Some(reader.string()?.to_owned());
                }
                fields::INTERFACE => {
                    expect_signature(code, signature, "s")?;
                    header.interface = Some(reader.string()?.to_owned());
                }
                fields::MEMBER => {
                    expect_signature(code, signature, "s")?;
                    header.member = Some(reader.string()?.to_owned());
                }
                fields::ERROR_NAME => {
                    expect_signature(code, signature, "s")?;
                    header.error_name = Some(reader.string()?.to_owned());
                }
                fields::REPLY_SERIAL => {
                    expect_signature(code, signature, "u")?;
                    reader.align(4)?;
                    header.reply_serial_pos = Some(reader.pos);
                    header.reply_serial = Some(reader.u32()?);
                }
                fields::DESTINATION => {
                    expect_signature(code, signature, "s")?;
                    header.destination = Some(reader.string()?.to_owned());
                }
                fields::SENDER => {
                    expect_signature(code, signature, "s")?;
                    header.sender = Some(reader.string()?.to_owned());
                }
                fields::SIGNATURE => {
                    expect_signature(code, signature, "g")?;
                    header.signature = Some(reader.signature()?.to_owned());
                }
                fields::UNIX_FDS => {
                    expect_signature(code, signature, "u")?;
                    header.unix_fds = reader.u32()?;
                }
                other => return Err(WireError::UnknownField(other)),
            }
        }

        header.check_required()?;

        if header.unix_fds > MAX_UNIX_FDS {
            return Err(WireError::TooManyFds(header.unix_fds));
        }

        Ok(header)
    }

    fn check_required(&self) -> Result<(), WireError> {
        match self.kind {
            MessageType::MethodCall => {
                if self.path.is_none() || self.member.is_none() {
                    return Err(WireError::MissingField("method call"));
                }
            }
            MessageType::MethodReturn => {
                if self.reply_serial.is_none() {
                    return Err(WireError::MissingField("method return"));
                }
            }
            MessageType::Error => {
                if self.reply_serial.is_none() || self.error_name.is_none() {
                    return Err(WireError::MissingField("error"));
                }
            }
            MessageType::Signal => {
                let (Some(path), Some(interface), Some(_)) =
                    (&self.path, &self.interface, &self.member)
                else {
                    return Err(WireError::MissingField("signal"));
                };
                if path == LOCAL_PATH || interface == LOCAL_INTERFACE {
                    return Err(WireError::LocalSignal);
                }
            }
        }
        Ok(())
    }

    /// Shift this message's serial by `offset`, in the header and in `data`.
    ///
    /// Returns `None` if the shifted serial would overflow.
    pub fn apply_serial_offset(&mut self, data: &mut [u8], offset: u32) -> Option<u32> {
        let serial = self.serial.checked_add(offset)?;
        if offset > 0 {
            self.endian.write_u32(data, 8, serial);
            self.serial = serial;
        }
        Some(serial)
    }

    /// Rewrite the reply serial in `data` from the bus's serial space into
    /// the client's, and return the value the client will see.
    ///
    /// Serials at or below `hello_serial + offset` were sent before any
    /// offset applied (or are fake serials) and are left alone.
    /// `self.reply_serial` keeps the bus-side value for reply matching.
    pub fn unshift_reply_serial(&self, data: &mut [u8], offset: u32, hello_serial: u32) -> Option<u32> {
        let reply_serial = self.reply_serial?;
        if offset == 0 || reply_serial <= hello_serial.saturating_add(offset) {
            return Some(reply_serial);
        }
        let client_serial = reply_serial - offset;
        if let Some(pos) = self.reply_serial_pos {
            self.endian.write_u32(data, pos, client_serial);
        }
        Some(client_serial)
    }

    /// Whether the receiver of this message is supposed to answer it.
    #[inline]
    pub fn expects_reply(&self) -> bool {
        self.kind == MessageType::MethodCall
            && !self.flags.contains(MessageFlags::NO_REPLY_EXPECTED)
    }

    /// Addressed to the bus driver itself (or to no one, which the bus
    /// treats the same for method calls).
    pub fn is_for_bus(&self) -> bool {
        match self.destination.as_deref() {
            None => true,
            Some(dest) => dest == BUS_NAME,
        }
    }

    pub fn is_introspection_call(&self) -> bool {
        self.kind == MessageType::MethodCall
            && self.interface.as_deref() == Some(INTROSPECTABLE_INTERFACE)
    }

    pub fn is_name_owner_changed(&self) -> bool {
        self.kind == MessageType::Signal
            && self.sender.as_deref() == Some(BUS_NAME)
            && self.interface.as_deref() == Some(BUS_INTERFACE)
            && self.member.as_deref() == Some("NameOwnerChanged")
    }

    fn body_reader<'a>(&self, data: &'a [u8]) -> Reader<'a> {
        Reader::new(
            data,
            self.body_offset,
            self.body_offset + self.body_len as usize,
            self.endian,
        )
    }

    /// First body argument, if the body starts with a string or object path.
    pub fn arg0_str<'a>(&self, data: &'a [u8]) -> Option<&'a str> {
        let signature = self.signature.as_deref()?;
        if !signature.starts_with('s') && !signature.starts_with('o') {
            return None;
        }
        self.body_reader(data).string().ok()
    }

    /// First body argument, if the body starts with an array of strings.
    pub fn arg0_str_array<'a>(&self, data: &'a [u8]) -> Option<Vec<&'a str>> {
        if !self.signature.as_deref()?.starts_with("as") {
            return None;
        }
        self.body_reader(data).string_array().ok()
    }

    /// The body of a `(sss)` message such as `NameOwnerChanged`.
    pub fn three_strings<'a>(&self, data: &'a [u8]) -> Option<(&'a str, &'a str, &'a str)> {
        if self.signature.as_deref()? != "sss" {
            return None;
        }
        let mut reader = self.body_reader(data);
        let a = reader.string().ok()?;
        let b = reader.string().ok()?;
        let c = reader.string().ok()?;
        Some((a, b, c))
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} serial={}", self.kind, self.serial)?;
        if let Some(reply_serial) = self.reply_serial {
            write!(f, " reply_serial={}", reply_serial)?;
        }
        for (label, value) in [
            ("dest", &self.destination),
            ("sender", &self.sender),
            ("path", &self.path),
            ("iface", &self.interface),
            ("member", &self.member),
            ("error", &self.error_name),
        ] {
            if let Some(value) = value {
                write!(f, " {}={}", label, value)?;
            }
        }
        Ok(())
    }
}

// =============================================================================
// Message Builder
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arg {
    Str(String),
    Bool(bool),
    StrArray(Vec<String>),
}

impl Arg {
    fn signature(&self) -> &'static str {
        match self {
            Arg::Str(_) => "s",
            Arg::Bool(_) => "b",
            Arg::StrArray(_) => "as",
        }
    }

    fn encode(&self, out: &mut Vec<u8>, endian: Endian) {
        match self {
            Arg::Str(value) => put_string(out, endian, value),
            Arg::Bool(value) => put_u32(out, endian, u32::from(*value)),
            Arg::StrArray(items) => {
                pad_to(out, 4);
                let len_pos = out.len();
                out.extend_from_slice(&[0; 4]);
                let start = out.len();
                for item in items {
                    put_string(out, endian, item);
                }
                let len = (out.len() - start) as u32;
                endian.write_u32(out, len_pos, len);
            }
        }
    }
}

fn pad_to(out: &mut Vec<u8>, alignment: usize) {
    out.resize(align_to(out.len(), alignment), 0);
}

fn put_u32(out: &mut Vec<u8>, endian: Endian, value: u32) {
    pad_to(out, 4);
    out.extend_from_slice(&endian.u32_bytes(value));
}

fn put_string(out: &mut Vec<u8>, endian: Endian, value: &str) {
    put_u32(out, endian, value.len() as u32);
    out.extend_from_slice(value.as_bytes());
    out.push(0);
}

fn put_field_string(out: &mut Vec<u8>, endian: Endian, code: u8, signature: u8, value: &str) {
    pad_to(out, 8);
    out.extend_from_slice(&[code, 1, signature, 0]);
    put_string(out, endian, value);
}

/// Builder for the messages the proxy sends on its own behalf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageBuilder {
    kind: MessageType,
    flags: MessageFlags,
    serial: u32,
    reply_serial: Option<u32>,
    path: Option<String>,
    interface: Option<String>,
    member: Option<String>,
    error_name: Option<String>,
    destination: Option<String>,
    sender: Option<String>,
    args: Vec<Arg>,
}

impl MessageBuilder {
    fn new(kind: MessageType) -> Self {
        Self {
            kind,
            flags: MessageFlags::empty(),
            serial: 1,
            reply_serial: None,
            path: None,
            interface: None,
            member: None,
            error_name: None,
            destination: None,
            sender: None,
            args: Vec::new(),
        }
    }

    pub fn method_call(destination: &str, path: &str, interface: &str, member: &str) -> Self {
        let mut builder = Self::new(MessageType::MethodCall);
        builder.destination = Some(destination.to_owned());
        builder.path = Some(path.to_owned());
        builder.interface = Some(interface.to_owned());
        builder.member = Some(member.to_owned());
        builder
    }

    /// Method call to the bus driver.
    pub fn bus_call(member: &str) -> Self {
        Self::method_call(BUS_NAME, BUS_PATH, BUS_INTERFACE, member)
    }

    pub fn signal(path: &str, interface: &str, member: &str) -> Self {
        let mut builder = Self::new(MessageType::Signal);
        builder.path = Some(path.to_owned());
        builder.interface = Some(interface.to_owned());
        builder.member = Some(member.to_owned());
        builder
    }

    pub fn method_return(reply_serial: u32) -> Self {
        let mut builder = Self::new(MessageType::MethodReturn);
        builder.reply_serial = Some(reply_serial);
        builder
    }

    pub fn error(reply_serial: u32, error_name: &str) -> Self {
        let mut builder = Self::new(MessageType::Error);
        builder.reply_serial = Some(reply_serial);
        builder.error_name = Some(error_name.to_owned());
        builder
    }

    pub fn serial(mut self, serial: u32) -> Self {
        self.serial = serial;
        self
    }

    pub fn flags(mut self, flags: MessageFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn destination(mut self, destination: Option<&str>) -> Self {
        self.destination = destination.map(str::to_owned);
        self
    }

    pub fn sender(mut self, sender: Option<&str>) -> Self {
        self.sender = sender.map(str::to_owned);
        self
    }

    pub fn arg(mut self, arg: Arg) -> Self {
        self.args.push(arg);
        self
    }

    pub fn arg_str(self, value: &str) -> Self {
        self.arg(Arg::Str(value.to_owned()))
    }

    pub fn set_serial(&mut self, serial: u32) {
        self.serial = serial;
    }

    pub fn build(&self, endian: Endian) -> Vec<u8> {
        let mut body = Vec::new();
        let mut signature = String::new();
        for arg in &self.args {
            arg.encode(&mut body, endian);
            signature.push_str(arg.signature());
        }

        let mut out = Vec::with_capacity(128 + body.len());
        out.extend_from_slice(&[endian.marker(), self.kind as u8, self.flags.bits(), PROTOCOL_VERSION]);
        out.extend_from_slice(&endian.u32_bytes(body.len() as u32));
        out.extend_from_slice(&endian.u32_bytes(self.serial));
        out.extend_from_slice(&[0; 4]);

        if let Some(path) = &self.path {
            put_field_string(&mut out, endian, fields::PATH, b'o', path);
        }
        if let Some(interface) = &self.interface {
            put_field_string(&mut out, endian, fields::INTERFACE, b's', interface);
        }
        if let Some(member) = &self.member {
            put_field_string(&mut out, endian, fields::MEMBER, b's', member);
        }
        if let Some(error_name) = &self.error_name {
            put_field_string(&mut out, endian, fields::ERROR_NAME, b's', error_name);
        }
        if let Some(reply_serial) = self.reply_serial {
            pad_to(&mut out, 8);
            out.extend_from_slice(&[fields::REPLY_SERIAL, 1, b'u', 0]);
            put_u32(&mut out, endian, reply_serial);
        }
        if let Some(destination) = &self.destination {
            put_field_string(&mut out, endian, fields::DESTINATION, b's', destination);
        }
        if let Some(sender) = &self.sender {
            put_field_string(&mut out, endian, fields::SENDER, b's', sender);
        }
        if !signature.is_empty() {
            pad_to(&mut out, 8);
            out.extend_from_slice(&[fields::SIGNATURE, 1, b'g', 0, signature.len() as u8]);
            out.extend_from_slice(signature.as_bytes());
            out.push(0);
        }

        let array_len = (out.len() - FIXED_HEADER_SIZE) as u32;
        endian.write_u32(&mut out, 12, array_len);
        pad_to(&mut out, 8);
        out.extend_from_slice(&body);
        out
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn hello(serial: u32) -> Vec<u8> {
        MessageBuilder::bus_call("Hello")
            .serial(serial)
            .build(Endian::Little)
    }

    #[test]
    fn test_parse_method_call() {
        let data = MessageBuilder::method_call("org.example.App", "/org/example", "org.example.Iface", "Frob")
            .serial(7)
            .arg_str("hi")
            .build(Endian::Little);
        let header = Header::parse(&data).expect("valid header");
        assert_eq!(header.kind, MessageType::MethodCall);
        assert_eq!(header.serial, 7);
        assert_eq!(header.destination.as_deref(), Some("org.example.App"));
        assert_eq!(header.path.as_deref(), Some("/org/example"));
        assert_eq!(header.interface.as_deref(), Some("org.example.Iface"));
        assert_eq!(header.member.as_deref(), Some("Frob"));
        assert_eq!(header.signature.as_deref(), Some("s"));
        assert_eq!(header.arg0_str(&data), Some("hi"));
        assert_eq!(message_size(&data), Ok(data.len()));
    }

    #[test]
    fn test_parse_big_endian() {
        let data = MessageBuilder::method_return(3)
            .serial(0x0102_0304)
            .arg_str("x")
            .build(Endian::Big);
        assert_eq!(data[0], b'B');
        assert_eq!(&data[8..12], &[1, 2, 3, 4]);
        let header = Header::parse(&data).unwrap();
        assert_eq!(header.endian, Endian::Big);
        assert_eq!(header.serial, 0x0102_0304);
        assert_eq!(header.reply_serial, Some(3));
        assert_eq!(header.arg0_str(&data), Some("x"));
    }

    #[test]
    fn test_reject_bad_version_and_zero_serial() {
        let mut data = hello(1);
        data[3] = 2;
        assert_eq!(Header::parse(&data), Err(WireError::InvalidProtocol(2)));

        let mut data = hello(1);
        data[8..12].copy_from_slice(&[0; 4]);
        assert_eq!(Header::parse(&data), Err(WireError::ZeroSerial));

        let mut data = hello(1);
        data[0] = b'x';
        assert_eq!(Header::parse(&data), Err(WireError::InvalidEndianness(b'x')));
    }

    #[test]
    fn test_reject_mismatched_field_signature() {
        let mut data = hello(1);
        // PATH field is first: code at 16, signature "o" at 18
        assert_eq!(data[16], fields::PATH);
        data[18] = b's';
        assert!(matches!(
            Header::parse(&data),
            Err(WireError::FieldSignature { code: fields::PATH, .. })
        ));
    }

    #[test]
    fn test_reject_unknown_field() {
        let mut data = hello(1);
        data[16] = 42;
        assert_eq!(Header::parse(&data), Err(WireError::UnknownField(42)));
    }

    #[test]
    fn test_reject_missing_required_fields() {
        let data = MessageBuilder::new(MessageType::MethodCall)
            .destination(Some(BUS_NAME))
            .build(Endian::Little);
        assert_eq!(Header::parse(&data), Err(WireError::MissingField("method call")));

        let data = MessageBuilder::new(MessageType::MethodReturn).build(Endian::Little);
        assert_eq!(Header::parse(&data), Err(WireError::MissingField("method return")));

        let mut error = MessageBuilder::error(1, "org.example.Error");
        error.error_name = None;
        assert_eq!(
            Header::parse(&error.build(Endian::Little)),
            Err(WireError::MissingField("error"))
        );

        let mut signal = MessageBuilder::signal("/a", "org.example.Iface", "Changed");
        signal.member = None;
        assert_eq!(
            Header::parse(&signal.build(Endian::Little)),
            Err(WireError::MissingField("signal"))
        );
    }

    #[test]
    fn test_reject_local_signals() {
        let data = MessageBuilder::signal(LOCAL_PATH, "org.example.Iface", "Disconnected").build(Endian::Little);
        assert_eq!(Header::parse(&data), Err(WireError::LocalSignal));

        let data = MessageBuilder::signal("/a", LOCAL_INTERFACE, "Disconnected").build(Endian::Little);
        assert_eq!(Header::parse(&data), Err(WireError::LocalSignal));
    }

    #[test]
    fn test_reject_fields_array_past_buffer() {
        let mut data = hello(1);
        let array_len = Endian::Little.read_u32(&data, 12).unwrap();
        // Pushing the aligned end one block past the buffer must fail, not read out of bounds
        Endian::Little.write_u32(&mut data, 12, array_len + 8);
        assert_eq!(Header::parse(&data), Err(WireError::Truncated));

        Endian::Little.write_u32(&mut data, 12, u32::MAX);
        assert!(Header::parse(&data).is_err());
        assert!(message_size(&data).is_err());
    }

    #[test]
    fn test_reject_truncated_string() {
        let mut data = hello(1);
        // PATH string length lives at 20; claim it runs past the fields array
        Endian::Little.write_u32(&mut data, 20, 1000);
        assert_eq!(Header::parse(&data), Err(WireError::Truncated));
    }

    #[test]
    fn test_serial_offset_only_touches_serial() {
        let original = MessageBuilder::method_call("org.example.App", "/", "org.example.Iface", "Ping")
            .serial(5)
            .build(Endian::Little);
        let mut data = original.clone();
        let mut header = Header::parse(&data).unwrap();
        assert_eq!(header.apply_serial_offset(&mut data, 3), Some(8));
        assert_eq!(header.serial, 8);
        assert_eq!(&data[..8], &original[..8]);
        assert_eq!(&data[12..], &original[12..]);
        assert_eq!(Header::parse(&data).unwrap().serial, 8);

        let mut header = Header::parse(&data).unwrap();
        assert_eq!(header.apply_serial_offset(&mut data, u32::MAX), None);
    }

    #[test]
    fn test_unshift_reply_serial() {
        let mut data = MessageBuilder::method_return(12).serial(40).build(Endian::Little);
        let header = Header::parse(&data).unwrap();
        // hello=1 with 4 fake messages: 12 maps back to client serial 8
        assert_eq!(header.unshift_reply_serial(&mut data, 4, 1), Some(8));
        assert_eq!(header.reply_serial, Some(12));
        assert_eq!(Header::parse(&data).unwrap().reply_serial, Some(8));

        let mut data = MessageBuilder::method_return(1).serial(41).build(Endian::Little);
        let header = Header::parse(&data).unwrap();
        assert_eq!(header.unshift_reply_serial(&mut data, 4, 1), Some(1));
    }

    #[test]
    fn test_string_array_and_name_owner_changed_bodies() {
        let names = vec![":1.1".to_owned(), "org.example.A".to_owned()];
        let data = MessageBuilder::method_return(2)
            .serial(9)
            .arg(Arg::StrArray(names))
            .build(Endian::Big);
        let header = Header::parse(&data).unwrap();
        assert_eq!(header.arg0_str_array(&data), Some(vec![":1.1", "org.example.A"]));
        assert_eq!(header.arg0_str(&data), None);

        let data = MessageBuilder::signal(BUS_PATH, BUS_INTERFACE, "NameOwnerChanged")
            .sender(Some(BUS_NAME))
            .arg_str("org.example.A")
            .arg_str("")
            .arg_str(":1.9")
            .build(Endian::Little);
        let header = Header::parse(&data).unwrap();
        assert!(header.is_name_owner_changed());
        assert_eq!(header.three_strings(&data), Some(("org.example.A", "", ":1.9")));
    }

    #[test]
    fn test_expects_reply() {
        let data = MessageBuilder::bus_call("AddMatch")
            .flags(MessageFlags::NO_REPLY_EXPECTED)
            .build(Endian::Little);
        let header = Header::parse(&data).unwrap();
        assert!(!header.expects_reply());
        assert!(header.is_for_bus());
        assert!(Header::parse(&hello(2)).unwrap().expects_reply());
    }
}
