//! Per-connection bookkeeping.
//!
//! Tracks which replies each side is owed, the serial offset introduced by
//! fake messages, and what the client has learned about unique connection
//! ids. Policy granted to a unique id only ever grows: once a peer has been
//! visible or callable it stays so for the lifetime of the connection.

use std::collections::{HashMap, HashSet};

use crate::error::ProxyError;
use crate::policy::{match_all, Filter, Policy, PolicyTable};
use crate::wire::{MessageBuilder, BUS_NAME};

/// Highest serial a client may use once offset; the space above it is left
/// for messages the proxy sends on the client's behalf.
pub const MAX_CLIENT_SERIAL: u32 = u32::MAX - 65536 * 2;

/// How the reply to a tracked message must be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedReply {
    /// Forward unchanged
    Normal,
    /// Reply to the client's `Hello`; carries its unique name
    Hello,
    /// Reply to a roundtrip `Ping`; replaced by a synthesized reply
    Rewrite,
    /// Reply to `ListNames`/`ListActivatableNames`; pruned before forwarding
    ListNames,
    /// Reply to a fake `AddMatch`; swallowed
    Filter,
    /// Reply to a fake `GetNameOwner`; records ownership, then swallowed
    FakeGetNameOwner,
    /// Reply to the bootstrap `ListNames`; drives wildcard discovery
    FakeListNames,
}

/// Replies one side owes the other, keyed by the serial of the call.
#[derive(Debug, Default)]
pub struct ExpectedReplies {
    pending: HashMap<u32, ExpectedReply>,
}

impl ExpectedReplies {
    pub fn insert(&mut self, serial: u32, reply: ExpectedReply) -> Result<(), ProxyError> {
        if self.pending.contains_key(&serial) {
            return Err(ProxyError::DuplicateSerial(serial));
        }
        self.pending.insert(serial, reply);
        Ok(())
    }

    /// Consume the expectation for `serial`, if there is one.
    pub fn take(&mut self, serial: u32) -> Option<ExpectedReply> {
        self.pending.remove(&serial)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }
}

/// Calls relayed to the client that it may answer once. Serials are chosen by
/// each caller, so they are only unique together with the caller's name.
#[derive(Debug, Default)]
pub struct PeerCalls {
    pending: HashSet<(String, u32)>,
}

impl PeerCalls {
    pub fn insert(&mut self, caller: &str, serial: u32) {
        if !self.pending.insert((caller.to_owned(), serial)) {
            log::debug!("[STATE] {} reused serial {} before it was answered", caller, serial);
        }
    }

    /// Consume the call answered by a reply to `caller` for `serial`.
    pub fn take(&mut self, caller: &str, serial: u32) -> bool {
        self.pending.remove(&(caller.to_owned(), serial))
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }
}

#[derive(Debug, Default)]
pub struct ConnectionState {
    /// Client calls awaiting a reply from the bus, keyed by bus-side serial
    pub client_calls: ExpectedReplies,
    /// Calls relayed to the client awaiting its reply
    pub bus_calls: PeerCalls,
    serial_offset: u32,
    last_fake_serial: u32,
    hello_serial: Option<u32>,
    last_client_serial: u32,
    unique_id: Option<String>,
    unique_id_policy: HashMap<String, Policy>,
    owned_names: HashMap<String, Vec<String>>,
    rewrite_replies: HashMap<u32, MessageBuilder>,
    name_owner_requests: HashMap<u32, String>,
}

impl ConnectionState {
    pub fn new() -> Self {
        Self::default()
    }

    // -------------------------------------------------------------------------
    // Serials
    // -------------------------------------------------------------------------

    #[inline]
    pub fn serial_offset(&self) -> u32 {
        self.serial_offset
    }

    /// Serial of the client's `Hello`, or 0 before it was seen.
    #[inline]
    pub fn hello_serial(&self) -> u32 {
        self.hello_serial.unwrap_or(0)
    }

    #[inline]
    pub fn has_said_hello(&self) -> bool {
        self.hello_serial.is_some()
    }

    /// Fake messages are numbered right after the `Hello`.
    pub fn set_hello_serial(&mut self, serial: u32) {
        self.hello_serial = Some(serial);
        self.last_fake_serial = serial;
    }

    /// Allocate the serial of a fake message, shifting every later client
    /// serial up by one.
    pub fn next_fake_serial(&mut self) -> u32 {
        self.last_fake_serial += 1;
        self.serial_offset += 1;
        self.last_fake_serial
    }

    /// Accept an (already offset) client serial only if it strictly
    /// increases and stays clear of the fake serial space.
    pub fn check_client_serial(&mut self, serial: u32) -> Result<(), ProxyError> {
        if serial > MAX_CLIENT_SERIAL {
            return Err(ProxyError::SerialOverflow(serial));
        }
        if serial <= self.last_client_serial {
            return Err(ProxyError::NonMonotonicSerial {
                serial,
                last: self.last_client_serial,
            });
        }
        self.last_client_serial = serial;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Unique ids
    // -------------------------------------------------------------------------

    pub fn unique_id(&self) -> Option<&str> {
        self.unique_id.as_deref()
    }

    pub fn set_unique_id(&mut self, id: &str) {
        self.unique_id = Some(id.to_owned());
    }

    /// Raise the sticky policy of `id` to at least `policy`.
    pub fn update_unique_id_policy(&mut self, id: &str, policy: Policy) {
        let current = self.unique_id_policy.entry(id.to_owned()).or_default();
        if policy > *current {
            log::trace!("[POLICY] {} raised {} -> {}", id, current, policy);
            *current = policy;
        }
    }

    pub fn unique_id_policy(&self, id: &str) -> Policy {
        self.unique_id_policy.get(id).copied().unwrap_or_default()
    }

    /// Remember that `unique_id` owned `name`. History is never pruned.
    pub fn add_owned_name(&mut self, unique_id: &str, name: &str) {
        let names = self.owned_names.entry(unique_id.to_owned()).or_default();
        if !names.iter().any(|n| n == name) {
            log::trace!("[POLICY] {} owns {}", unique_id, name);
            names.push(name.to_owned());
        }
    }

    pub fn owned_names(&self, unique_id: &str) -> &[String] {
        self.owned_names.get(unique_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Effective policy for a destination or sender and the filters behind it.
    ///
    /// `None` is the bus itself. A unique id gets its sticky policy (as a
    /// blanket filter) plus the policies of every name it has ever owned.
    pub fn max_policy_and_matched<'a>(
        &'a self,
        table: &'a PolicyTable,
        name: Option<&str>,
    ) -> (Policy, Vec<&'a Filter>) {
        match name {
            None | Some(BUS_NAME) => {
                let (policy, filters) = table.max_policy_and_matched(BUS_NAME);
                (policy.max(Policy::Talk), filters)
            }
            Some(id) if id.starts_with(':') => {
                let mut policy = self.unique_id_policy(id);
                let mut filters = Vec::new();
                if policy > Policy::None {
                    filters.push(match_all(policy));
                }
                for owned in self.owned_names(id) {
                    let (owned_policy, owned_filters) = table.max_policy_and_matched(owned);
                    policy = policy.max(owned_policy);
                    filters.extend(owned_filters);
                }
                (policy, filters)
            }
            Some(name) => table.max_policy_and_matched(name),
        }
    }

    pub fn max_policy(&self, table: &PolicyTable, name: Option<&str>) -> Policy {
        self.max_policy_and_matched(table, name).0
    }

    // -------------------------------------------------------------------------
    // Synthesized traffic
    // -------------------------------------------------------------------------

    /// Park the reply to send once the roundtrip `Ping` with `serial` returns.
    pub fn push_rewrite(&mut self, serial: u32, reply: MessageBuilder) {
        self.rewrite_replies.insert(serial, reply);
    }

    pub fn take_rewrite(&mut self, serial: u32) -> Option<MessageBuilder> {
        self.rewrite_replies.remove(&serial)
    }

    pub fn push_name_owner_request(&mut self, serial: u32, name: &str) {
        self.name_owner_requests.insert(serial, name.to_owned());
    }

    pub fn take_name_owner_request(&mut self, serial: u32) -> Option<String> {
        self.name_owner_requests.remove(&serial)
    }
}
