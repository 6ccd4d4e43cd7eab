//! Message routing between the client and the bus.
//!
//! Every framed message passes through here. Client messages are classified
//! by [`classify`] into a [`Decision`], which [`Router`] then carries out:
//! forward it, drop it, or answer it with a synthesized reply. Bus messages
//! are matched against the replies the client is owed, filtered by what the
//! client may see, and mined for name ownership.
//!
//! Synthesized replies never skip ahead of real traffic. Instead of answering
//! directly, the router sends the bus a `Peer.Ping` under the rejected call's
//! serial and substitutes the prepared reply when the ping's answer arrives.

use std::os::unix::io::OwnedFd;
use std::rc::Rc;

use crate::buffer::Buffer;
use crate::error::ProxyError;
use crate::policy::{any_filter_matches, FilterTypes, Policy, PolicyTable};
use crate::state::{ConnectionState, ExpectedReply};
use crate::wire::{
    Arg, Endian, Header, MessageBuilder, MessageFlags, MessageType, BUS_INTERFACE, BUS_NAME,
    PEER_INTERFACE,
};

// =============================================================================
// Error Names
// =============================================================================

const ACCESS_DENIED: &str = "org.freedesktop.DBus.Error.AccessDenied";
const NAME_HAS_NO_OWNER: &str = "org.freedesktop.DBus.Error.NameHasNoOwner";
const SERVICE_UNKNOWN: &str = "org.freedesktop.DBus.Error.ServiceUnknown";

/// Match rules carrying this key would let the client snoop on other peers.
const EAVESDROP_KEY: &str = "eavesdrop=";

// =============================================================================
// Classification
// =============================================================================

/// Reply filtering for bus methods that reveal which names exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyFilter {
    /// `NameHasOwner`: answered `false` unless arg0 is visible
    NameHasOwner,
    /// `GetNameOwner`: answered `NameHasNoOwner` unless arg0 is visible
    GetNameOwner,
    /// `ListNames`/`ListActivatableNames`: invisible names are pruned
    NameList,
}

/// What to do with one message from the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Pass,
    /// The client's first `Hello`; triggers the name bootstrap
    Hello,
    Deny,
    /// Answer as if the destination did not exist
    Hide,
    FilterReply(ReplyFilter),
    /// Pass only if arg0 names something the client holds this policy for
    Validate(Policy),
    /// `AddMatch`: pass unless the rule asks to eavesdrop
    ValidateMatch,
}

/// Decide what to do with a client message, from its header alone.
///
/// Body-dependent checks are expressed as [`Decision::Validate`],
/// [`Decision::ValidateMatch`] and [`Decision::FilterReply`], resolved when
/// the decision is carried out.
pub fn classify(table: &PolicyTable, state: &ConnectionState, header: &Header) -> Decision {
    // Broadcasts emitted by the client reach only those who subscribed
    if header.kind == MessageType::Signal && header.destination.is_none() {
        return Decision::Pass;
    }

    if !header.is_for_bus() {
        let (policy, filters) = state.max_policy_and_matched(table, header.destination.as_deref());
        if policy < Policy::See {
            return Decision::Hide;
        }
        if policy < Policy::Talk {
            return Decision::Deny;
        }
        let allowed = policy == Policy::Own
            || any_filter_matches(
                &filters,
                FilterTypes::CALL,
                header.path.as_deref(),
                header.interface.as_deref(),
                header.member.as_deref(),
            );
        return if allowed { Decision::Pass } else { Decision::Deny };
    }

    if header.kind != MessageType::MethodCall {
        return Decision::Deny;
    }
    if header.is_introspection_call() {
        return Decision::Pass;
    }
    if header.interface.as_deref() != Some(BUS_INTERFACE) {
        return Decision::Deny;
    }

    match header.member.as_deref().unwrap_or_default() {
        "Hello" if !state.has_said_hello() => Decision::Hello,
        "Hello" | "RemoveMatch" | "GetId" => Decision::Pass,
        "AddMatch" => Decision::ValidateMatch,
        "UpdateActivationEnvironment" | "BecomeMonitor" => Decision::Deny,
        "RequestName" | "ReleaseName" | "ListQueuedOwners" => Decision::Validate(Policy::Own),
        "NameHasOwner" => Decision::FilterReply(ReplyFilter::NameHasOwner),
        "GetNameOwner" => Decision::FilterReply(ReplyFilter::GetNameOwner),
        "ListNames" | "ListActivatableNames" => Decision::FilterReply(ReplyFilter::NameList),
        "StartServiceByName" => Decision::Validate(Policy::Talk),
        member if member.starts_with("GetConnection") || member == "GetAdtAuditSessionData" => {
            Decision::Validate(Policy::See)
        }
        _ => Decision::Deny,
    }
}

/// Error a hidden call is answered with, matching what the bus would say
/// about a name that does not exist.
fn hide_error(header: &Header) -> &'static str {
    let unique = header.destination.as_deref().is_some_and(|d| d.starts_with(':'));
    if unique || header.flags.contains(MessageFlags::NO_AUTO_START) {
        NAME_HAS_NO_OWNER
    } else {
        SERVICE_UNKNOWN
    }
}

// =============================================================================
// Router
// =============================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct RouterOptions {
    /// Enforce policy; otherwise messages are only framed and validated
    pub filter: bool,
    /// Let the client see every unique name
    pub sloppy_names: bool,
    /// Log each routed message at info level
    pub log_messages: bool,
}

/// Output of routing one message.
#[derive(Debug, Default)]
pub struct Routed {
    pub to_bus: Vec<Buffer>,
    pub to_client: Vec<Buffer>,
    /// `Some(false)` pauses reading from the client, `Some(true)` resumes it
    pub client_reading: Option<bool>,
}

pub struct Router {
    id: usize,
    table: Rc<PolicyTable>,
    options: RouterOptions,
    state: ConnectionState,
}

impl Router {
    pub fn new(id: usize, table: Rc<PolicyTable>, options: RouterOptions) -> Self {
        Self {
            id,
            table,
            options,
            state: ConnectionState::new(),
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    fn level(&self) -> log::Level {
        if self.options.log_messages {
            log::Level::Info
        } else {
            log::Level::Trace
        }
    }

    fn log_client(&self, header: &Header, verdict: &str) {
        log::log!(self.level(), "[CONN:{}] C{} -> {}{}", self.id, header.serial, header, verdict);
    }

    fn log_bus(&self, header: &Header, verdict: &str) {
        log::log!(self.level(), "[CONN:{}] B{} <- {}{}", self.id, header.serial, header, verdict);
    }

    /// Whether the client may learn that `name` exists.
    fn is_visible(&self, name: &str) -> bool {
        (self.options.sloppy_names && name.starts_with(':'))
            || self.state.max_policy(&self.table, Some(name)) >= Policy::See
    }

    // -------------------------------------------------------------------------
    // Client to bus
    // -------------------------------------------------------------------------

    /// Route one complete message read from the client.
    ///
    /// `claim_fds` hands over the file descriptors the message declares; they
    /// are claimed even when the message is dropped.
    pub fn on_client_message<F>(&mut self, mut buffer: Buffer, claim_fds: F) -> Result<Routed, ProxyError>
    where
        F: FnOnce(u32) -> Result<Vec<OwnedFd>, ProxyError>,
    {
        let mut header = Header::parse(buffer.data())?;
        buffer.attach_fds(claim_fds(header.unix_fds)?);
        let mut routed = Routed::default();

        if !self.options.filter {
            self.log_client(&header, "");
            routed.to_bus.push(buffer);
            return Ok(routed);
        }

        let offset = self.state.serial_offset();
        header
            .apply_serial_offset(buffer.data_mut(), offset)
            .ok_or(ProxyError::SerialOverflow(header.serial))?;
        self.state.check_client_serial(header.serial)?;

        if matches!(header.kind, MessageType::MethodReturn | MessageType::Error) {
            let reply_serial = header.reply_serial.unwrap_or_default();
            let caller = header.destination.as_deref().unwrap_or_default();
            if !self.state.bus_calls.take(caller, reply_serial) {
                self.log_client(&header, " *UNEXPECTED*");
                return Ok(routed);
            }
            self.log_client(&header, "");
            routed.to_bus.push(buffer);
            return Ok(routed);
        }

        let decision = classify(&self.table, &self.state, &header);
        self.execute(decision, &header, buffer, &mut routed)?;
        Ok(routed)
    }

    fn execute(
        &mut self,
        decision: Decision,
        header: &Header,
        buffer: Buffer,
        routed: &mut Routed,
    ) -> Result<(), ProxyError> {
        match decision {
            Decision::Pass => self.pass(header, buffer, ExpectedReply::Normal, routed),
            Decision::Hello => {
                self.state.set_hello_serial(header.serial);
                self.pass(header, buffer, ExpectedReply::Hello, routed)?;
                self.queue_initial_name_ops(routed)
            }
            Decision::Deny => self.deny(header, routed),
            Decision::Hide => self.hide(header, routed),
            Decision::FilterReply(ReplyFilter::NameList) => {
                self.pass(header, buffer, ExpectedReply::ListNames, routed)
            }
            Decision::FilterReply(filter) => {
                let visible = header
                    .arg0_str(buffer.data())
                    .is_some_and(|name| self.is_visible(name));
                if visible {
                    return self.pass(header, buffer, ExpectedReply::Normal, routed);
                }
                if !header.expects_reply() {
                    self.log_client(header, " *HIDDEN*");
                    return Ok(());
                }
                let reply = match filter {
                    ReplyFilter::NameHasOwner => {
                        MessageBuilder::method_return(self.client_serial(header)).arg(Arg::Bool(false))
                    }
                    _ => self.error_reply(header, NAME_HAS_NO_OWNER),
                };
                self.log_client(header, " *HIDDEN* (ping)");
                self.roundtrip(header, reply, routed)
            }
            Decision::Validate(required) => {
                let name_policy = header
                    .arg0_str(buffer.data())
                    .map(|name| self.state.max_policy(&self.table, Some(name)))
                    .unwrap_or_default();
                if name_policy >= required {
                    self.pass(header, buffer, ExpectedReply::Normal, routed)
                } else if required == Policy::Own || name_policy >= Policy::See {
                    self.deny(header, routed)
                } else {
                    self.hide(header, routed)
                }
            }
            Decision::ValidateMatch => {
                let allowed = header
                    .arg0_str(buffer.data())
                    .is_some_and(|rule| !rule.contains(EAVESDROP_KEY));
                if allowed {
                    self.pass(header, buffer, ExpectedReply::Normal, routed)
                } else {
                    self.deny(header, routed)
                }
            }
        }
    }

    fn pass(
        &mut self,
        header: &Header,
        buffer: Buffer,
        expected: ExpectedReply,
        routed: &mut Routed,
    ) -> Result<(), ProxyError> {
        if header.expects_reply() {
            self.state.client_calls.insert(header.serial, expected)?;
        }
        self.log_client(header, "");
        routed.to_bus.push(buffer);
        Ok(())
    }

    fn deny(&mut self, header: &Header, routed: &mut Routed) -> Result<(), ProxyError> {
        if !header.expects_reply() {
            self.log_client(header, " *DENIED*");
            return Ok(());
        }
        self.log_client(header, " *DENIED* (ping)");
        let reply = self.error_reply(header, ACCESS_DENIED);
        self.roundtrip(header, reply, routed)
    }

    fn hide(&mut self, header: &Header, routed: &mut Routed) -> Result<(), ProxyError> {
        if !header.expects_reply() {
            self.log_client(header, " *HIDDEN*");
            return Ok(());
        }
        self.log_client(header, " *HIDDEN* (ping)");
        let reply = self.error_reply(header, hide_error(header));
        self.roundtrip(header, reply, routed)
    }

    /// Serial of `header` as the client sent it.
    fn client_serial(&self, header: &Header) -> u32 {
        header.serial - self.state.serial_offset()
    }

    fn error_reply(&self, header: &Header, name: &str) -> MessageBuilder {
        MessageBuilder::error(self.client_serial(header), name).arg_str(name)
    }

    /// Send a `Ping` in place of the call and park `reply` for its answer.
    fn roundtrip(&mut self, header: &Header, reply: MessageBuilder, routed: &mut Routed) -> Result<(), ProxyError> {
        let ping = MessageBuilder::method_call(BUS_NAME, "/", PEER_INTERFACE, "Ping")
            .serial(header.serial)
            .flags(header.flags)
            .build(header.endian);
        let reply = reply
            .flags(MessageFlags::NO_REPLY_EXPECTED)
            .sender(Some(BUS_NAME))
            .destination(self.state.unique_id());
        self.state.client_calls.insert(header.serial, ExpectedReply::Rewrite)?;
        self.state.push_rewrite(header.serial, reply);
        routed.to_bus.push(Buffer::from_vec(ping));
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Bootstrap
    // -------------------------------------------------------------------------

    /// Send a message of our own to the bus under the next fake serial.
    fn queue_fake(
        &mut self,
        message: MessageBuilder,
        expected: ExpectedReply,
        routed: &mut Routed,
    ) -> Result<u32, ProxyError> {
        let serial = self.state.next_fake_serial();
        self.state.client_calls.insert(serial, expected)?;
        log::debug!("[CONN:{}] Fake message {}", self.id, serial);
        routed
            .to_bus
            .push(Buffer::from_vec(message.serial(serial).build(Endian::native())));
        Ok(serial)
    }

    fn queue_get_name_owner(&mut self, name: &str, routed: &mut Routed) -> Result<(), ProxyError> {
        let message = MessageBuilder::bus_call("GetNameOwner").arg_str(name);
        let serial = self.queue_fake(message, ExpectedReply::FakeGetNameOwner, routed)?;
        self.state.push_name_owner_request(serial, name);
        Ok(())
    }

    /// Subscribe to ownership changes of every policy name and look up who
    /// owns them now. Subtree names are resolved through one `ListNames`,
    /// during which the client is not read from.
    fn queue_initial_name_ops(&mut self, routed: &mut Routed) -> Result<(), ProxyError> {
        let table = Rc::clone(&self.table);
        let mut has_wildcards = false;

        for (name, subtree) in table.names() {
            if name == BUS_NAME {
                continue;
            }
            // Subscribe before asking for the owner so no change is missed
            let key = if subtree { "arg0namespace" } else { "arg0" };
            let rule = format!(
                "type='signal',sender='{}',interface='{}',member='NameOwnerChanged',{}='{}'",
                BUS_NAME, BUS_INTERFACE, key, name
            );
            let add_match = MessageBuilder::bus_call("AddMatch").arg_str(&rule);
            self.queue_fake(add_match, ExpectedReply::Filter, routed)?;

            if subtree {
                has_wildcards = true;
            } else {
                self.queue_get_name_owner(name, routed)?;
            }
        }

        if has_wildcards {
            let list = MessageBuilder::bus_call("ListNames");
            self.queue_fake(list, ExpectedReply::FakeListNames, routed)?;
            routed.client_reading = Some(false);
        }
        Ok(())
    }

    /// Look up the owners of existing names covered by subtree policies.
    fn queue_wildcard_name_ops(&mut self, names: &[&str], routed: &mut Routed) -> Result<(), ProxyError> {
        for name in names {
            if !name.starts_with(':') && self.table.wildcard_policy(name) > Policy::None {
                self.queue_get_name_owner(name, routed)?;
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Bus to client
    // -------------------------------------------------------------------------

    /// Route one complete message read from the bus.
    pub fn on_bus_message<F>(&mut self, mut buffer: Buffer, claim_fds: F) -> Result<Routed, ProxyError>
    where
        F: FnOnce(u32) -> Result<Vec<OwnedFd>, ProxyError>,
    {
        let header = Header::parse(buffer.data())?;
        buffer.attach_fds(claim_fds(header.unix_fds)?);
        let mut routed = Routed::default();

        if !self.options.filter {
            self.log_bus(&header, "");
            routed.to_client.push(buffer);
            return Ok(routed);
        }

        let client_reply_serial = header.unshift_reply_serial(
            buffer.data_mut(),
            self.state.serial_offset(),
            self.state.hello_serial(),
        );

        let mut buffer = match header.reply_serial {
            Some(reply_serial) => {
                let Some(expected) = self.state.client_calls.take(reply_serial) else {
                    self.log_bus(&header, " *UNEXPECTED*");
                    return Ok(routed);
                };
                match self.handle_reply(&header, buffer, expected, client_reply_serial, &mut routed)? {
                    Some(buffer) => buffer,
                    None => return Ok(routed),
                }
            }
            None => {
                if header.is_name_owner_changed() && self.name_owner_changed_is_filtered(&header, buffer.data()) {
                    self.log_bus(&header, " *FILTERED*");
                    return Ok(routed);
                }
                buffer
            }
        };

        if header.kind == MessageType::Signal && header.destination.is_none() {
            let (policy, filters) = self
                .state
                .max_policy_and_matched(&self.table, header.sender.as_deref());
            let allowed = policy == Policy::Own
                || (policy == Policy::Talk
                    && any_filter_matches(
                        &filters,
                        FilterTypes::BROADCAST,
                        header.path.as_deref(),
                        header.interface.as_deref(),
                        header.member.as_deref(),
                    ));
            if !allowed {
                self.log_bus(&header, " *FILTERED*");
                return Ok(routed);
            }
        }

        // A peer the client has heard from may be tracked by it from now on
        if let Some(sender) = header.sender.as_deref().filter(|s| s.starts_with(':')) {
            self.state.update_unique_id_policy(sender, Policy::See);
        }

        if header.expects_reply() {
            let caller = header.sender.as_deref().unwrap_or_default();
            self.state.bus_calls.insert(caller, header.serial);
        }

        self.log_bus(&header, "");
        buffer.rewind();
        routed.to_client.push(buffer);
        Ok(routed)
    }

    /// Handle a reply the client was owed. Returns the buffer to forward, if
    /// anything is to be forwarded.
    fn handle_reply(
        &mut self,
        header: &Header,
        buffer: Buffer,
        expected: ExpectedReply,
        client_reply_serial: Option<u32>,
        routed: &mut Routed,
    ) -> Result<Option<Buffer>, ProxyError> {
        let is_return = header.kind == MessageType::MethodReturn;
        match expected {
            ExpectedReply::Normal => Ok(Some(buffer)),
            ExpectedReply::Hello => {
                if is_return {
                    if let Some(id) = header.arg0_str(buffer.data()) {
                        log::debug!("[CONN:{}] Client is {}", self.id, id);
                        self.state.set_unique_id(id);
                        self.state.update_unique_id_policy(id, Policy::Talk);
                    }
                }
                Ok(Some(buffer))
            }
            ExpectedReply::Rewrite => {
                let reply_serial = header.reply_serial.unwrap_or_default();
                let Some(mut reply) = self.state.take_rewrite(reply_serial) else {
                    self.log_bus(header, " *UNEXPECTED*");
                    return Ok(None);
                };
                reply.set_serial(header.serial);
                self.log_bus(header, " *REWRITTEN*");
                routed.to_client.push(Buffer::from_vec(reply.build(header.endian)));
                Ok(None)
            }
            ExpectedReply::ListNames => {
                if !is_return {
                    return Ok(Some(buffer));
                }
                let Some(names) = header.arg0_str_array(buffer.data()) else {
                    log::warn!("[CONN:{}] Name list reply without a name list", self.id);
                    return Ok(Some(buffer));
                };
                let visible: Vec<String> = names
                    .into_iter()
                    .filter(|name| self.is_visible(name))
                    .map(str::to_owned)
                    .collect();
                let filtered = MessageBuilder::method_return(client_reply_serial.unwrap_or_default())
                    .serial(header.serial)
                    .destination(header.destination.as_deref())
                    .sender(header.sender.as_deref())
                    .arg(Arg::StrArray(visible))
                    .build(header.endian);
                Ok(Some(Buffer::from_vec(filtered)))
            }
            ExpectedReply::Filter => {
                self.log_bus(header, " *SKIPPED*");
                Ok(None)
            }
            ExpectedReply::FakeGetNameOwner => {
                let requested = self.state.take_name_owner_request(header.reply_serial.unwrap_or_default());
                if let (true, Some(name)) = (is_return, requested) {
                    if let Some(owner) = header.arg0_str(buffer.data()) {
                        self.state.add_owned_name(owner, &name);
                    }
                }
                self.log_bus(header, " *SKIPPED*");
                Ok(None)
            }
            ExpectedReply::FakeListNames => {
                if is_return {
                    let names = header.arg0_str_array(buffer.data()).unwrap_or_default();
                    self.queue_wildcard_name_ops(&names, routed)?;
                }
                self.log_bus(header, " *SKIPPED*");
                routed.client_reading = Some(true);
                Ok(None)
            }
        }
    }

    /// Record the new owner and report whether the signal must be withheld.
    fn name_owner_changed_is_filtered(&mut self, header: &Header, data: &[u8]) -> bool {
        let Some((name, _old_owner, new_owner)) = header.three_strings(data) else {
            return true;
        };
        if !name.starts_with(':') && !new_owner.is_empty() {
            self.state.add_owned_name(new_owner, name);
        }
        !self.is_visible(name)
    }
}

// =============================================================================
// Tests
// =============================================================================
