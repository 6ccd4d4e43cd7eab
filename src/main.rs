//! # dbus-filter-proxy
//!
//! A filtering D-Bus proxy for sandboxed clients.
//!
//! ## Overview
//!
//! The proxy listens on a UNIX socket and opens one connection to the real
//! bus per accepted client. Traffic is relayed after checking every message
//! against a per-name policy (`see`, `talk`, `own`) and optional call and
//! broadcast rules. Names the client may not see look as if they did not
//! exist.
//!
//! ## Usage
//!
//! ```bash
//! dbus-filter-proxy "$DBUS_SESSION_BUS_ADDRESS" /run/user/1000/app-bus \
//!     --filter --own=org.example.App --talk=org.freedesktop.Notifications \
//!     --call=org.freedesktop.portal.*=*@/org/freedesktop/portal/desktop
//! ```
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Log level (`error`, `warn`, `info`, `debug`, `trace`)

mod address;
mod auth;
mod buffer;
mod connection;
mod error;
mod policy;
mod pump;
mod router;
mod state;
mod wire;

use address::BusAddress;
use connection::ProxyConnection;
use error::{ProxyError, RuleError};
use policy::{FilterTypes, Policy, PolicyTable};
use pump::SideKind;
use router::RouterOptions;

use std::collections::HashMap;
use std::os::unix::net::UnixListener;
use std::path::PathBuf;
use std::rc::Rc;

use calloop::generic::Generic;
use calloop::{EventLoop, Interest, LoopHandle, Mode, PostAction, Readiness, RegistrationToken};
use clap::Parser;

// =============================================================================
// Command Line
// =============================================================================

/// Names take a trailing `.*` to cover every name below them. Rules have the
/// form `[*|INTERFACE.*|INTERFACE.MEMBER][@/PATH[/*]]`.
#[derive(Parser, Debug)]
#[command(name = "dbus-filter-proxy", version, about = "Filtering proxy for D-Bus connections")]
struct Cli {
    /// Address of the real bus, e.g. unix:path=/run/user/1000/bus
    address: BusAddress,

    /// Socket to create for clients
    path: PathBuf,

    /// Let the client see NAME
    #[arg(long, value_name = "NAME")]
    see: Vec<String>,

    /// Let the client talk to NAME
    #[arg(long, value_name = "NAME")]
    talk: Vec<String>,

    /// Let the client own NAME
    #[arg(long, value_name = "NAME")]
    own: Vec<String>,

    /// Allow calls to NAME matching RULE
    #[arg(long, value_name = "NAME=RULE")]
    call: Vec<String>,

    /// Allow broadcasts from NAME matching RULE
    #[arg(long, value_name = "NAME=RULE")]
    broadcast: Vec<String>,

    /// Enable filtering; with a value, also allow calls and broadcasts
    /// matching RULE
    #[arg(
        long,
        value_name = "NAME=RULE",
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = ""
    )]
    filter: Vec<String>,

    /// Log every routed message
    #[arg(long)]
    log: bool,

    /// Let the client see every unique name
    #[arg(long)]
    sloppy_names: bool,
}

impl Cli {
    fn options(&self) -> RouterOptions {
        RouterOptions {
            filter: !self.filter.is_empty(),
            sloppy_names: self.sloppy_names,
            log_messages: self.log,
        }
    }

    /// Build the table shared by every connection.
    fn policy_table(&self) -> Result<PolicyTable, RuleError> {
        let mut table = PolicyTable::new();

        for (names, level) in [
            (&self.see, Policy::See),
            (&self.talk, Policy::Talk),
            (&self.own, Policy::Own),
        ] {
            for arg in names {
                let (name, subtree) = policy::parse_name(arg)?;
                table.add_policy(&name, subtree, level);
            }
        }

        for arg in &self.call {
            let (name, subtree, rule) = policy::parse_name_rule(arg)?;
            table.add_call_rule(&name, subtree, rule)?;
        }
        for arg in &self.broadcast {
            let (name, subtree, rule) = policy::parse_name_rule(arg)?;
            table.add_broadcast_rule(&name, subtree, rule)?;
        }
        for arg in self.filter.iter().filter(|arg| !arg.is_empty()) {
            let (name, subtree, rule) = policy::parse_name_rule(arg)?;
            table.add_rule(&name, subtree, FilterTypes::all(), rule)?;
        }

        Ok(table)
    }
}

// =============================================================================
// Application State
// =============================================================================

struct Registered {
    connection: ProxyConnection,
    /// Sources for the client and bus sockets
    tokens: Vec<RegistrationToken>,
}

/// Proxy state managed by the event loop.
struct ProxyServer {
    address: BusAddress,
    table: Rc<PolicyTable>,
    options: RouterOptions,
    connections: HashMap<usize, Registered>,
    next_id: usize,
}

impl ProxyServer {
    fn new(address: BusAddress, table: PolicyTable, options: RouterOptions) -> Self {
        Self {
            address,
            table: Rc::new(table),
            options,
            connections: HashMap::new(),
            next_id: 0,
        }
    }

    /// Connect a new client to the bus and watch both sockets.
    fn open(
        &mut self,
        client: std::os::unix::net::UnixStream,
        handle: &LoopHandle<'static, ProxyServer>,
    ) -> Result<(), ProxyError> {
        self.next_id += 1;
        let id = self.next_id;
        let connection = ProxyConnection::new(id, client, &self.address, Rc::clone(&self.table), self.options)?;

        let mut tokens = Vec::with_capacity(2);
        for kind in [SideKind::Client, SideKind::Bus] {
            let stream = connection.try_clone_stream(kind)?;
            let inserted = handle.insert_source(
                Generic::new(stream, Interest::BOTH, Mode::Edge),
                move |readiness, _, server: &mut ProxyServer| {
                    server.dispatch(id, kind, readiness);
                    Ok(PostAction::Continue)
                },
            );
            match inserted {
                Ok(token) => tokens.push(token),
                Err(e) => {
                    for token in tokens {
                        handle.remove(token);
                    }
                    return Err(ProxyError::EventLoop(e.error));
                }
            }
        }

        self.connections.insert(id, Registered { connection, tokens });
        log::debug!("[CONN:{}] Registered ({} active)", id, self.connections.len());
        Ok(())
    }

    fn dispatch(&mut self, id: usize, kind: SideKind, readiness: Readiness) {
        if let Some(entry) = self.connections.get_mut(&id) {
            entry
                .connection
                .handle_event(kind, readiness.readable || readiness.error, readiness.writable);
        }
    }

    /// Drop finished connections and their event sources.
    fn reap(&mut self, handle: &LoopHandle<'static, ProxyServer>) {
        let finished: Vec<usize> = self
            .connections
            .iter()
            .filter(|(_, entry)| entry.connection.is_finished())
            .map(|(id, _)| *id)
            .collect();

        for id in finished {
            if let Some(entry) = self.connections.remove(&id) {
                for token in entry.tokens {
                    handle.remove(token);
                }
                log::info!("[CONN:{}] Client disconnected", id);
            }
        }
    }
}

// =============================================================================
// Main Entry Point
// =============================================================================

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let table = cli.policy_table()?;
    let options = cli.options();
    log::info!(
        "Bus: {} (filter={}, sloppy_names={})",
        cli.address.entries().iter().map(ToString::to_string).collect::<Vec<_>>().join(";"),
        options.filter,
        options.sloppy_names
    );

    let mut event_loop: EventLoop<'static, ProxyServer> = EventLoop::try_new()?;
    let loop_handle = event_loop.handle();

    // Remove existing socket (if any)
    if cli.path.exists() {
        log::debug!("Removing existing socket: {}", cli.path.display());
        std::fs::remove_file(&cli.path)?;
    }
    let listener = UnixListener::bind(&cli.path)?;
    listener.set_nonblocking(true)?;
    log::info!("Listening: {}", cli.path.display());

    let accept_handle = loop_handle.clone();
    loop_handle.insert_source(
        Generic::new(listener, Interest::READ, Mode::Level),
        move |_, listener, server| handle_new_connection(listener, server, &accept_handle),
    )?;

    let mut server = ProxyServer::new(cli.address, table, options);

    log::info!("Starting event loop (Ctrl+C to exit)");
    loop {
        event_loop.dispatch(None, &mut server)?;
        server.reap(&loop_handle);
    }
}

// =============================================================================
// Event Handlers
// =============================================================================

/// Accept a pending client.
fn handle_new_connection(
    listener: &UnixListener,
    server: &mut ProxyServer,
    handle: &LoopHandle<'static, ProxyServer>,
) -> Result<PostAction, std::io::Error> {
    match listener.accept() {
        Ok((stream, _addr)) => {
            log::info!("New client connection");
            if let Err(e) = server.open(stream, handle) {
                log::error!("Failed to set up connection: {}", e);
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
            // No pending connections
        }
        Err(e) => {
            log::warn!("Accept failed: {}", e);
        }
    }

    Ok(PostAction::Continue)
}

// =============================================================================
// Tests
// =============================================================================
