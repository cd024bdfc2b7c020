//! The server engine: accept loop, per-peer connection state machine,
//! broadcast, method dispatch.

use std::collections::HashMap;
use std::time::Instant;

use mio::{Interest, Token};

use crate::buffer::BufPool;
use crate::bus_event::BusEvent;
use crate::call::InFlightCall;
use crate::codec::packet::{ConnStatus, EventRecord, ObjectAdd, ObjectRemove};
use crate::codec::{encode_packet, AckStatus, Packet};
use crate::descriptor::BusDescriptor;
use crate::error::ObusError;
use crate::event::Event;
use crate::handle::ObjectHandle;
use crate::io_channel::IoChannel;
use crate::object::Object;
use crate::reactor::Reactor;
use crate::record::Record;
use crate::registry::{CurrentCall, ObjectTable};
use crate::socket::{Address, ServerSocket, Stream};

const LISTENER_TOKEN: Token = Token(0);
const FIRST_PEER_TOKEN: usize = 1;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ServerState {
    Idle,
    Started,
}

/// A peer connection's own state machine, independent of the server's.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum PeerState {
    Idle,
    Connecting,
    Connected,
    Refused,
    Disconnected,
}

/// What the server tells the user's connection callback has happened to
/// a peer.
pub enum PeerTransition {
    Connecting,
    Connected,
    Disconnected,
}

/// A handler invoked when a `Call` packet targets one of this object's
/// methods. Must call [`InFlightCall::finish`] exactly once; the engine
/// auto-acks `Refused` if it doesn't.
pub type MethodHandler<U> = Box<dyn FnMut(&mut Object<U>, &mut InFlightCall)>;

struct MethodTable<U> {
    handlers: HashMap<u16, MethodHandler<U>>,
}

impl<U> MethodTable<U> {
    fn new() -> MethodTable<U> {
        MethodTable { handlers: HashMap::new() }
    }
}

impl<U> Default for MethodTable<U> {
    fn default() -> Self {
        MethodTable::new()
    }
}

struct Peer {
    state: PeerState,
    channel: IoChannel<Stream>,
    current_call: CurrentCall,
    peer_pid: Option<u32>,
}

/// The server engine. Generic over `U`, the per-object user-data slot.
pub struct Server<U> {
    bus: &'static BusDescriptor,
    state: ServerState,
    reactor: Reactor,
    listeners: Vec<ServerSocket>,
    peers: HashMap<Token, Peer>,
    next_token: usize,
    pool: BufPool,

    objects: ObjectTable<U>,
    method_handlers: HashMap<ObjectHandle, MethodTable<U>>,

    on_peer_transition: Option<Box<dyn FnMut(Token, PeerTransition)>>,
    refuse_requested: std::collections::HashSet<Token>,

    logs: obus_log::logging::BusLoggers,
}

impl<U: Default> Server<U> {
    pub fn new(bus: &'static BusDescriptor) -> Result<Server<U>, ObusError> {
        let logs = obus_log::logging::for_bus_categories(bus.name);
        Ok(Server {
            bus,
            state: ServerState::Idle,
            reactor: Reactor::new(1024).map_err(ObusError::from)?,
            listeners: Vec::new(),
            peers: HashMap::new(),
            next_token: FIRST_PEER_TOKEN,
            pool: BufPool::new(crate::buffer::DEFAULT_BUF_SIZE),
            objects: ObjectTable::new(),
            method_handlers: HashMap::new(),
            on_peer_transition: None,
            refuse_requested: std::collections::HashSet::new(),
            logs,
        })
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn on_peer_transition(&mut self, callback: impl FnMut(Token, PeerTransition) + 'static) {
        self.on_peer_transition = Some(Box::new(callback));
    }

    /// `start(addresses[])`: Idle -> Started.
    pub fn start(&mut self, addresses: &[&str]) -> Result<(), ObusError> {
        if self.state != ServerState::Idle {
            return Err(ObusError::invalid_state("server already started"));
        }
        for (i, spec) in addresses.iter().enumerate() {
            let address = Address::parse(spec)?;
            let mut listener = ServerSocket::bind(&address).map_err(ObusError::from)?;
            obus_log::slog::info!(self.logs.socket, "listening"; "address" => format!("{:?}", address));
            self.reactor
                .register(&mut listener, Token(LISTENER_TOKEN.0 + i), Interest::READABLE)
                .map_err(ObusError::from)?;
            self.listeners.push(listener);
        }
        self.next_token = self.next_token.max(self.listeners.len());
        self.state = ServerState::Started;
        Ok(())
    }

    /// Creates a new, unregistered object of `descriptor` with an empty
    /// method handler table.
    pub fn create_object(&mut self, descriptor: &'static crate::descriptor::ObjectDescriptor) -> ObjectHandle {
        let handle = self.objects.create(descriptor);
        self.method_handlers.insert(handle, MethodTable::new());
        handle
    }

    pub fn set_method_handler(
        &mut self,
        handle: ObjectHandle,
        method_uid: u16,
        handler: impl FnMut(&mut Object<U>, &mut InFlightCall) + 'static,
    ) {
        self.method_handlers.entry(handle).or_insert_with(MethodTable::new).handlers.insert(method_uid, Box::new(handler));
    }

    /// Registration writes an Add packet to every Connected peer.
    pub fn register_object(&mut self, handle: ObjectHandle) -> Result<(), ObusError> {
        let object_uid;
        let info;
        {
            let object = self.objects.get_mut(handle).ok_or_else(|| ObusError::not_found("no such object"))?;
            object.register();
            object_uid = object.uid();
            info = object.info().clone();
        }
        let packet = Packet::Add(ObjectAdd { object_uid, handle: handle.0, info });
        self.broadcast(&packet);
        Ok(())
    }

    /// Unregistration writes a Remove packet; legal only when registered.
    pub fn unregister_object(&mut self, handle: ObjectHandle) -> Result<(), ObusError> {
        let object_uid = {
            let object = self.objects.get_mut(handle).ok_or_else(|| ObusError::not_found("no such object"))?;
            if !object.is_registered() {
                return Err(ObusError::invalid_state("object is not registered"));
            }
            object.unregister();
            object.uid()
        };
        let packet = Packet::Remove(ObjectRemove { object_uid, handle: handle.0 });
        self.broadcast(&packet);
        Ok(())
    }

    /// Send event: refuse if not registered, sanitize, broadcast, commit
    /// locally.
    pub fn send_event(&mut self, handle: ObjectHandle, event_uid: u16, fields: Record) -> Result<(), ObusError> {
        let object_uid;
        {
            let object = self.objects.get(handle).ok_or_else(|| ObusError::not_found("no such object"))?;
            if !object.is_registered() {
                return Err(ObusError::invalid_state("object is not registered"));
            }
            object_uid = object.uid();
        }
        let descriptor = self
            .bus
            .object_by_uid(object_uid)
            .and_then(|d| d.event_by_uid(event_uid))
            .ok_or_else(|| ObusError::not_found("no such event"))?;

        let mut event = Event::new(descriptor, fields);
        let stripped = event.strip_illegal();
        if !stripped.is_empty() {
            obus_log::slog::error!(self.logs.bus, "stripped fields outside event's update set";
                "event" => descriptor.name, "stripped_fields" => ?stripped);
        }

        let packet = Packet::Event(EventRecord {
            object_uid,
            handle: handle.0,
            event_uid,
            fields: event.fields().clone(),
        });
        self.broadcast(&packet);

        if let Some(object) = self.objects.get_mut(handle) {
            object.commit(event.fields());
        }
        Ok(())
    }

    /// Send bus event: validate add/remove preconditions, register adds
    /// first, broadcast, then commit events and unregister removes, in
    /// that fixed order.
    pub fn send_bus_event(&mut self, bus_event: BusEvent) -> Result<(), ObusError> {
        for add in bus_event.additions() {
            if self.objects.get(add.handle).map(|o| o.is_registered()).unwrap_or(true) {
                return Err(ObusError::invalid_state("add-list object is already registered or unknown"));
            }
        }
        for removal in bus_event.removals() {
            if !self.objects.get(removal.handle).map(|o| o.is_registered()).unwrap_or(false) {
                return Err(ObusError::invalid_state("remove-list object is not registered"));
            }
        }

        let mut registered_now = Vec::new();
        for add in bus_event.additions() {
            if let Some(object) = self.objects.get_mut(add.handle) {
                object.register();
                registered_now.push(add.handle);
            }
        }

        let packet = match self.encode_bus_event_packet(&bus_event) {
            Ok(packet) => packet,
            Err(err) => {
                for handle in registered_now {
                    if let Some(object) = self.objects.get_mut(handle) {
                        object.unregister();
                    }
                }
                return Err(err);
            }
        };
        self.broadcast(&packet);

        for entry in bus_event.events() {
            if let Some(object) = self.objects.get_mut(entry.handle) {
                object.commit(entry.event.fields());
            }
        }
        for removal in bus_event.removals() {
            if let Some(object) = self.objects.get_mut(removal.handle) {
                object.unregister();
            }
        }

        Ok(())
    }

    fn encode_bus_event_packet(&self, bus_event: &BusEvent) -> Result<Packet, ObusError> {
        let adds = bus_event
            .additions()
            .iter()
            .map(|a| ObjectAdd { object_uid: a.object_uid, handle: a.handle.0, info: a.info.clone() })
            .collect();
        let removes = bus_event
            .removals()
            .iter()
            .map(|r| ObjectRemove { object_uid: r.object_uid, handle: r.handle.0 })
            .collect();
        let events = bus_event
            .events()
            .iter()
            .map(|e| EventRecord {
                object_uid: e.object_uid,
                handle: e.handle.0,
                event_uid: e.event.uid(),
                fields: e.event.fields().clone(),
            })
            .collect();

        Ok(Packet::BusEvent {
            uid: bus_event.descriptor().map(|d| d.uid).unwrap_or(0),
            adds,
            removes,
            events,
        })
    }

    /// Best-effort broadcast: a write failure to one peer destroys that
    /// peer and continues over the rest.
    fn broadcast(&mut self, packet: &Packet) {
        let mut bytes = Vec::new();
        if encode_packet(&mut bytes, packet).is_err() {
            return;
        }
        let mut dead = Vec::new();
        for (token, peer) in self.peers.iter_mut() {
            if peer.state != PeerState::Connected {
                continue;
            }
            let buf = self.pool.acquire();
            buf.borrow_mut().extend(&bytes);
            peer.channel.queue_write(buf);
            if peer.channel.flush(Instant::now(), &mut self.pool).is_err() {
                dead.push(*token);
            }
        }
        for token in dead {
            self.drop_peer(token);
        }
    }

    fn drop_peer(&mut self, token: Token) {
        if let Some(mut peer) = self.peers.remove(&token) {
            if peer.state == PeerState::Connected {
                obus_log::slog::info!(self.logs.connection, "peer disconnected"; "token" => token.0);
                if let Some(cb) = self.on_peer_transition.as_mut() {
                    cb(token, PeerTransition::Disconnected);
                }
            }
            let _ = self.reactor.deregister(peer.channel.stream_mut());
        }
    }

    /// Runs one reactor turn: accepts new peers, reads and dispatches
    /// packets from existing ones, flushes writes.
    pub fn process(&mut self) -> Result<(), ObusError> {
        self.reactor.turn().map_err(ObusError::from)?;
        self.accept_new_peers();

        let tokens: Vec<Token> = self.peers.keys().copied().collect();
        let now = Instant::now();
        for token in tokens {
            self.service_peer(token, now);
        }
        Ok(())
    }

    fn accept_new_peers(&mut self) {
        for i in 0..self.listeners.len() {
            loop {
                match self.listeners[i].accept() {
                    Ok((mut stream, pid)) => {
                        let token = Token(self.next_token);
                        self.next_token += 1;
                        let _ = self.reactor.register(&mut stream, token, Interest::READABLE | Interest::WRITABLE);
                        let peer = Peer {
                            state: PeerState::Idle,
                            channel: IoChannel::new(stream, token),
                            current_call: CurrentCall::default(),
                            peer_pid: pid,
                        };
                        self.peers.insert(token, peer);
                    }
                    Err(_) => break,
                }
            }
        }
    }

    fn service_peer(&mut self, token: Token, now: Instant) {
        let mut packets = Vec::new();
        let mut dead = false;

        if let Some(peer) = self.peers.get_mut(&token) {
            match peer.channel.receive(now) {
                Ok(_) => packets = peer.channel.drain_packets(self.bus),
                Err(outcome) => {
                    if let crate::error::IoOutcome::Fatal(err) = &outcome {
                        obus_log::slog::debug!(self.logs.io, "read failed, dropping peer";
                            "token" => token.0, "error" => %err);
                        dead = true;
                    }
                }
            }
        }

        for packet in packets {
            self.handle_peer_packet(token, packet);
        }

        if let Some(peer) = self.peers.get_mut(&token) {
            if peer.channel.flush(now, &mut self.pool).is_err() || peer.channel.write_timed_out(now) {
                dead = true;
            }
        }

        if dead {
            self.drop_peer(token);
        }
    }

    fn handle_peer_packet(&mut self, token: Token, packet: Packet) {
        match packet {
            Packet::ConReq { version, bus_name, schema_crc, client_name } => {
                self.on_con_req(token, version, bus_name, schema_crc, client_name)
            }
            Packet::Call { object_uid, handle, method_uid, call_handle, args } => {
                self.on_call(token, object_uid, ObjectHandle(handle), method_uid, call_handle, args)
            }
            _ => {}
        }
    }

    fn on_con_req(&mut self, token: Token, version: u8, bus_name: String, schema_crc: u32, client_name: String) {
        let valid = version == crate::codec::PROTOCOL_VERSION
            && bus_name == self.bus.name
            && schema_crc == self.bus.schema_crc
            && !client_name.is_empty();

        if !valid {
            obus_log::slog::warn!(self.logs.connection, "rejecting mismatched handshake";
                "token" => token.0, "bus_name" => bus_name, "client_name" => client_name);
            self.send_con_resp(token, ConnStatus::Refused);
            if let Some(peer) = self.peers.get_mut(&token) {
                peer.state = PeerState::Refused;
            }
            return;
        }

        if let Some(cb) = self.on_peer_transition.as_mut() {
            cb(token, PeerTransition::Connecting);
        }

        if self.refuse_requested.remove(&token) {
            obus_log::slog::info!(self.logs.connection, "refusing peer by request"; "token" => token.0);
            self.send_con_resp(token, ConnStatus::Refused);
            if let Some(peer) = self.peers.get_mut(&token) {
                peer.state = PeerState::Refused;
            }
            return;
        }

        let objects = self
            .objects
            .iter()
            .filter(|(_, o)| o.is_registered())
            .map(|(h, o)| ObjectAdd { object_uid: o.uid(), handle: h.0, info: o.info().clone() })
            .collect();
        self.send_con_resp(token, ConnStatus::Accepted { objects });
        if let Some(peer) = self.peers.get_mut(&token) {
            peer.state = PeerState::Connected;
        }
        obus_log::slog::info!(self.logs.connection, "peer connected"; "token" => token.0, "client_name" => client_name);
        if let Some(cb) = self.on_peer_transition.as_mut() {
            cb(token, PeerTransition::Connected);
        }
    }

    /// A user connection callback may call this during `Connecting` to
    /// push the peer straight to `Refused`. Queued since
    /// the ConResp hasn't been sent yet at callback time in this
    /// implementation's single-pass dispatch.
    pub fn refuse_connection(&mut self, token: Token) {
        self.refuse_requested.insert(token);
    }

    fn send_con_resp(&mut self, token: Token, status: ConnStatus) {
        let packet = Packet::ConResp(status);
        let mut bytes = Vec::new();
        if encode_packet(&mut bytes, &packet).is_err() {
            return;
        }
        if let Some(peer) = self.peers.get_mut(&token) {
            let buf = self.pool.acquire();
            buf.borrow_mut().extend(&bytes);
            peer.channel.queue_write(buf);
        }
    }

    fn on_call(&mut self, token: Token, object_uid: u16, object_handle: ObjectHandle, method_uid: u16, call_handle: u16, args: Record) {
        let method_exists = self.bus.object_by_uid(object_uid).and_then(|d| d.method_by_uid(method_uid)).is_some();

        if !method_exists {
            self.send_ack(token, call_handle, AckStatus::MethodNotSupported);
            return;
        }

        let call = InFlightCall::new(call_handle, object_handle, object_uid, method_uid, args);
        let started = self.peers.get_mut(&token).map(|p| p.current_call.start(call));
        match started {
            Some(Ok(())) => {}
            Some(Err(_)) => {
                self.send_ack(token, call_handle, AckStatus::Refused);
                return;
            }
            None => return,
        }

        let handled = {
            let handlers = self.method_handlers.get_mut(&object_handle);
            let object = self.objects.get_mut(object_handle);
            let call = self.peers.get_mut(&token).and_then(|p| p.current_call.get_mut());
            match (object, handlers.and_then(|t| t.handlers.get_mut(&method_uid)), call) {
                (Some(object), Some(handler), Some(call)) => {
                    handler(object, call);
                    true
                }
                _ => false,
            }
        };

        if !handled {
            self.finish_call(token, AckStatus::MethodDisabled);
            return;
        }

        let status = self
            .peers
            .get_mut(&token)
            .and_then(|p| p.current_call.get_mut())
            .and_then(|c| c.status());

        match status {
            Some(status) => self.finish_call(token, status),
            None => self.finish_call(token, AckStatus::Refused),
        }
    }

    /// Sends the final ack for a call and clears the current-call
    /// pointer.
    fn finish_call(&mut self, token: Token, status: AckStatus) {
        let call_handle = match self.peers.get_mut(&token).and_then(|p| p.current_call.finish()) {
            Some(call) => call.call_handle(),
            None => return,
        };
        self.send_ack(token, call_handle, status);
    }

    fn send_ack(&mut self, token: Token, call_handle: u16, status: AckStatus) {
        let packet = Packet::Ack { call_handle, status };
        let mut bytes = Vec::new();
        if encode_packet(&mut bytes, &packet).is_ok() {
            if let Some(peer) = self.peers.get_mut(&token) {
                let buf = self.pool.acquire();
                buf.borrow_mut().extend(&bytes);
                peer.channel.queue_write(buf);
            }
        }
    }

    /// Resolves which peer a call handle's in-flight call is running on,
    /// for a handler that needs the connection identity (e.g. to check
    /// [`Server::peer_pid`]) rather than just the call's arguments.
    pub fn get_call_peer(&self, call_handle: u16) -> Option<Token> {
        self.peers
            .iter()
            .find(|(_, peer)| peer.current_call.get().map(|c| c.call_handle()) == Some(call_handle))
            .map(|(token, _)| *token)
    }

    pub fn peer_state(&self, token: Token) -> Option<PeerState> {
        self.peers.get(&token).map(|p| p.state)
    }

    pub fn peer_pid(&self, token: Token) -> Option<u32> {
        self.peers.get(&token).and_then(|p| p.peer_pid)
    }
}
