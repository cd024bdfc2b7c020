//! The client engine: connection state machine, packet dispatch,
//! provider callbacks, and method-call lifecycle.

use std::time::{Duration, Instant};

use mio::{Interest, Token};

use crate::buffer::BufPool;
use crate::bus_event::{self, BusEvent};
use crate::call::CallOutcome;
use crate::codec::packet::{ConnStatus, EventRecord, ObjectAdd, ObjectRemove};
use crate::codec::{encode_packet, AckStatus, Packet};
use crate::descriptor::BusDescriptor;
use crate::error::ObusError;
use crate::event::Event;
use crate::handle::{CallHandle, ObjectHandle};
use crate::io_channel::IoChannel;
use crate::object::Object;
use crate::reactor::{Reactor, Timer};
use crate::record::Record;
use crate::registry::{CallTable, ObjectTable, Provider, ProviderTable};
use crate::socket::{Address, Stream};

const CHANNEL_TOKEN: Token = Token(0);
const RECONNECT_TIMER: Token = Token(1);

/// The client's connection state.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ClientState {
    Idle,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
    Refused,
}

/// The client engine. Generic over `U`, the per-object user-data slot
/// (see [`crate::object::Object`]).
pub struct Client<U> {
    bus: &'static BusDescriptor,
    client_name: String,
    state: ClientState,
    address: Option<Address>,

    reactor: Reactor,
    reconnect_timer: Timer,
    channel: Option<IoChannel<Stream>>,
    pool: BufPool,

    objects: ObjectTable<U>,
    calls: CallTable,
    providers: ProviderTable<U>,

    on_bus_event: Option<Box<dyn FnMut(&BusEvent)>>,
    on_call_complete: std::collections::HashMap<u16, Box<dyn FnMut(CallOutcome)>>,

    logs: obus_log::logging::BusLoggers,
}

impl<U: Default> Client<U> {
    pub fn new(bus: &'static BusDescriptor, client_name: impl Into<String>) -> Result<Client<U>, ObusError> {
        let logs = obus_log::logging::for_bus_categories(bus.name);
        Ok(Client {
            bus,
            client_name: client_name.into(),
            state: ClientState::Idle,
            address: None,
            reactor: Reactor::new(1024).map_err(ObusError::from)?,
            reconnect_timer: Timer::new(RECONNECT_TIMER),
            channel: None,
            pool: BufPool::new(crate::buffer::DEFAULT_BUF_SIZE),
            objects: ObjectTable::new(),
            calls: CallTable::new(),
            providers: ProviderTable::new(),
            on_bus_event: None,
            on_call_complete: std::collections::HashMap::new(),
            logs,
        })
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn on_bus_event(&mut self, callback: impl FnMut(&BusEvent) + 'static) {
        self.on_bus_event = Some(Box::new(callback));
    }

    pub fn register_provider(&mut self, object_uid: u16, provider: Provider<U>) -> Result<(), ObusError> {
        self.providers.register(object_uid, provider)
    }

    pub fn unregister_provider(&mut self, object_uid: u16) {
        self.providers.unregister(object_uid);
    }

    pub fn object(&self, handle: ObjectHandle) -> Option<&Object<U>> {
        self.objects.get(handle)
    }

    /// `start(address)`: Idle -> Connecting.
    pub fn start(&mut self, address: &str) -> Result<(), ObusError> {
        if self.state != ClientState::Idle {
            return Err(ObusError::invalid_state("client already started"));
        }
        let address = Address::parse(address)?;
        self.address = Some(address);
        self.state = ClientState::Connecting;
        self.try_connect();
        Ok(())
    }

    fn try_connect(&mut self) {
        let address = self.address.clone().expect("connecting requires an address");
        match Stream::connect(&address) {
            Ok(mut stream) => {
                obus_log::slog::debug!(self.logs.socket, "connecting"; "address" => format!("{:?}", address));
                let _ = self.reactor.register(&mut stream, CHANNEL_TOKEN, Interest::READABLE | Interest::WRITABLE);
                let mut channel = IoChannel::new(stream, CHANNEL_TOKEN);
                self.send_con_req(&mut channel);
                self.channel = Some(channel);
            }
            Err(err) => {
                obus_log::slog::debug!(self.logs.socket, "connect failed, retrying";
                    "address" => format!("{:?}", address), "error" => %err);
                self.reactor.arm_timer(&mut self.reconnect_timer, Duration::from_millis(500));
            }
        }
    }

    fn send_con_req(&mut self, channel: &mut IoChannel<Stream>) {
        let packet = Packet::ConReq {
            version: crate::codec::PROTOCOL_VERSION,
            bus_name: self.bus.name.to_string(),
            schema_crc: self.bus.schema_crc,
            client_name: self.client_name.clone(),
        };
        let mut bytes = Vec::new();
        if encode_packet(&mut bytes, &packet).is_ok() {
            let buf = self.pool.acquire();
            buf.borrow_mut().extend(&bytes);
            channel.queue_write(buf);
        }
    }

    /// Runs one reactor turn: polls for readiness, reconnects, reads and
    /// dispatches packets, flushes pending writes.
    pub fn process(&mut self) -> Result<(), ObusError> {
        let now = Instant::now();

        if self.reconnect_timer.is_armed() {
            let (_, fired) = self.reactor.turn().map_err(ObusError::from)?;
            if fired.contains(&RECONNECT_TIMER) && self.state == ClientState::Connecting {
                self.try_connect();
            }
        } else {
            self.reactor.turn().map_err(ObusError::from)?;
        }

        if let Some(mut channel) = self.channel.take() {
            let read_result = channel.receive(now);
            match read_result {
                Ok(_) => {
                    let packets = channel.drain_packets(self.bus);
                    self.channel = Some(channel);
                    for packet in packets {
                        self.handle_packet(packet);
                    }
                    if let Some(channel) = self.channel.as_mut() {
                        let _ = channel.flush(now, &mut self.pool);
                        if channel.write_timed_out(now) {
                            self.disconnect();
                        }
                    }
                }
                Err(outcome) if outcome.is_wait() => {
                    self.channel = Some(channel);
                }
                Err(outcome) => {
                    if let crate::error::IoOutcome::Fatal(err) = &outcome {
                        obus_log::slog::debug!(self.logs.io, "read failed, disconnecting"; "error" => %err);
                    }
                    self.channel = Some(channel);
                    self.disconnect();
                }
            }
        }

        Ok(())
    }

    fn handle_packet(&mut self, packet: Packet) {
        match packet {
            Packet::ConResp(ConnStatus::Accepted { objects }) => self.on_con_resp_accepted(objects),
            Packet::ConResp(ConnStatus::Refused) => self.on_con_resp_refused(),
            Packet::Add(add) => self.on_add(add),
            Packet::Remove(remove) => self.on_remove(remove),
            Packet::Event(event) => self.on_event(event),
            Packet::BusEvent { uid, adds, removes, events } => self.on_bus_event_packet(uid, adds, removes, events),
            Packet::Ack { call_handle, status } => self.on_ack(call_handle, status),
            Packet::ConReq { .. } | Packet::Call { .. } => {
                // Not valid on this side of the wire; silently ignored.
            }
        }
    }

    fn on_con_resp_accepted(&mut self, objects: Vec<ObjectAdd>) {
        self.state = ClientState::Connected;
        obus_log::slog::info!(self.logs.connection, "connected"; "bus" => self.bus.name);
        let mut bus_event = bus_event::synthetic::connected();
        for add in objects {
            let handle = ObjectHandle(add.handle);
            if let Some(descriptor) = self.bus.object_by_uid(add.object_uid) {
                let mut object: Object<U> = Object::new(handle, descriptor);
                *object.info_mut() = add.info.clone();
                self.objects.insert_with_handle(handle, object);
                bus_event.add(handle, add.object_uid, add.info);
            }
        }
        self.deliver_and_commit(bus_event);
    }

    fn on_con_resp_refused(&mut self) {
        self.state = ClientState::Refused;
        obus_log::slog::warn!(self.logs.connection, "connection refused"; "bus" => self.bus.name);
        let bus_event = bus_event::synthetic::connection_refused();
        self.deliver_and_commit(bus_event);
    }

    fn on_add(&mut self, add: ObjectAdd) {
        let descriptor = match self.bus.object_by_uid(add.object_uid) {
            Some(d) => d,
            None => return,
        };
        let handle = ObjectHandle(add.handle);
        let mut object: Object<U> = Object::new(handle, descriptor);
        *object.info_mut() = add.info.clone();
        self.objects.insert_with_handle(handle, object);

        let mut bus_event = BusEvent::new();
        bus_event.add(handle, add.object_uid, add.info);
        if let (Some(object), Some(provider)) = (self.objects.get_mut(handle), self.providers.get_mut(add.object_uid)) {
            provider.fire_add(object, &bus_event);
        }
    }

    fn on_remove(&mut self, remove: ObjectRemove) {
        let handle = ObjectHandle(remove.handle);
        self.abort_calls(handle);

        let bus_event = {
            let mut event = BusEvent::new();
            event.remove(handle, remove.object_uid);
            event
        };
        if let (Some(object), Some(provider)) = (self.objects.get_mut(handle), self.providers.get_mut(remove.object_uid)) {
            provider.fire_remove(object, &bus_event);
        }
        self.objects.force_remove(handle);
    }

    fn on_event(&mut self, record: EventRecord) {
        let handle = ObjectHandle(record.handle);
        let descriptor = match self.bus.object_by_uid(record.object_uid).and_then(|d| d.event_by_uid(record.event_uid)) {
            Some(d) => d,
            None => return,
        };

        let event = Event::new(descriptor, record.fields.clone());
        let illegal = event.illegal_fields();
        if !illegal.is_empty() {
            obus_log::slog::warn!(self.logs.bus, "event touched fields outside its update set";
                "event" => descriptor.name, "illegal_fields" => ?illegal);
        }

        let bus_event = {
            let mut be = BusEvent::new();
            be.event(handle, record.object_uid, Event::new(descriptor, record.fields.clone()));
            be
        };

        if let (Some(object), Some(provider)) = (self.objects.get_mut(handle), self.providers.get_mut(record.object_uid)) {
            provider.fire_event(object, &event, &bus_event);
        }
        if let Some(object) = self.objects.get_mut(handle) {
            object.commit(event.fields());
        }
    }

    fn on_bus_event_packet(&mut self, uid: u16, adds: Vec<ObjectAdd>, removes: Vec<ObjectRemove>, events: Vec<EventRecord>) {
        let mut bus_event = match self.bus.bus_event_by_uid(uid) {
            Some(descriptor) => BusEvent::tagged(descriptor),
            None => BusEvent::new(),
        };
        for add in &adds {
            bus_event.add(ObjectHandle(add.handle), add.object_uid, add.info.clone());
        }
        for event_record in &events {
            if let Some(event_desc) = self
                .bus
                .object_by_uid(event_record.object_uid)
                .and_then(|d| d.event_by_uid(event_record.event_uid))
            {
                bus_event.event(
                    ObjectHandle(event_record.handle),
                    event_record.object_uid,
                    Event::new(event_desc, event_record.fields.clone()),
                );
            }
        }
        for remove in &removes {
            bus_event.remove(ObjectHandle(remove.handle), remove.object_uid);
        }

        if let Some(cb) = self.on_bus_event.as_mut() {
            cb(&bus_event);
        }

        // Commit order: Add -> Event -> Remove. Every addition in this
        // batch is registered before any provider's add callback fires,
        // so a callback never observes a sibling object of the same
        // batch still missing.
        for add in &adds {
            let handle = ObjectHandle(add.handle);
            if let Some(d) = self.bus.object_by_uid(add.object_uid) {
                let mut object: Object<U> = Object::new(handle, d);
                *object.info_mut() = add.info.clone();
                self.objects.insert_with_handle(handle, object);
            }
        }
        for add in adds {
            let handle = ObjectHandle(add.handle);
            if let (Some(object), Some(provider)) = (self.objects.get_mut(handle), self.providers.get_mut(add.object_uid)) {
                provider.fire_add(object, &bus_event);
            }
        }
        for event_record in events {
            let handle = ObjectHandle(event_record.handle);
            if let Some(object) = self.objects.get_mut(handle) {
                object.commit(&event_record.fields);
            }
        }
        for remove in removes {
            let handle = ObjectHandle(remove.handle);
            self.abort_calls(handle);
            if let (Some(object), Some(provider)) = (self.objects.get_mut(handle), self.providers.get_mut(remove.object_uid)) {
                provider.fire_remove(object, &bus_event);
            }
            self.objects.force_remove(handle);
        }
    }

    fn on_ack(&mut self, call_handle: u16, status: AckStatus) {
        if self.calls.take(CallHandle(call_handle)).is_some() {
            if let Some(mut cb) = self.on_call_complete.remove(&call_handle) {
                cb(CallOutcome::Ack(status));
            }
        }
    }

    fn deliver_and_commit(&mut self, bus_event: BusEvent) {
        if let Some(cb) = self.on_bus_event.as_mut() {
            cb(&bus_event);
        }
        for add in bus_event.additions() {
            if let (Some(object), Some(provider)) = (self.objects.get_mut(add.handle), self.providers.get_mut(add.object_uid)) {
                provider.fire_add(object, &bus_event);
            }
        }
    }

    fn abort_calls(&mut self, handle: ObjectHandle) {
        for call in self.calls.drain_for_object(handle) {
            if let Some(mut cb) = self.on_call_complete.remove(&call.handle().0) {
                cb(CallOutcome::Ack(AckStatus::Aborted));
            }
        }
    }

    /// Method call. Rejected if not connected, object
    /// unregistered, or (left to the caller's descriptor-level check)
    /// the method isn't enabled.
    pub fn call_method(
        &mut self,
        object_handle: ObjectHandle,
        method_uid: u16,
        args: Record,
        on_complete: impl FnMut(CallOutcome) + 'static,
    ) -> Result<CallHandle, ObusError> {
        if self.state != ClientState::Connected {
            return Err(ObusError::invalid_state("client is not connected"));
        }
        let object = self
            .objects
            .get(object_handle)
            .ok_or_else(|| ObusError::not_found("no such object"))?;
        if !object.is_registered() {
            return Err(ObusError::invalid_state("object is not registered"));
        }
        let object_uid = object.uid();

        let call_handle = self.calls.insert(object_handle, object_uid, method_uid, args.clone());
        self.on_call_complete.insert(call_handle.0, Box::new(on_complete));

        let packet = Packet::Call {
            object_uid,
            handle: object_handle.0,
            method_uid,
            call_handle: call_handle.0,
            args,
        };
        let mut bytes = Vec::new();
        if encode_packet(&mut bytes, &packet).is_ok() {
            if let Some(channel) = self.channel.as_mut() {
                let buf = self.pool.acquire();
                buf.borrow_mut().extend(&bytes);
                channel.queue_write(buf);
            }
        }

        Ok(call_handle)
    }

    fn disconnect(&mut self) {
        if self.state != ClientState::Connected && self.state != ClientState::Connecting {
            return;
        }
        self.state = ClientState::Disconnecting;
        obus_log::slog::info!(self.logs.connection, "disconnected"; "bus" => self.bus.name);

        for call in self.calls.drain_all() {
            if let Some(mut cb) = self.on_call_complete.remove(&call.handle().0) {
                cb(CallOutcome::Ack(AckStatus::Aborted));
            }
        }

        let mut bus_event = BusEvent::new();
        for (handle, object) in self.objects.iter() {
            if object.is_registered() {
                bus_event.remove(handle, object.uid());
            }
        }
        let bus_event = {
            let mut disconnected = bus_event::synthetic::disconnected();
            for removal in bus_event.removals() {
                disconnected.remove(removal.handle, removal.object_uid);
            }
            disconnected
        };

        if let Some(cb) = self.on_bus_event.as_mut() {
            cb(&bus_event);
        }
        for removal in bus_event.removals() {
            if let (Some(object), Some(provider)) = (self.objects.get_mut(removal.handle), self.providers.get_mut(removal.object_uid)) {
                provider.fire_remove(object, &bus_event);
            }
            self.objects.force_remove(removal.handle);
        }

        self.channel = None;
        self.state = ClientState::Connecting;
        self.reactor.arm_timer(&mut self.reconnect_timer, Duration::from_millis(500));
    }
}

