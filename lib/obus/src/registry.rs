//! Per-bus state: the object table, the call table, and (client-side)
//! the provider table. Each bus owns a handle -> object map, a list of
//! in-flight calls (client) or a single current-call pointer (server),
//! a handle -> call map, and a UID -> provider map (client only).

use std::collections::HashMap;

use indexmap::IndexMap;

use crate::bus_event::BusEvent;
use crate::call::{InFlightCall, PendingCall};
use crate::error::{ErrorKind, ObusError};
use crate::event::Event;
use crate::handle::{self, CallHandle, Handle, ObjectHandle};
use crate::object::Object;

/// The object table: every object this endpoint currently holds,
/// registered or not, keyed by its handle.
pub struct ObjectTable<U> {
    objects: IndexMap<Handle, Object<U>>,
}

impl<U: Default> ObjectTable<U> {
    pub fn new() -> ObjectTable<U> {
        ObjectTable { objects: IndexMap::new() }
    }

    /// Allocates a fresh handle and inserts a new object for `descriptor`.
    pub fn create(&mut self, descriptor: &'static crate::descriptor::ObjectDescriptor) -> ObjectHandle {
        let raw = handle::allocate(&self.objects);
        let object = Object::new(ObjectHandle(raw), descriptor);
        self.objects.insert(raw, object);
        ObjectHandle(raw)
    }

    /// Inserts an object under a handle dictated by the peer (used on
    /// the client when decoding an `Add` whose handle the server chose).
    pub fn insert_with_handle(&mut self, handle: ObjectHandle, mut object: Object<U>) {
        object.register();
        self.objects.insert(handle.0, object);
    }

    pub fn get(&self, handle: ObjectHandle) -> Option<&Object<U>> {
        self.objects.get(&handle.0)
    }

    pub fn get_mut(&mut self, handle: ObjectHandle) -> Option<&mut Object<U>> {
        self.objects.get_mut(&handle.0)
    }

    pub fn remove(&mut self, handle: ObjectHandle) -> Result<Object<U>, ObusError> {
        let object = self
            .objects
            .get(&handle.0)
            .ok_or_else(|| ObusError::not_found("no such object handle"))?;
        object
            .check_destroyable()
            .map_err(|_| ObusError::invalid_state("object still registered"))?;
        Ok(self.objects.shift_remove(&handle.0).expect("checked above"))
    }

    /// Forcibly drops an object regardless of registration state, used
    /// when a `Remove` packet or a peer disconnect requires immediate
    /// teardown.
    pub fn force_remove(&mut self, handle: ObjectHandle) -> Option<Object<U>> {
        self.objects.shift_remove(&handle.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ObjectHandle, &Object<U>)> {
        self.objects.iter().map(|(&h, o)| (ObjectHandle(h), o))
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

impl<U: Default> Default for ObjectTable<U> {
    fn default() -> Self {
        ObjectTable::new()
    }
}

/// Client-side call table: every call awaiting an ack, keyed by its
/// handle.
pub struct CallTable {
    calls: IndexMap<Handle, PendingCall>,
}

impl CallTable {
    pub fn new() -> CallTable {
        CallTable { calls: IndexMap::new() }
    }

    pub fn insert(
        &mut self,
        object_handle: ObjectHandle,
        object_uid: u16,
        method_uid: u16,
        args: crate::record::Record,
    ) -> CallHandle {
        let raw = handle::allocate(&self.calls);
        let call = PendingCall::new(CallHandle(raw), object_handle, object_uid, method_uid, args);
        self.calls.insert(raw, call);
        CallHandle(raw)
    }

    pub fn take(&mut self, handle: CallHandle) -> Option<PendingCall> {
        self.calls.shift_remove(&handle.0)
    }

    /// Every pending call targeting `object_handle`, removed from the
    /// table (used when that object is removed mid-call).
    pub fn drain_for_object(&mut self, object_handle: ObjectHandle) -> Vec<PendingCall> {
        let matching: Vec<Handle> = self
            .calls
            .iter()
            .filter(|(_, call)| call.object_handle() == object_handle)
            .map(|(h, _)| *h)
            .collect();
        matching
            .into_iter()
            .filter_map(|h| self.calls.shift_remove(&h))
            .collect()
    }

    pub fn drain_all(&mut self) -> Vec<PendingCall> {
        self.calls.drain(..).map(|(_, call)| call).collect()
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

impl Default for CallTable {
    fn default() -> Self {
        CallTable::new()
    }
}

/// Server-side: at most one call is being serviced per peer at a time.
#[derive(Default)]
pub struct CurrentCall {
    current: Option<InFlightCall>,
}

impl CurrentCall {
    pub fn start(&mut self, call: InFlightCall) -> Result<(), ObusError> {
        if self.current.is_some() {
            return Err(ObusError::invalid_state("a call is already in flight on this peer"));
        }
        self.current = Some(call);
        Ok(())
    }

    pub fn get(&self) -> Option<&InFlightCall> {
        self.current.as_ref()
    }

    pub fn get_mut(&mut self) -> Option<&mut InFlightCall> {
        self.current.as_mut()
    }

    pub fn finish(&mut self) -> Option<InFlightCall> {
        self.current.take()
    }

    pub fn is_busy(&self) -> bool {
        self.current.is_some()
    }
}

/// A client-side subscription to one object UID: callbacks fire as bus
/// events touch objects of that UID.
pub struct Provider<U> {
    on_add: Box<dyn FnMut(&mut Object<U>, &BusEvent)>,
    on_remove: Box<dyn FnMut(&mut Object<U>, &BusEvent)>,
    on_event: Box<dyn FnMut(&mut Object<U>, &Event, &BusEvent)>,
}

impl<U> Provider<U> {
    pub fn new(
        on_add: impl FnMut(&mut Object<U>, &BusEvent) + 'static,
        on_remove: impl FnMut(&mut Object<U>, &BusEvent) + 'static,
        on_event: impl FnMut(&mut Object<U>, &Event, &BusEvent) + 'static,
    ) -> Provider<U> {
        Provider {
            on_add: Box::new(on_add),
            on_remove: Box::new(on_remove),
            on_event: Box::new(on_event),
        }
    }

    pub fn fire_add(&mut self, object: &mut Object<U>, bus_event: &BusEvent) {
        (self.on_add)(object, bus_event)
    }

    pub fn fire_remove(&mut self, object: &mut Object<U>, bus_event: &BusEvent) {
        (self.on_remove)(object, bus_event)
    }

    pub fn fire_event(&mut self, object: &mut Object<U>, event: &Event, bus_event: &BusEvent) {
        (self.on_event)(object, event, bus_event)
    }
}

/// UID -> provider map. At most one provider per object UID; registering
/// a second is an error.
#[derive(Default)]
pub struct ProviderTable<U> {
    providers: HashMap<u16, Provider<U>>,
}

impl<U> ProviderTable<U> {
    pub fn new() -> ProviderTable<U> {
        ProviderTable { providers: HashMap::new() }
    }

    pub fn register(&mut self, object_uid: u16, provider: Provider<U>) -> Result<(), ObusError> {
        if self.providers.contains_key(&object_uid) {
            return Err(ObusError::new(
                ErrorKind::InvalidState,
                "a provider is already registered for this object uid",
            ));
        }
        self.providers.insert(object_uid, provider);
        Ok(())
    }

    pub fn unregister(&mut self, object_uid: u16) {
        self.providers.remove(&object_uid);
    }

    pub fn get_mut(&mut self, object_uid: u16) -> Option<&mut Provider<U>> {
        self.providers.get_mut(&object_uid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::ObjectDescriptor;

    static DESC: ObjectDescriptor = ObjectDescriptor {
        uid: 1,
        name: "iface",
        info: &[],
        events: &[],
        methods: &[],
    };

    #[test]
    fn create_then_destroy_requires_unregistered() {
        let mut table: ObjectTable<()> = ObjectTable::new();
        let handle = table.create(&DESC);
        assert!(table.remove(handle).is_ok());
    }

    #[test]
    fn registered_object_cannot_be_destroyed() {
        let mut table: ObjectTable<()> = ObjectTable::new();
        let handle = table.create(&DESC);
        table.get_mut(handle).unwrap().register();
        assert!(table.remove(handle).is_err());
    }

    #[test]
    fn call_table_drains_by_object() {
        let mut calls = CallTable::new();
        let obj = ObjectHandle(42);
        calls.insert(obj, 1, 2, crate::record::Record::empty(&[]));
        calls.insert(ObjectHandle(99), 1, 2, crate::record::Record::empty(&[]));

        let drained = calls.drain_for_object(obj);
        assert_eq!(drained.len(), 1);
        assert_eq!(calls.len(), 1);
    }

    #[test]
    fn current_call_rejects_concurrent_start() {
        let mut current = CurrentCall::default();
        current
            .start(InFlightCall::new(1, ObjectHandle(1), 1, 1, crate::record::Record::empty(&[])))
            .unwrap();
        let second = current.start(InFlightCall::new(2, ObjectHandle(1), 1, 1, crate::record::Record::empty(&[])));
        assert!(second.is_err());
        assert!(current.finish().is_some());
    }

    #[test]
    fn provider_table_rejects_duplicate_registration() {
        let mut table: ProviderTable<()> = ProviderTable::new();
        table.register(1, Provider::new(|_, _| {}, |_, _| {}, |_, _, _| {})).unwrap();
        assert!(table.register(1, Provider::new(|_, _| {}, |_, _| {}, |_, _, _| {})).is_err());
    }
}
