//! Object lifecycle: created (unregistered) -> registered -> unregistered
//! (destroy-eligible).

use crate::descriptor::ObjectDescriptor;
use crate::handle::ObjectHandle;
use crate::record::Record;

/// One instance of an object descriptor, held exclusively by one bus
/// endpoint.
///
/// Generic over `U`, a stable user-data slot an embedding application
/// can use to attach its own state to the object without an extra
/// lookup — a type parameter keeps the association intact rather than
/// a handle-keyed side table would.
pub struct Object<U = ()> {
    handle: ObjectHandle,
    descriptor: &'static ObjectDescriptor,
    info: Record,
    registered: bool,
    user_data: U,
}

impl<U: Default> Object<U> {
    pub fn new(handle: ObjectHandle, descriptor: &'static ObjectDescriptor) -> Object<U> {
        Object {
            handle,
            descriptor,
            info: Record::empty(descriptor.info),
            registered: false,
            user_data: U::default(),
        }
    }
}

impl<U> Object<U> {
    pub fn handle(&self) -> ObjectHandle {
        self.handle
    }

    pub fn descriptor(&self) -> &'static ObjectDescriptor {
        self.descriptor
    }

    pub fn uid(&self) -> u16 {
        self.descriptor.uid
    }

    pub fn info(&self) -> &Record {
        &self.info
    }

    pub fn info_mut(&mut self) -> &mut Record {
        &mut self.info
    }

    pub fn is_registered(&self) -> bool {
        self.registered
    }

    pub fn user_data(&self) -> &U {
        &self.user_data
    }

    pub fn user_data_mut(&mut self) -> &mut U {
        &mut self.user_data
    }

    /// Marks the object visible in the bus. Registration is monotonic:
    /// an object is never silently re-registered.
    pub fn register(&mut self) {
        self.registered = true;
    }

    /// Marks the object invisible in the bus, making it destroy-eligible.
    pub fn unregister(&mut self) {
        self.registered = false;
    }

    /// Returns `Ok(())` if this object may be destroyed (it must not be
    /// registered), `Err(())` otherwise.
    pub fn check_destroyable(&self) -> Result<(), ()> {
        if self.registered {
            Err(())
        } else {
            Ok(())
        }
    }

    /// Commits an event's set fields into this object's info record.
    pub fn commit(&mut self, fields: &Record) {
        self.info.merge(fields);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{FieldDescriptor, FieldRole, PrimitiveType};

    static FIELDS: &[FieldDescriptor] = &[FieldDescriptor {
        uid: 1,
        name: "state",
        role: FieldRole::Property,
        ty: PrimitiveType::String,
        is_array: false,
        enum_driver: None,
    }];

    static DESC: ObjectDescriptor = ObjectDescriptor {
        uid: 1,
        name: "iface",
        info: FIELDS,
        events: &[],
        methods: &[],
    };

    #[test]
    fn register_unregister_is_identity_on_info() {
        let mut obj: Object<()> = Object::new(ObjectHandle(1), &DESC);
        obj.info_mut().set(1, crate::record::FieldValue::Str("UP".into()));
        let before = obj.info().clone();

        obj.register();
        obj.unregister();

        assert_eq!(obj.info().get(1), before.get(1));
    }

    #[test]
    fn registered_object_is_not_destroyable() {
        let mut obj: Object<()> = Object::new(ObjectHandle(1), &DESC);
        obj.register();
        assert!(obj.check_destroyable().is_err());
        obj.unregister();
        assert!(obj.check_destroyable().is_ok());
    }
}
