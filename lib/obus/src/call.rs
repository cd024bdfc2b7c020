//! Method calls: client-side pending calls awaiting an ack, and the
//! server-side transient call context a method handler runs in.

use crate::codec::AckStatus;
use crate::handle::{CallHandle, ObjectHandle};
use crate::record::Record;

/// A call the client has sent and is waiting on an [`AckStatus`] for.
/// Held in the client's call table, keyed by `call_handle`, until the
/// matching `Ack` arrives or the connection drops.
pub struct PendingCall {
    handle: CallHandle,
    object_handle: ObjectHandle,
    object_uid: u16,
    method_uid: u16,
    args: Record,
}

impl PendingCall {
    pub fn new(
        handle: CallHandle,
        object_handle: ObjectHandle,
        object_uid: u16,
        method_uid: u16,
        args: Record,
    ) -> PendingCall {
        PendingCall {
            handle,
            object_handle,
            object_uid,
            method_uid,
            args,
        }
    }

    pub fn handle(&self) -> CallHandle {
        self.handle
    }

    pub fn object_handle(&self) -> ObjectHandle {
        self.object_handle
    }

    pub fn object_uid(&self) -> u16 {
        self.object_uid
    }

    pub fn method_uid(&self) -> u16 {
        self.method_uid
    }

    pub fn args(&self) -> &Record {
        &self.args
    }
}

/// What a client does with a call's outcome. A dropped connection is
/// delivered the same way as a real server response, as
/// `Ack(AckStatus::Aborted)`, so callers have one path to handle
/// instead of two.
pub enum CallOutcome {
    Ack(AckStatus),
}

/// The server-side context one in-flight method call runs in. A server
/// processes at most one call at a time, per the single
/// current-call slot — a handler must call [`InFlightCall::finish`]
/// (or the engine does so implicitly on disconnect) before the next
/// `Call` packet is read off that peer.
pub struct InFlightCall {
    call_handle: u16,
    object_handle: ObjectHandle,
    object_uid: u16,
    method_uid: u16,
    args: Record,
    status: Option<AckStatus>,
}

impl InFlightCall {
    pub fn new(
        call_handle: u16,
        object_handle: ObjectHandle,
        object_uid: u16,
        method_uid: u16,
        args: Record,
    ) -> InFlightCall {
        InFlightCall {
            call_handle,
            object_handle,
            object_uid,
            method_uid,
            args,
            status: None,
        }
    }

    pub fn call_handle(&self) -> u16 {
        self.call_handle
    }

    pub fn object_handle(&self) -> ObjectHandle {
        self.object_handle
    }

    pub fn object_uid(&self) -> u16 {
        self.object_uid
    }

    pub fn method_uid(&self) -> u16 {
        self.method_uid
    }

    pub fn args(&self) -> &Record {
        &self.args
    }

    /// Records the handler's verdict. A handler that never calls this
    /// leaves the call stuck at `None`; the engine then acks
    /// `AckStatus::Aborted` on the peer's behalf when it disconnects.
    pub fn finish(&mut self, status: AckStatus) {
        self.status = Some(status);
    }

    pub fn status(&self) -> Option<AckStatus> {
        self.status
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::FieldDescriptor;

    static ARGS: &[FieldDescriptor] = &[];

    #[test]
    fn in_flight_call_starts_unfinished() {
        let call = InFlightCall::new(1, ObjectHandle(7), 1, 2, Record::empty(ARGS));
        assert!(!call.is_finished());
        assert_eq!(call.status(), None);
    }

    #[test]
    fn finish_records_status() {
        let mut call = InFlightCall::new(1, ObjectHandle(7), 1, 2, Record::empty(ARGS));
        call.finish(AckStatus::MethodDisabled);
        assert!(call.is_finished());
        assert_eq!(call.status(), Some(AckStatus::MethodDisabled));
    }
}
