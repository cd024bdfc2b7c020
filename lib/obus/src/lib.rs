//! `obus`: interprocess synchronization of typed object state over
//! stream sockets.
//!
//! A server publishes a set of objects whose fields, events, and
//! methods are described by a static schema (see [`descriptor`]);
//! clients connect, receive a snapshot, and then track every
//! subsequent mutation as an atomic [`bus_event::BusEvent`]. See
//! [`client`] and [`server`] for the two engine types applications
//! embed.

pub mod bus_event;
pub mod buffer;
pub mod call;
pub mod client;
pub mod codec;
pub mod descriptor;
pub mod error;
pub mod event;
pub mod handle;
pub mod io_channel;
pub mod object;
pub mod reactor;
pub mod record;
pub mod registry;
pub mod server;
pub mod socket;

pub use error::{ErrorKind, IoOutcome, IoResult, ObusError};
