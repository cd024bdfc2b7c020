//! Ambient support crate for `obus`: structured logging and time helpers.
//!
//! Mirrors the split the engine crate historically relied on a sibling
//! support crate for — logging setup lives here so the core bus crate
//! never has to decide how records are formatted, only what they say.

pub mod logging;
pub mod time;

pub use slog;
