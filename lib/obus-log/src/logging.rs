//! Structured logging setup.
//!
//! `obus` engines never format a log line themselves — they hold a
//! [`slog::Logger`] and emit structured records through it. [`root`]
//! builds the default sink (a terminal drain on stderr); callers that
//! want a different sink construct their own [`slog::Logger`] and pass
//! it to `Client::new`/`Server::new` instead.

use std::env;

use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::Build;

/// Which bus names are allowed to produce log records for a given
/// category (`OBUS_LOG_ALL`, `OBUS_LOG_IO`, `OBUS_LOG_BUS`,
/// `OBUS_LOG_SOCKET`, `OBUS_LOG_CONNECTION`).
///
/// Values are read once at process start: a comma-separated list of bus
/// names, or `all`/`1` to match any bus.
#[derive(Debug, Clone)]
pub enum EnabledBuses {
    None,
    All,
    Named(Vec<String>),
}

impl EnabledBuses {
    pub fn from_env(var: &str) -> EnabledBuses {
        match env::var(var) {
            Ok(val) => EnabledBuses::parse(&val),
            Err(_) => EnabledBuses::None,
        }
    }

    fn parse(val: &str) -> EnabledBuses {
        let trimmed = val.trim();
        if trimmed.is_empty() {
            return EnabledBuses::None;
        }
        if trimmed == "1" || trimmed.eq_ignore_ascii_case("all") {
            return EnabledBuses::All;
        }
        EnabledBuses::Named(trimmed.split(',').map(|s| s.trim().to_owned()).collect())
    }

    pub fn matches(&self, bus_name: &str) -> bool {
        match self {
            EnabledBuses::None => false,
            EnabledBuses::All => true,
            EnabledBuses::Named(names) => names.iter().any(|n| n == bus_name),
        }
    }
}

/// Builds the default root logger: a terminal drain on stderr at debug
/// level.
pub fn root() -> slog::Logger {
    let mut builder = TerminalLoggerBuilder::new();
    builder.level(Severity::Debug);
    builder.destination(Destination::Stderr);

    builder
        .build()
        .unwrap_or_else(|_| slog::Logger::root(slog::Discard, slog::o!()))
}

/// Returns `root()` scoped down to `slog::Discard` unless `bus_name` is
/// selected by `OBUS_LOG_ALL` or `category_var`.
pub fn for_bus(bus_name: &str, category_var: &str) -> slog::Logger {
    let selected = EnabledBuses::from_env("OBUS_LOG_ALL").matches(bus_name)
        || EnabledBuses::from_env(category_var).matches(bus_name);

    if selected {
        root().new(slog::o!("bus" => bus_name.to_owned()))
    } else {
        slog::Logger::root(slog::Discard, slog::o!())
    }
}

/// One independently-gated logger per category, built for a single bus
/// endpoint: `io` for raw socket read/write activity, `bus` for
/// add/event/remove and record-sanitization warnings, `socket` for
/// bind/connect/accept, and `connection` for peer/client state
/// transitions.
pub struct BusLoggers {
    pub io: slog::Logger,
    pub bus: slog::Logger,
    pub socket: slog::Logger,
    pub connection: slog::Logger,
}

/// Builds a [`BusLoggers`] for `bus_name` from `OBUS_LOG_IO`,
/// `OBUS_LOG_BUS`, `OBUS_LOG_SOCKET`, and `OBUS_LOG_CONNECTION`.
pub fn for_bus_categories(bus_name: &str) -> BusLoggers {
    BusLoggers {
        io: for_bus(bus_name, "OBUS_LOG_IO"),
        bus: for_bus(bus_name, "OBUS_LOG_BUS"),
        socket: for_bus(bus_name, "OBUS_LOG_SOCKET"),
        connection: for_bus(bus_name, "OBUS_LOG_CONNECTION"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_variants() {
        assert!(matches!(EnabledBuses::parse(""), EnabledBuses::None));
        assert!(matches!(EnabledBuses::parse("1"), EnabledBuses::All));
        assert!(matches!(EnabledBuses::parse("all"), EnabledBuses::All));
        assert!(matches!(EnabledBuses::parse("ALL"), EnabledBuses::All));
    }

    #[test]
    fn matches_named_list() {
        let buses = EnabledBuses::parse("ifaces, stats");
        assert!(buses.matches("ifaces"));
        assert!(buses.matches("stats"));
        assert!(!buses.matches("other"));
    }

    #[test]
    fn none_matches_nothing() {
        assert!(!EnabledBuses::None.matches("anything"));
    }
}
