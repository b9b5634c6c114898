//! ---
//! frau_section: "02-messaging-protocol"
//! frau_subsection: "module"
//! frau_type: "source"
//! frau_scope: "code"
//! frau_description: "Message protocol core: envelopes, ports, requests and services."
//! frau_version: "v0.0.0-prealpha"
//! frau_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;

const DEFAULT_PREFIX: &str = "frau-port";

// Created on first use, never reset for the life of the process.
static GLOBAL: Lazy<Arc<PortIdGenerator>> =
    Lazy::new(|| Arc::new(PortIdGenerator::new(DEFAULT_PREFIX)));

/// Monotonic source of port identities.
///
/// Request ids are namespaced by port id, so every port sharing an
/// endpoint must draw from the same generator.
#[derive(Debug)]
pub struct PortIdGenerator {
    prefix: String,
    issued: AtomicU64,
}

impl PortIdGenerator {
    /// Generator yielding `<prefix>-1`, `<prefix>-2`, ...
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            issued: AtomicU64::new(0),
        }
    }

    /// Process-wide generator used when none is injected.
    pub fn global() -> Arc<Self> {
        Arc::clone(&GLOBAL)
    }

    /// Allocate the next id.
    pub fn next_id(&self) -> String {
        let n = self.issued.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}-{}", self.prefix, n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_monotonic_per_generator() {
        let ids = PortIdGenerator::new("test");
        assert_eq!(ids.next_id(), "test-1");
        assert_eq!(ids.next_id(), "test-2");

        let other = PortIdGenerator::new("other");
        assert_eq!(other.next_id(), "other-1");
    }

    #[test]
    fn global_generator_is_shared() {
        let first = PortIdGenerator::global().next_id();
        let second = PortIdGenerator::global().next_id();
        assert_ne!(first, second);
        assert!(first.starts_with("frau-port-"));
    }
}
