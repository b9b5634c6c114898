//! ---
//! frau_section: "02-messaging-protocol"
//! frau_subsection: "module"
//! frau_type: "source"
//! frau_scope: "code"
//! frau_description: "Message protocol core: envelopes, ports, requests and services."
//! frau_version: "v0.0.0-prealpha"
//! frau_owner: "tbd"
//! ---
use frau_common::WILDCARD_ORIGIN;

use crate::envelope::KEY_PREFIX;
use crate::transport::{InboundMessage, SourceId};

/// Inbound security gate.
///
/// Accepts only messages sent by `expected_source`, from an origin matching
/// `target_origin` (wildcard, or both non-empty and equal ignoring ASCII
/// case), whose data carries a string `key` starting with `frau.`.
/// Rejected messages are dropped by the caller without any error.
pub fn validate_event(target_origin: &str, expected_source: SourceId, event: &InboundMessage) -> bool {
    event.source == expected_source
        && (target_origin == WILDCARD_ORIGIN
            || (!target_origin.is_empty()
                && !event.origin.is_empty()
                && target_origin.eq_ignore_ascii_case(&event.origin)))
        && event
            .data
            .get("key")
            .and_then(|key| key.as_str())
            .is_some_and(|key| key.starts_with(KEY_PREFIX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn event(origin: &str, source: SourceId, data: Value) -> InboundMessage {
        InboundMessage {
            origin: origin.to_owned(),
            source,
            data,
        }
    }

    fn keyed() -> Value {
        json!({ "key": "frau.evt.ready", "payload": [] })
    }

    #[test]
    fn rejects_source_mismatch() {
        let expected = SourceId::next();
        let other = SourceId::next();
        assert!(!validate_event("*", expected, &event("https://a.test", other, keyed())));
    }

    #[test]
    fn wildcard_accepts_any_origin() {
        let source = SourceId::next();
        assert!(validate_event("*", source, &event("https://a.test", source, keyed())));
        assert!(validate_event("*", source, &event("", source, keyed())));
    }

    #[test]
    fn origin_comparison_ignores_case() {
        let source = SourceId::next();
        assert!(validate_event(
            "HTTPS://A.test",
            source,
            &event("https://a.TEST", source, keyed())
        ));
        assert!(!validate_event(
            "https://b.test",
            source,
            &event("https://a.test", source, keyed())
        ));
    }

    #[test]
    fn empty_origin_on_either_side_is_rejected() {
        let source = SourceId::next();
        assert!(!validate_event("", source, &event("https://a.test", source, keyed())));
        assert!(!validate_event("https://a.test", source, &event("", source, keyed())));
        assert!(!validate_event("", source, &event("", source, keyed())));
    }

    #[test]
    fn requires_prefixed_string_key() {
        let source = SourceId::next();
        for data in [
            json!({ "payload": [] }),
            json!({ "key": null }),
            json!({ "key": 7 }),
            json!({ "key": "evt.ready" }),
            json!({ "key": "FRAU.evt.ready" }),
            json!("frau.evt.ready"),
        ] {
            assert!(
                !validate_event("*", source, &event("https://a.test", source, data.clone())),
                "{data} should be rejected"
            );
        }
    }
}
