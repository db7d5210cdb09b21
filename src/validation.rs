//! Baseline event validity checks.

use std::time::Duration;

use crate::error::{RelayError, Result};
use crate::event::{self, Event};

/// Enforces syntactic and cryptographic validity of incoming events.
///
/// Deterministic modulo the caller-supplied `now`, so tests can pin the clock.
#[derive(Debug, Clone)]
pub struct Validator {
    max_skew: Duration,
}

impl Validator {
    pub fn new(max_skew: Duration) -> Self {
        Self { max_skew }
    }

    pub fn validate(&self, event: &Event, now: i64) -> Result<()> {
        if !is_hex(&event.id, 64) {
            return Err(RelayError::Validation("invalid event id".into()));
        }
        if !is_hex(&event.pubkey, 64) {
            return Err(RelayError::Validation("invalid event pubkey".into()));
        }
        if !is_hex(&event.sig, 128) {
            return Err(RelayError::Validation(
                "invalid event signature format".into(),
            ));
        }
        if event.created_at == 0 {
            return Err(RelayError::Validation("event created_at is required".into()));
        }

        let skew = (now - event.created_at).unsigned_abs();
        if skew > self.max_skew.as_secs() {
            return Err(RelayError::Validation(
                "event created_at out of allowed skew".into(),
            ));
        }

        for (i, tag) in event.tags.iter().enumerate() {
            if tag.0.is_empty() {
                return Err(RelayError::Validation(format!("tag[{i}] is empty")));
            }
            if tag.name().trim().is_empty() {
                return Err(RelayError::Validation(format!("tag[{i}] has empty name")));
            }
        }

        let digest = event::event_digest(
            &event.pubkey,
            event.created_at,
            event.kind,
            &event.tags,
            &event.content,
        )?;
        if hex::encode(digest) != event.id.to_lowercase() {
            return Err(RelayError::Validation(
                "event id does not match payload".into(),
            ));
        }

        event::verify_signature(&digest, &event.sig, &event.pubkey)
    }
}

/// Fixed-length lowercase-or-uppercase hex check.
fn is_hex(value: &str, len: usize) -> bool {
    value.len() == len && value.bytes().all(|b| b.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{RelaySigner, Tag};

    fn validator() -> Validator {
        Validator::new(Duration::from_secs(300))
    }

    fn signed_event(tags: Vec<Tag>) -> Event {
        RelaySigner::from_hex(&"01".repeat(32))
            .unwrap()
            .sign_event(1_700_000_000, 1, tags, "hello".into())
            .unwrap()
    }

    #[test]
    fn accepts_well_formed_event() {
        let ev = signed_event(vec![Tag(vec!["t".into(), "nostr".into()])]);
        validator().validate(&ev, ev.created_at).unwrap();
    }

    #[test]
    fn accepts_uppercase_id_and_pubkey() {
        let mut ev = signed_event(vec![]);
        ev.id = ev.id.to_uppercase();
        ev.pubkey = ev.pubkey.to_uppercase();
        validator().validate(&ev, ev.created_at).unwrap();
    }

    #[test]
    fn rejects_malformed_id() {
        let mut ev = signed_event(vec![]);
        ev.id = "zz".repeat(32);
        let err = validator().validate(&ev, ev.created_at).unwrap_err();
        assert!(err.to_string().contains("invalid event id"));
    }

    #[test]
    fn rejects_malformed_pubkey() {
        let mut ev = signed_event(vec![]);
        ev.pubkey = "short".into();
        let err = validator().validate(&ev, ev.created_at).unwrap_err();
        assert!(err.to_string().contains("invalid event pubkey"));
    }

    #[test]
    fn rejects_malformed_signature() {
        let mut ev = signed_event(vec![]);
        ev.sig.truncate(100);
        let err = validator().validate(&ev, ev.created_at).unwrap_err();
        assert!(err.to_string().contains("signature format"));
    }

    #[test]
    fn rejects_zero_created_at() {
        let signer = RelaySigner::from_hex(&"01".repeat(32)).unwrap();
        let ev = signer.sign_event(0, 1, vec![], String::new()).unwrap();
        let err = validator().validate(&ev, 0).unwrap_err();
        assert!(err.to_string().contains("created_at is required"));
    }

    #[test]
    fn rejects_excessive_skew() {
        let ev = signed_event(vec![]);
        let err = validator().validate(&ev, ev.created_at + 301).unwrap_err();
        assert!(err.to_string().contains("skew"));
        validator().validate(&ev, ev.created_at + 300).unwrap();
    }

    #[test]
    fn rejects_empty_tag_and_blank_name() {
        let mut ev = signed_event(vec![]);
        ev.tags = vec![Tag(vec![])];
        let err = validator().validate(&ev, ev.created_at).unwrap_err();
        assert!(err.to_string().contains("tag[0] is empty"));

        ev.tags = vec![Tag(vec!["  ".into(), "x".into()])];
        let err = validator().validate(&ev, ev.created_at).unwrap_err();
        assert!(err.to_string().contains("tag[0] has empty name"));
    }

    #[test]
    fn rejects_id_payload_mismatch() {
        let mut ev = signed_event(vec![]);
        ev.content = "tampered".into();
        let err = validator().validate(&ev, ev.created_at).unwrap_err();
        assert!(err.to_string().contains("does not match payload"));
    }

    #[test]
    fn rejects_bad_signature() {
        let mut ev = signed_event(vec![]);
        // Re-sign the id with a different key so the id still matches the
        // payload but the signature does not verify under the author pubkey.
        let other = RelaySigner::from_hex(&"02".repeat(32)).unwrap();
        let forged = other
            .sign_event(ev.created_at, ev.kind, ev.tags.clone(), ev.content.clone())
            .unwrap();
        ev.sig = forged.sig;
        let err = validator().validate(&ev, ev.created_at).unwrap_err();
        assert!(err.to_string().contains("invalid signature"));
    }
}
