//! Per-author rate limiting and proof-of-work policy.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use crate::error::{RelayError, Result};
use crate::event::Event;

struct RateBucket {
    tokens: f64,
    last_refill: Instant,
}

/// Enforces per-pubkey token-bucket rate limits and PoW minimums.
///
/// The bucket map is process-wide and never persisted; replicas limit
/// independently.
pub struct AbuseControls {
    burst: u32,
    sustained_per_minute: u32,
    default_pow_bits: i32,
    buckets: Mutex<HashMap<String, RateBucket>>,
}

impl AbuseControls {
    pub fn new(burst: u32, sustained_per_minute: u32, default_pow_bits: i32) -> Self {
        Self {
            burst,
            sustained_per_minute,
            default_pow_bits,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Take one token from the author's bucket, refilling for elapsed time.
    pub fn allow(&self, pubkey: &str, now: Instant) -> bool {
        let mut buckets = self.buckets.lock().unwrap();
        let bucket = buckets.entry(pubkey.to_string()).or_insert(RateBucket {
            tokens: self.burst as f64,
            last_refill: now,
        });

        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            let refill_rate = self.sustained_per_minute as f64 / 60.0;
            bucket.tokens = (bucket.tokens + elapsed * refill_rate).min(self.burst as f64);
            bucket.last_refill = now;
        }

        if bucket.tokens < 1.0 {
            return false;
        }
        bucket.tokens -= 1.0;
        true
    }

    /// Proof-of-work bits required for a kind.
    pub fn required_pow_bits(&self, kind: i32) -> i32 {
        match kind {
            9007 => 28,
            1020 => 24,
            0 => 20,
            30022 => 16,
            20002 => 12,
            10006 => 12,
            20011 => 8,
            20012 => 8,
            _ => self.default_pow_bits,
        }
    }

    /// Check the event id carries at least `required_bits` of leading-zero
    /// work, and that a committed `nonce` target (when present) is honest.
    pub fn validate_pow(&self, event: &Event, required_bits: i32) -> Result<()> {
        if required_bits <= 0 {
            return Ok(());
        }

        let pow_bits = leading_zero_bits(&event.id)?;
        if pow_bits < required_bits {
            return Err(RelayError::Pow(format!(
                "insufficient pow: have {pow_bits} bits, need {required_bits}"
            )));
        }

        let tag_difficulty = extract_nonce_difficulty(event);
        if tag_difficulty > 0 && tag_difficulty < required_bits {
            return Err(RelayError::Pow(
                "pow nonce tag difficulty below required target".into(),
            ));
        }
        Ok(())
    }
}

/// Committed difficulty from the first `nonce` tag with three elements,
/// zero when absent or unparseable.
fn extract_nonce_difficulty(event: &Event) -> i32 {
    for tag in &event.tags {
        if tag.0.len() < 3 || tag.name() != "nonce" {
            continue;
        }
        if let Ok(bits) = tag.0[2].trim().parse::<i32>() {
            if bits > 0 {
                return bits;
            }
        }
    }
    0
}

/// Count leading zero bits of a hex-encoded id, big-endian byte-wise.
fn leading_zero_bits(hex_id: &str) -> Result<i32> {
    let bytes = hex::decode(hex_id.trim())
        .map_err(|e| RelayError::Pow(format!("invalid event id for pow: {e}")))?;
    let mut bits = 0;
    for b in bytes {
        if b == 0 {
            bits += 8;
        } else {
            bits += b.leading_zeros() as i32;
            break;
        }
    }
    Ok(bits)
}
