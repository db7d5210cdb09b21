//! Nostr event model and event-level cryptography.

use secp256k1::{schnorr::Signature, Keypair, Message, Secp256k1, XOnlyPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{RelayError, Result};

/// Simple tag wrapper preserving tag fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tag(pub Vec<String>);

impl Tag {
    /// Tag name (first element), empty when the tag is empty.
    pub fn name(&self) -> &str {
        self.0.first().map(String::as_str).unwrap_or_default()
    }

    /// Tag value (second element), empty when absent.
    pub fn value(&self) -> &str {
        self.0.get(1).map(String::as_str).unwrap_or_default()
    }
}

/// Core Nostr event ingested over HTTP and persisted in Postgres.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Event identifier (hex of SHA-256 over the canonical payload).
    pub id: String,
    /// Author public key (hex, x-only).
    pub pubkey: String,
    /// Unix timestamp of creation.
    pub created_at: i64,
    /// Kind number selecting storage and projection semantics.
    pub kind: i32,
    /// Arbitrary tags.
    pub tags: Vec<Tag>,
    /// Event content body.
    pub content: String,
    /// Schnorr signature over the event hash.
    pub sig: String,
}

impl Event {
    /// First value of the named tag, empty string when absent.
    pub fn first_tag_value(&self, name: &str) -> &str {
        self.tags
            .iter()
            .find(|t| t.name() == name)
            .map(Tag::value)
            .unwrap_or_default()
    }

    /// Whether a tag with the given name exists, with or without a value.
    pub fn has_tag(&self, name: &str) -> bool {
        self.tags.iter().any(|t| t.name() == name)
    }
}

/// Compute the canonical event digest: SHA-256 of the JSON array
/// `[0, lowercase(pubkey), created_at, kind, tags, content]`.
pub fn event_digest(
    pubkey: &str,
    created_at: i64,
    kind: i32,
    tags: &[Tag],
    content: &str,
) -> Result<[u8; 32]> {
    let arr = serde_json::json!([0, pubkey.to_lowercase(), created_at, kind, tags, content]);
    let data = serde_json::to_vec(&arr)?;
    Ok(Sha256::digest(&data).into())
}

/// Recompute the canonical Nostr event id as lowercase hex.
pub fn compute_event_id(
    pubkey: &str,
    created_at: i64,
    kind: i32,
    tags: &[Tag],
    content: &str,
) -> Result<String> {
    Ok(hex::encode(event_digest(
        pubkey, created_at, kind, tags, content,
    )?))
}

/// Verify a BIP-340 Schnorr signature over the given digest.
pub fn verify_signature(digest: &[u8; 32], sig_hex: &str, pubkey_hex: &str) -> Result<()> {
    let sig_bytes =
        hex::decode(sig_hex).map_err(|_| RelayError::Validation("invalid signature".into()))?;
    let sig = Signature::from_slice(&sig_bytes)?;
    let pk_bytes = hex::decode(pubkey_hex)
        .map_err(|_| RelayError::Validation("invalid event pubkey".into()))?;
    let pk = XOnlyPublicKey::from_slice(&pk_bytes)?;
    let secp = Secp256k1::verification_only();
    let msg = Message::from_digest_slice(digest)?;
    secp.verify_schnorr(&sig, &msg, &pk)
        .map_err(|_| RelayError::Validation("invalid signature".into()))
}

/// Derive the x-only public key (lowercase hex) for a private key.
pub fn derive_pubkey(privkey_hex: &str) -> Result<String> {
    Ok(RelaySigner::from_hex(privkey_hex)?.pubkey_hex().to_string())
}

/// Signing identity used for canonical state events.
#[derive(Clone)]
pub struct RelaySigner {
    keypair: Keypair,
    pubkey_hex: String,
}

impl std::fmt::Debug for RelaySigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelaySigner")
            .field("pubkey", &self.pubkey_hex)
            .finish_non_exhaustive()
    }
}

impl RelaySigner {
    /// Build a signer from a hex-encoded secp256k1 private key.
    pub fn from_hex(privkey_hex: &str) -> Result<Self> {
        let sk = hex::decode(privkey_hex.trim())
            .map_err(|_| RelayError::Validation("invalid relay private key".into()))?;
        let secp = Secp256k1::new();
        let keypair = Keypair::from_seckey_slice(&secp, &sk)?;
        let pubkey_hex = hex::encode(keypair.x_only_public_key().0.serialize());
        Ok(Self {
            keypair,
            pubkey_hex,
        })
    }

    /// Lowercase hex x-only public key of this signer.
    pub fn pubkey_hex(&self) -> &str {
        &self.pubkey_hex
    }

    /// Build and sign an event authored by the relay key.
    pub fn sign_event(
        &self,
        created_at: i64,
        kind: i32,
        tags: Vec<Tag>,
        content: String,
    ) -> Result<Event> {
        let digest = event_digest(&self.pubkey_hex, created_at, kind, &tags, &content)?;
        let secp = Secp256k1::new();
        let msg = Message::from_digest_slice(&digest)?;
        let sig = secp.sign_schnorr_no_aux_rand(&msg, &self.keypair);
        Ok(Event {
            id: hex::encode(digest),
            pubkey: self.pubkey_hex.clone(),
            created_at,
            kind,
            tags,
            content,
            sig: hex::encode(sig.serialize()),
        })
    }
}
