//! Cache of upstream `thoughtSignature` values keyed by thinking content.
//!
//! Clients routinely strip signatures from assistant thinking blocks before
//! replaying a conversation. The Gemini family rejects unsigned thoughts, so
//! the latest signature observed for a given thinking text is remembered and
//! re-attached on the next request. Entries expire after a TTL; a miss is
//! answered with the skip sentinel. Races are last-writer-wins.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

/// Sentinel the upstream accepts in place of a real signature on replay.
pub const SKIP_SIGNATURE_SENTINEL: &str = "skip_thought_signature_validator";

#[derive(Debug)]
pub struct SignatureCache {
    entries: Mutex<HashMap<[u8; 32], (String, Instant)>>,
    ttl: Duration,
}

impl SignatureCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub fn record(&self, thinking: &str, signature: &str) {
        if signature.is_empty() {
            return;
        }
        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.insert(
            digest(thinking),
            (signature.to_string(), Instant::now() + self.ttl),
        );
    }

    /// Fresh cached signature for `thinking`, or the skip sentinel.
    pub fn lookup(&self, thinking: &str) -> String {
        let key = digest(thinking);
        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match entries.get(&key) {
            Some((signature, expires_at)) if *expires_at > Instant::now() => signature.clone(),
            Some(_) => {
                entries.remove(&key);
                SKIP_SIGNATURE_SENTINEL.to_string()
            }
            None => SKIP_SIGNATURE_SENTINEL.to_string(),
        }
    }
}

fn digest(thinking: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(thinking.as_bytes());
    hasher.finalize().into()
}
