//! In-process store for hot master private keys.
//!
//! Keys are injected once at process start through an authenticated
//! operator surface and live only in memory; [`Protected`] values cannot
//! be serialized, so they cannot leak into storage or logs. Treasury
//! reads are racy by design: an absent key just defers work.

use std::collections::HashMap;
use std::sync::RwLock;

use ferrox_protected::Protected;

#[derive(Default)]
pub struct HotKeyStore {
    keys: RwLock<HashMap<String, Protected>>,
}

impl HotKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the master private key for a master public key.
    pub fn store(&self, pub_key: &str, secret: Protected) {
        let mut keys = match self.keys.write() {
            Ok(keys) => keys,
            Err(poisoned) => poisoned.into_inner(),
        };
        keys.insert(pub_key.to_string(), secret);
    }

    pub fn get(&self, pub_key: &str) -> Option<Protected> {
        let keys = match self.keys.read() {
            Ok(keys) => keys,
            Err(poisoned) => poisoned.into_inner(),
        };
        keys.get(pub_key).cloned()
    }

    pub fn has(&self, pub_key: &str) -> bool {
        self.get(pub_key).is_some()
    }
}
