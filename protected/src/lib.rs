//! # Protected
//!
//! Container for key material (master private keys, chain codes, derived
//! WIF secrets) that must never outlive its use: the underlying buffer is
//! zeroed when the value is dropped.
//!
//! `Protected` deliberately implements neither `serde::Serialize` nor
//! `serde::Deserialize`. The treasury keeps hot master private keys in
//! process memory only, and the lack of those impls makes it a type error
//! to hand a secret to the storage layer or to any serializing sink.

#![deny(rust_2018_idioms)]
#![deny(non_upper_case_globals)]
#![deny(non_camel_case_types)]
#![deny(non_snake_case)]
#![deny(unused_mut)]
#![deny(missing_docs)]

use memzero::Memzero;

/// Secret bytes, zeroed on drop.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Protected(Memzero<Vec<u8>>);

impl Protected {
    /// Wrap the given bytes.
    pub fn new<T: Into<Vec<u8>>>(bytes: T) -> Self {
        Protected(bytes.into().into())
    }

    /// Expose the secret bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Length of the secret in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the secret is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<T: Into<Vec<u8>>> From<T> for Protected {
    fn from(bytes: T) -> Self {
        Protected::new(bytes)
    }
}

impl AsRef<[u8]> for Protected {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for Protected {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(fmt, "Protected(***)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_is_redacted() {
        let secret = Protected::from("cafebabe");
        assert_eq!(format!("{:?}", secret), "Protected(***)");
    }

    #[test]
    fn bytes_round_trip() {
        let secret = Protected::new(vec![1u8, 2, 3]);
        assert_eq!(secret.as_bytes(), &[1, 2, 3]);
        assert_eq!(secret.len(), 3);
        assert!(!secret.is_empty());
    }
}
