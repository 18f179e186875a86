use thiserror::Error;

/// Key derivation and encoding errors.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid hex input: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("secp256k1 rejected the key material: {0}")]
    Secp256k1(#[from] secp256k1::Error),
    #[error("derived tweak is out of range")]
    TweakOutOfRange,
    #[error("invalid derivation path segment {0:?}")]
    Path(String),
    #[error("hardened derivation requires the private key")]
    HardenedFromPublic,
    #[error("seed length must be between 16 and 64 bytes")]
    SeedLength,
    #[error("invalid hmac key length")]
    HmacKeyLength,
    #[error("private key must be {expected} bytes, got {actual}")]
    KeyLength { expected: usize, actual: usize },
}
