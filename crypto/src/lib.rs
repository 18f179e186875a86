//! # Key derivation
//!
//! The deterministic key machinery behind the address registry and the
//! treasury: BIP32 child key derivation over string chain paths, version-
//! byte base58check addresses, WIF encoding, Bitcoin signed messages and
//! txid computation.
//!
//! The [`KeyDerivation`] trait is the capability boundary the rest of the
//! system programs against; [`KeyEngine`] is the secp256k1-backed
//! implementation. Everything here is a pure function of its inputs, which
//! is what makes dry-run sweeps and crash recovery deterministic.
//!
//! Private key material enters and leaves as [`Protected`] so it can never
//! be serialized or logged.

use hmac::{Hmac, Mac};
use secp256k1::{All, Message, PublicKey, Scalar, Secp256k1, SecretKey};
use sha2::{Digest, Sha256, Sha512};

use ferrox_protected::Protected;

mod base58;
mod error;

pub use error::Error;

pub type Result<T> = std::result::Result<T, Error>;

const HARDENED: u32 = 0x8000_0000;

/// Deterministic key derivation capability.
///
/// Chain paths are slash-separated unsigned segments (`"0/42"`); a
/// trailing apostrophe marks a hardened segment, which only private
/// derivation can follow. The derivation index is appended as the final
/// segment, mirroring how derived addresses are persisted (path, index).
pub trait KeyDerivation: Send + Sync {
    /// Derive the payment address for `(master pubkey, chain, path, index)`.
    fn derive_address(
        &self,
        addr_prefix: u8,
        mpk_pub_hex: &str,
        chain_hex: &str,
        path: &str,
        index: u32,
    ) -> Result<String>;

    /// Derive the child private key for `(master secret, chain, path, index)`.
    fn derive_private_key(
        &self,
        master_secret: &Protected,
        chain_hex: &str,
        path: &str,
        index: u32,
    ) -> Result<Protected>;

    /// Address of the compressed public key behind `secret`.
    fn address_for_private_key(&self, addr_prefix: u8, secret: &Protected) -> Result<String>;

    /// Wallet-import-format encoding of `secret`.
    fn wif(&self, wif_prefix: u8, secret: &Protected, compressed: bool) -> Result<String>;

    /// Sign `message` in the Bitcoin signed-message format; returns the
    /// base64 compact recoverable signature.
    fn sign_message(&self, secret: &Protected, message: &str) -> Result<String>;

    /// Transaction id of a raw transaction: reversed double-SHA256.
    fn txid(&self, raw_tx_hex: &str) -> Result<String>;
}

/// secp256k1-backed [`KeyDerivation`] implementation.
pub struct KeyEngine {
    secp: Secp256k1<All>,
}

impl KeyEngine {
    pub fn new() -> Self {
        KeyEngine {
            secp: Secp256k1::new(),
        }
    }

    fn secret_key(secret: &Protected) -> Result<SecretKey> {
        if secret.len() != 32 {
            return Err(Error::KeyLength {
                expected: 32,
                actual: secret.len(),
            });
        }
        Ok(SecretKey::from_slice(secret.as_bytes())?)
    }

    fn child_public(
        &self,
        parent: &PublicKey,
        chain: &[u8],
        index: u32,
    ) -> Result<(PublicKey, [u8; 32])> {
        let mut data = parent.serialize().to_vec();
        data.extend_from_slice(&index.to_be_bytes());
        let (il, ir) = hmac_sha512(chain, &data)?;
        let tweak = Scalar::from_be_bytes(il).map_err(|_| Error::TweakOutOfRange)?;
        let child = parent.add_exp_tweak(&self.secp, &tweak)?;
        Ok((child, ir))
    }

    fn child_private(
        &self,
        parent: &SecretKey,
        chain: &[u8],
        index: u32,
        hardened: bool,
    ) -> Result<(SecretKey, [u8; 32])> {
        let mut data = Vec::with_capacity(37);
        let index = if hardened { index | HARDENED } else { index };
        if hardened {
            data.push(0);
            data.extend_from_slice(&parent.secret_bytes());
        } else {
            data.extend_from_slice(&PublicKey::from_secret_key(&self.secp, parent).serialize());
        }
        data.extend_from_slice(&index.to_be_bytes());
        let (il, ir) = hmac_sha512(chain, &data)?;
        let tweak = Scalar::from_be_bytes(il).map_err(|_| Error::TweakOutOfRange)?;
        let child = (*parent).add_tweak(&tweak)?;
        Ok((child, ir))
    }
}

impl Default for KeyEngine {
    fn default() -> Self {
        KeyEngine::new()
    }
}

impl KeyDerivation for KeyEngine {
    fn derive_address(
        &self,
        addr_prefix: u8,
        mpk_pub_hex: &str,
        chain_hex: &str,
        path: &str,
        index: u32,
    ) -> Result<String> {
        let mut key = PublicKey::from_slice(&hex::decode(mpk_pub_hex)?)?;
        let mut chain: Vec<u8> = hex::decode(chain_hex)?;
        for (segment, hardened) in path_segments(path, index)? {
            if hardened {
                return Err(Error::HardenedFromPublic);
            }
            let (child, child_chain) = self.child_public(&key, &chain, segment)?;
            key = child;
            chain = child_chain.to_vec();
        }
        Ok(address_from_pubkey(addr_prefix, &key.serialize()))
    }

    fn derive_private_key(
        &self,
        master_secret: &Protected,
        chain_hex: &str,
        path: &str,
        index: u32,
    ) -> Result<Protected> {
        let mut key = Self::secret_key(master_secret)?;
        let mut chain: Vec<u8> = hex::decode(chain_hex)?;
        for (segment, hardened) in path_segments(path, index)? {
            let (child, child_chain) = self.child_private(&key, &chain, segment, hardened)?;
            key = child;
            chain = child_chain.to_vec();
        }
        Ok(Protected::new(key.secret_bytes().to_vec()))
    }

    fn address_for_private_key(&self, addr_prefix: u8, secret: &Protected) -> Result<String> {
        let key = Self::secret_key(secret)?;
        let pubkey = PublicKey::from_secret_key(&self.secp, &key);
        Ok(address_from_pubkey(addr_prefix, &pubkey.serialize()))
    }

    fn wif(&self, wif_prefix: u8, secret: &Protected, compressed: bool) -> Result<String> {
        if secret.len() != 32 {
            return Err(Error::KeyLength {
                expected: 32,
                actual: secret.len(),
            });
        }
        let mut payload = Vec::with_capacity(38);
        payload.push(wif_prefix);
        payload.extend_from_slice(secret.as_bytes());
        if compressed {
            payload.push(1);
        }
        let checksum = sha256d(&payload);
        payload.extend_from_slice(&checksum[..4]);
        Ok(base58::encode(&payload))
    }

    fn sign_message(&self, secret: &Protected, message: &str) -> Result<String> {
        const PREFIX: &[u8] = b"Bitcoin Signed Message:\n";
        let key = Self::secret_key(secret)?;
        let mut bytes = Vec::with_capacity(2 + PREFIX.len() + message.len());
        bytes.push(PREFIX.len() as u8);
        bytes.extend_from_slice(PREFIX);
        bytes.push(message.len() as u8);
        bytes.extend_from_slice(message.as_bytes());
        let digest = sha256d(&bytes);
        let msg = Message::from_digest_slice(&digest)?;
        let signature = self.secp.sign_ecdsa_recoverable(&msg, &key);
        let (recovery_id, compact) = signature.serialize_compact();
        let mut out = [0u8; 65];
        // 27 + recovery id, +4 for a compressed pubkey.
        out[0] = 27 + recovery_id.to_i32() as u8 + 4;
        out[1..].copy_from_slice(&compact);
        Ok(base64::encode(out))
    }

    fn txid(&self, raw_tx_hex: &str) -> Result<String> {
        let raw = hex::decode(raw_tx_hex)?;
        let mut digest = sha256d(&raw);
        digest.reverse();
        Ok(hex::encode(digest))
    }
}

/// Compute the hot master key material from an operator seed phrase:
/// `(master pubkey hex, chain code hex, master secret)`.
pub fn masters_from_seed(seed: &str) -> Result<(String, String, Protected)> {
    let seed = seed.as_bytes();
    if !(16..=64).contains(&seed.len()) {
        return Err(Error::SeedLength);
    }
    let (secret, chain) = hmac_sha512(b"Bitcoin seed", seed)?;
    let key = SecretKey::from_slice(&secret)?;
    let secp = Secp256k1::new();
    let pubkey = PublicKey::from_secret_key(&secp, &key);
    Ok((
        hex::encode(pubkey.serialize()),
        hex::encode(chain),
        Protected::new(secret.to_vec()),
    ))
}

/// Hex of the compressed public key behind a master secret. Used to
/// verify injected key material against the configured public key.
pub fn public_key_hex(secret: &Protected) -> Result<String> {
    if secret.len() != 32 {
        return Err(Error::KeyLength {
            expected: 32,
            actual: secret.len(),
        });
    }
    let key = SecretKey::from_slice(secret.as_bytes())?;
    let secp = Secp256k1::new();
    Ok(hex::encode(PublicKey::from_secret_key(&secp, &key).serialize()))
}

/// Double SHA-256.
pub fn sha256d(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    let second = Sha256::digest(&first);
    let mut out = [0u8; 32];
    out.copy_from_slice(&second);
    out
}

fn address_from_pubkey(prefix: u8, pubkey: &[u8]) -> String {
    let h160 = ripemd160::Ripemd160::digest(&Sha256::digest(pubkey));
    let mut payload = Vec::with_capacity(25);
    payload.push(prefix);
    payload.extend_from_slice(&h160);
    let checksum = sha256d(&payload);
    payload.extend_from_slice(&checksum[..4]);
    base58::encode(&payload)
}

fn hmac_sha512(key: &[u8], data: &[u8]) -> Result<([u8; 32], [u8; 32])> {
    let mut mac = Hmac::<Sha512>::new_varkey(key).map_err(|_| Error::HmacKeyLength)?;
    mac.input(data);
    let code = mac.result().code();
    let (left_half, right_half) = code.split_at(32);
    let mut left = [0u8; 32];
    let mut right = [0u8; 32];
    left.copy_from_slice(left_half);
    right.copy_from_slice(right_half);
    Ok((left, right))
}

fn path_segments(path: &str, index: u32) -> Result<Vec<(u32, bool)>> {
    let mut segments = Vec::new();
    if !path.is_empty() {
        for part in path.split('/') {
            let (digits, hardened) = match part.strip_suffix('\'') {
                Some(digits) => (digits, true),
                None => (part, false),
            };
            let value: u32 = digits
                .parse()
                .map_err(|_| Error::Path(part.to_string()))?;
            if value >= HARDENED {
                return Err(Error::Path(part.to_string()));
            }
            segments.push((value, hardened));
        }
    }
    segments.push((index, false));
    Ok(segments)
}

#[cfg(test)]
mod tests {
    use super::*;

    // BIP32 test vector 2, master key and the m/0 child.
    const TV2_MASTER_PUB: &str =
        "03cbcaa9c98c877a26977d00825c956a238e8dddfbd322cce4f74b0b5bd6ace4a7";
    const TV2_MASTER_CHAIN: &str =
        "60499f801b896d83179a4374aeb7822aaeaceaa0db1f85ee3e904c4defbd9689";
    const TV2_MASTER_SECRET: &str =
        "4b03d6fc340455b363f51020ad3ecca4f0850280cf436c70c727923f6db46c3e";
    const TV2_M0_PUB: &str = "02fc9e5af0ac8d9b3cecfe2a888e2117ba3d089d8585886c9c826b6b22a98d12ea";
    const TV2_M0_SECRET: &str =
        "abe74a98f6c7eabee0428f53798f0ab8aa1bd37873999041703c742f15ac7e1e";

    fn tv2_secret() -> Protected {
        Protected::new(hex::decode(TV2_MASTER_SECRET).unwrap())
    }

    #[test]
    fn bip32_public_child_matches_test_vector() {
        let engine = KeyEngine::new();
        let parent = PublicKey::from_slice(&hex::decode(TV2_MASTER_PUB).unwrap()).unwrap();
        let chain = hex::decode(TV2_MASTER_CHAIN).unwrap();
        let (child, _) = engine.child_public(&parent, &chain, 0).unwrap();
        assert_eq!(hex::encode(child.serialize()), TV2_M0_PUB);
    }

    #[test]
    fn bip32_private_child_matches_test_vector() {
        let engine = KeyEngine::new();
        let child = engine
            .derive_private_key(&tv2_secret(), TV2_MASTER_CHAIN, "", 0)
            .unwrap();
        assert_eq!(hex::encode(child.as_bytes()), TV2_M0_SECRET);
    }

    #[test]
    fn public_and_private_derivation_agree_on_addresses() {
        let engine = KeyEngine::new();
        for index in [0u32, 1, 7, 1000] {
            let from_pub = engine
                .derive_address(0, TV2_MASTER_PUB, TV2_MASTER_CHAIN, "0/42", index)
                .unwrap();
            let secret = engine
                .derive_private_key(&tv2_secret(), TV2_MASTER_CHAIN, "0/42", index)
                .unwrap();
            let from_priv = engine.address_for_private_key(0, &secret).unwrap();
            assert_eq!(from_pub, from_priv);
            assert!(from_pub.starts_with('1'));
        }
    }

    #[test]
    fn hardened_public_derivation_is_rejected() {
        let engine = KeyEngine::new();
        let err = engine
            .derive_address(0, TV2_MASTER_PUB, TV2_MASTER_CHAIN, "0'", 0)
            .unwrap_err();
        assert!(matches!(err, Error::HardenedFromPublic));
    }

    #[test]
    fn wif_matches_reference_vector() {
        let engine = KeyEngine::new();
        let secret = Protected::new(
            hex::decode("0c28fca386c7a227600b2fe50b7cae11ec86d3bf1fbe471be89827e19d72aa1d")
                .unwrap(),
        );
        assert_eq!(
            engine.wif(0x80, &secret, false).unwrap(),
            "5HueCGU8rMjxEXxiPuD5BDku4MkFqeZyd4dZ1jvhTVqvbTLvyTJ"
        );
    }

    #[test]
    fn txid_is_reversed_double_sha() {
        let engine = KeyEngine::new();
        assert_eq!(
            engine.txid("").unwrap(),
            "56944c5d3f98413ef45cf54545538103cc9f298e0575820ad3591376e2e0f65d"
        );
    }

    #[test]
    fn signed_messages_are_65_byte_compact_signatures() {
        let engine = KeyEngine::new();
        let signature = engine.sign_message(&tv2_secret(), "ferrox").unwrap();
        let decoded = base64::decode(signature).unwrap();
        assert_eq!(decoded.len(), 65);
        assert!((31..35).contains(&decoded[0]));
    }

    #[test]
    fn masters_from_seed_is_deterministic() {
        let (mpk, chain, secret) = masters_from_seed("correct horse battery staple").unwrap();
        let (mpk2, chain2, secret2) = masters_from_seed("correct horse battery staple").unwrap();
        assert_eq!(mpk, mpk2);
        assert_eq!(chain, chain2);
        assert_eq!(secret, secret2);
        assert_eq!(secret.len(), 32);

        // The derived deposit address must be reachable from both halves.
        let engine = KeyEngine::new();
        let from_pub = engine.derive_address(0, &mpk, &chain, "0/1", 0).unwrap();
        let child = engine.derive_private_key(&secret, &chain, "0/1", 0).unwrap();
        assert_eq!(from_pub, engine.address_for_private_key(0, &child).unwrap());
    }
}
