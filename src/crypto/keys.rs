//! Key generation, one-time key derivation and key images.
//!
//! Derivations follow the CryptoNote scheme: a sender combines their
//! transaction secret key with the recipient's view public key into a shared
//! derivation, then folds the derivation and the output index into a scalar
//! that offsets the recipient's spend key. The recipient performs the mirror
//! computation with their view secret key to recognize owned outputs.

use curve25519_dalek::constants::RISTRETTO_BASEPOINT_TABLE;
use curve25519_dalek::ristretto::RistrettoPoint;
use curve25519_dalek::scalar::Scalar;
use sha3::{Digest, Keccak512};

use super::{KeyImage, PublicKey, SecretKey};

/// Shared secret between a transaction key and an account view key.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct KeyDerivation(pub [u8; 32]);

/// A public/secret key pair.
#[derive(Clone)]
pub struct KeyPair {
    pub public: PublicKey,
    pub secret: SecretKey,
}

impl KeyPair {
    /// Generate a fresh random key pair.
    pub fn generate() -> Self {
        let mut wide = [0u8; 64];
        rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut wide);
        let secret = Scalar::from_bytes_mod_order_wide(&wide);
        Self::from_scalar(secret)
    }

    /// Build a key pair from an existing scalar (e.g. a derived tx key).
    pub fn from_secret(secret: &SecretKey) -> Self {
        Self::from_scalar(secret.scalar())
    }

    fn from_scalar(secret: Scalar) -> Self {
        let public = RISTRETTO_BASEPOINT_TABLE * &secret;
        KeyPair {
            public: PublicKey(public.compress().0),
            secret: SecretKey(secret.to_bytes()),
        }
    }
}

/// Reduce a Keccak-512 digest of `data` to a scalar.
pub fn hash_to_scalar(data: &[u8]) -> Scalar {
    let mut hasher = Keccak512::new();
    hasher.update(data);
    let wide: [u8; 64] = hasher.finalize().into();
    Scalar::from_bytes_mod_order_wide(&wide)
}

/// Deterministically map bytes to a group element with unknown discrete log.
pub fn hash_to_point(data: &[u8]) -> RistrettoPoint {
    let mut hasher = Keccak512::new();
    hasher.update(data);
    let wide: [u8; 64] = hasher.finalize().into();
    RistrettoPoint::from_uniform_bytes(&wide)
}

/// `derivation = secret * public`, the Diffie-Hellman shared point.
///
/// Returns `None` when `public` does not decode to a group element.
pub fn generate_key_derivation(public: &PublicKey, secret: &SecretKey) -> Option<KeyDerivation> {
    let point = public.decompress()?;
    let shared = point * secret.scalar();
    Some(KeyDerivation(shared.compress().0))
}

/// Fold a derivation and an output index into a scalar.
pub fn derivation_to_scalar(derivation: &KeyDerivation, output_index: u64) -> Scalar {
    let mut buf = Vec::with_capacity(32 + 10);
    buf.extend_from_slice(&derivation.0);
    write_varint(&mut buf, output_index);
    hash_to_scalar(&buf)
}

/// One-time output key: `H_s(derivation ‖ index)·G + spend_public`.
pub fn derive_public_key(
    derivation: &KeyDerivation,
    output_index: u64,
    spend_public: &PublicKey,
) -> Option<PublicKey> {
    let base = spend_public.decompress()?;
    let scalar = derivation_to_scalar(derivation, output_index);
    let derived = RISTRETTO_BASEPOINT_TABLE * &scalar + base;
    Some(PublicKey(derived.compress().0))
}

/// One-time secret key: `H_s(derivation ‖ index) + spend_secret`.
pub fn derive_secret_key(
    derivation: &KeyDerivation,
    output_index: u64,
    spend_secret: &SecretKey,
) -> SecretKey {
    let scalar = derivation_to_scalar(derivation, output_index) + spend_secret.scalar();
    SecretKey(scalar.to_bytes())
}

/// Key image of a one-time key pair: `secret · H_p(public)`.
pub fn generate_key_image(public: &PublicKey, secret: &SecretKey) -> KeyImage {
    let base = hash_to_point(&public.0);
    let image = base * secret.scalar();
    KeyImage(image.compress().0)
}

/// LEB128-style varint used when folding output indexes into scalars.
pub(crate) fn write_varint(buf: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        buf.push((value as u8 & 0x7F) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_is_symmetric() {
        // r·V computed by the sender equals v·R computed by the recipient.
        let tx_key = KeyPair::generate();
        let view_key = KeyPair::generate();
        let sender = generate_key_derivation(&view_key.public, &tx_key.secret).unwrap();
        let recipient = generate_key_derivation(&tx_key.public, &view_key.secret).unwrap();
        assert_eq!(sender.0, recipient.0);
    }

    #[test]
    fn derived_keys_match() {
        let tx_key = KeyPair::generate();
        let view = KeyPair::generate();
        let spend = KeyPair::generate();

        let d = generate_key_derivation(&view.public, &tx_key.secret).unwrap();
        let one_time_pub = derive_public_key(&d, 3, &spend.public).unwrap();

        let d2 = generate_key_derivation(&tx_key.public, &view.secret).unwrap();
        let one_time_sec = derive_secret_key(&d2, 3, &spend.secret);
        let recovered = KeyPair::from_secret(&one_time_sec);
        assert_eq!(recovered.public, one_time_pub);
    }

    #[test]
    fn derived_keys_differ_per_index() {
        let tx_key = KeyPair::generate();
        let view = KeyPair::generate();
        let spend = KeyPair::generate();
        let d = generate_key_derivation(&view.public, &tx_key.secret).unwrap();
        let k0 = derive_public_key(&d, 0, &spend.public).unwrap();
        let k1 = derive_public_key(&d, 1, &spend.public).unwrap();
        assert_ne!(k0, k1);
    }

    #[test]
    fn key_image_is_deterministic() {
        let kp = KeyPair::generate();
        let a = generate_key_image(&kp.public, &kp.secret);
        let b = generate_key_image(&kp.public, &kp.secret);
        assert_eq!(a, b);
        let other = KeyPair::generate();
        assert_ne!(a, generate_key_image(&other.public, &other.secret));
    }

    #[test]
    fn derivation_rejects_invalid_public() {
        let kp = KeyPair::generate();
        let bad = PublicKey([0xFF; 32]);
        assert!(generate_key_derivation(&bad, &kp.secret).is_none());
    }

    #[test]
    fn varint_encoding() {
        let mut buf = Vec::new();
        write_varint(&mut buf, 0);
        assert_eq!(buf, [0]);
        buf.clear();
        write_varint(&mut buf, 127);
        assert_eq!(buf, [127]);
        buf.clear();
        write_varint(&mut buf, 128);
        assert_eq!(buf, [0x80, 0x01]);
        buf.clear();
        write_varint(&mut buf, 300);
        assert_eq!(buf, [0xAC, 0x02]);
    }
}
