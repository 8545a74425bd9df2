//! Cryptographic primitives: key types, one-time key derivation, key images
//! and ring signatures.
//!
//! The node consumes these through their contracts only: 32-byte opaque keys
//! and key images, 64-byte signatures, a deterministic per-key-per-output key
//! image, and ring-signature verification against a set of output keys. The
//! implementation uses the Ristretto prime-order group so hash-to-point and
//! subgroup membership are well defined.

mod keys;
mod ring;

pub use keys::{
    derivation_to_scalar, derive_public_key, derive_secret_key, generate_key_derivation,
    generate_key_image, hash_to_point, hash_to_scalar, KeyDerivation, KeyPair,
};
pub use ring::{check_ring_signature, check_signature, generate_ring_signature, generate_signature};

use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use curve25519_dalek::ristretto::{CompressedRistretto, RistrettoPoint};
use curve25519_dalek::scalar::Scalar;

/// A compressed group element identifying an output or an account key half.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PublicKey(pub [u8; 32]);

/// A secret scalar. Zeroized on drop.
#[derive(Clone, Serialize, Deserialize)]
pub struct SecretKey(pub [u8; 32]);

/// Deterministic per-key-per-output tag used for double-spend detection.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyImage(pub [u8; 32]);

/// A (c, r) signature pair, 64 bytes total.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub c: [u8; 32],
    pub r: [u8; 32],
}

impl Drop for SecretKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({})", hex::encode(&self.0[..8]))
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecretKey(..)")
    }
}

impl std::fmt::Debug for KeyImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KeyImage({})", hex::encode(&self.0[..8]))
    }
}

impl std::fmt::Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Signature({}..)", hex::encode(&self.c[..4]))
    }
}

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub(crate) fn decompress(&self) -> Option<RistrettoPoint> {
        CompressedRistretto(self.0).decompress()
    }

    /// Whether the bytes decode to a valid group element.
    pub fn is_valid(&self) -> bool {
        self.decompress().is_some()
    }
}

impl SecretKey {
    pub(crate) fn scalar(&self) -> Scalar {
        Scalar::from_bytes_mod_order(self.0)
    }
}

impl KeyImage {
    /// Subgroup membership check used at the spend-validation site.
    ///
    /// Ed25519 implementations multiply the image by the group order and
    /// compare with the identity; in the prime-order Ristretto group every
    /// decodable element is already in the main subgroup, so the check
    /// reduces to decodability plus rejection of the identity element.
    pub fn is_in_main_subgroup(&self) -> bool {
        use curve25519_dalek::traits::Identity;
        match CompressedRistretto(self.0).decompress() {
            Some(p) => p != RistrettoPoint::identity(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_key_is_valid() {
        let kp = KeyPair::generate();
        assert!(kp.public.is_valid());
    }

    #[test]
    fn key_image_of_real_key_is_in_subgroup() {
        let kp = KeyPair::generate();
        let ki = generate_key_image(&kp.public, &kp.secret);
        assert!(ki.is_in_main_subgroup());
    }

    #[test]
    fn identity_key_image_rejected() {
        use curve25519_dalek::traits::Identity;
        let ki = KeyImage(CompressedRistretto::identity().0);
        assert!(!ki.is_in_main_subgroup());
    }

    #[test]
    fn garbage_key_image_rejected() {
        let ki = KeyImage([0xFF; 32]);
        assert!(!ki.is_in_main_subgroup());
    }
}
