//! Ring signatures and single-key signatures.
//!
//! A ring signature proves that the signer owns one of the ring's output
//! keys and binds the spend to a key image without revealing which member
//! signed. Single signatures authenticate multisignature inputs, where each
//! cosigner signs the transaction prefix hash with an output key.

use curve25519_dalek::constants::RISTRETTO_BASEPOINT_TABLE;
use curve25519_dalek::ristretto::{CompressedRistretto, RistrettoPoint};
use curve25519_dalek::scalar::Scalar;
use curve25519_dalek::traits::Identity;

use super::keys::{hash_to_point, hash_to_scalar};
use super::{KeyImage, PublicKey, SecretKey, Signature};
use crate::Hash;

fn random_scalar() -> Scalar {
    let mut wide = [0u8; 64];
    rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut wide);
    Scalar::from_bytes_mod_order_wide(&wide)
}

/// Challenge over the prefix hash and the commitment points of every member.
fn ring_challenge(prefix_hash: &Hash, points: &[RistrettoPoint]) -> Scalar {
    let mut buf = Vec::with_capacity(32 + points.len() * 32);
    buf.extend_from_slice(prefix_hash);
    for p in points {
        buf.extend_from_slice(&p.compress().0);
    }
    hash_to_scalar(&buf)
}

/// Sign `prefix_hash` with the key at `secret_index` in `ring`.
///
/// Returns one `(c, r)` pair per ring member. Fails if any ring key is
/// invalid or the secret does not match `ring[secret_index]`.
pub fn generate_ring_signature(
    prefix_hash: &Hash,
    key_image: &KeyImage,
    ring: &[PublicKey],
    secret: &SecretKey,
    secret_index: usize,
) -> Option<Vec<Signature>> {
    if secret_index >= ring.len() {
        return None;
    }
    let image_point = CompressedRistretto(key_image.0).decompress()?;

    let mut sigs = vec![
        Signature {
            c: [0u8; 32],
            r: [0u8; 32],
        };
        ring.len()
    ];
    // Commitments interleaved as [L_0, R_0, L_1, R_1, ...].
    let mut commitments = vec![RistrettoPoint::identity(); ring.len() * 2];
    let mut c_sum = Scalar::ZERO;
    let mut k = Scalar::ZERO;

    for (i, member) in ring.iter().enumerate() {
        let member_point = member.decompress()?;
        if i == secret_index {
            k = random_scalar();
            commitments[2 * i] = RISTRETTO_BASEPOINT_TABLE * &k;
            commitments[2 * i + 1] = hash_to_point(&member.0) * k;
        } else {
            let c = random_scalar();
            let r = random_scalar();
            commitments[2 * i] = RISTRETTO_BASEPOINT_TABLE * &r + member_point * c;
            commitments[2 * i + 1] = hash_to_point(&member.0) * r + image_point * c;
            sigs[i].c = c.to_bytes();
            sigs[i].r = r.to_bytes();
            c_sum += c;
        }
    }

    let h = ring_challenge(prefix_hash, &commitments);
    let c_s = h - c_sum;
    let r_s = k - c_s * secret.scalar();
    sigs[secret_index].c = c_s.to_bytes();
    sigs[secret_index].r = r_s.to_bytes();
    Some(sigs)
}

/// Verify a ring signature over `prefix_hash` against the ring's output keys.
pub fn check_ring_signature(
    prefix_hash: &Hash,
    key_image: &KeyImage,
    ring: &[PublicKey],
    sigs: &[Signature],
) -> bool {
    if ring.is_empty() || ring.len() != sigs.len() {
        return false;
    }
    let image_point = match CompressedRistretto(key_image.0).decompress() {
        Some(p) => p,
        None => return false,
    };

    let mut commitments = Vec::with_capacity(ring.len() * 2);
    let mut c_sum = Scalar::ZERO;
    for (member, sig) in ring.iter().zip(sigs) {
        let member_point = match member.decompress() {
            Some(p) => p,
            None => return false,
        };
        let c = Scalar::from_bytes_mod_order(sig.c);
        let r = Scalar::from_bytes_mod_order(sig.r);
        commitments.push(RISTRETTO_BASEPOINT_TABLE * &r + member_point * c);
        commitments.push(hash_to_point(&member.0) * r + image_point * c);
        c_sum += c;
    }

    ring_challenge(prefix_hash, &commitments) == c_sum
}

/// Sign `prefix_hash` with a single key (multisignature cosigner path).
pub fn generate_signature(prefix_hash: &Hash, public: &PublicKey, secret: &SecretKey) -> Signature {
    let k = random_scalar();
    let commitment = RISTRETTO_BASEPOINT_TABLE * &k;

    let mut buf = Vec::with_capacity(96);
    buf.extend_from_slice(prefix_hash);
    buf.extend_from_slice(&public.0);
    buf.extend_from_slice(&commitment.compress().0);
    let c = hash_to_scalar(&buf);
    let r = k - c * secret.scalar();
    Signature {
        c: c.to_bytes(),
        r: r.to_bytes(),
    }
}

/// Verify a single-key signature over `prefix_hash`.
pub fn check_signature(prefix_hash: &Hash, public: &PublicKey, sig: &Signature) -> bool {
    let public_point = match public.decompress() {
        Some(p) => p,
        None => return false,
    };
    let c = Scalar::from_bytes_mod_order(sig.c);
    let r = Scalar::from_bytes_mod_order(sig.r);
    let commitment = RISTRETTO_BASEPOINT_TABLE * &r + public_point * c;

    let mut buf = Vec::with_capacity(96);
    buf.extend_from_slice(prefix_hash);
    buf.extend_from_slice(&public.0);
    buf.extend_from_slice(&commitment.compress().0);
    hash_to_scalar(&buf) == c
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{generate_key_image, KeyPair};
    use crate::cn_fast_hash;

    fn make_ring(size: usize, secret_index: usize) -> (Vec<PublicKey>, KeyPair, KeyImage) {
        let mut ring = Vec::with_capacity(size);
        let mut signer = None;
        for i in 0..size {
            let kp = KeyPair::generate();
            ring.push(kp.public);
            if i == secret_index {
                signer = Some(kp);
            }
        }
        let signer = signer.unwrap();
        let image = generate_key_image(&signer.public, &signer.secret);
        (ring, signer, image)
    }

    #[test]
    fn ring_signature_roundtrip() {
        let prefix = cn_fast_hash(b"tx prefix");
        for ring_size in [1usize, 3, 7] {
            let idx = ring_size / 2;
            let (ring, signer, image) = make_ring(ring_size, idx);
            let sigs =
                generate_ring_signature(&prefix, &image, &ring, &signer.secret, idx).unwrap();
            assert_eq!(sigs.len(), ring_size);
            assert!(check_ring_signature(&prefix, &image, &ring, &sigs));
        }
    }

    #[test]
    fn ring_signature_rejects_wrong_prefix() {
        let prefix = cn_fast_hash(b"tx prefix");
        let (ring, signer, image) = make_ring(3, 1);
        let sigs = generate_ring_signature(&prefix, &image, &ring, &signer.secret, 1).unwrap();
        let other = cn_fast_hash(b"different prefix");
        assert!(!check_ring_signature(&other, &image, &ring, &sigs));
    }

    #[test]
    fn ring_signature_rejects_wrong_image() {
        let prefix = cn_fast_hash(b"tx prefix");
        let (ring, signer, _image) = make_ring(3, 0);
        let stranger = KeyPair::generate();
        let wrong_image = generate_key_image(&stranger.public, &stranger.secret);
        let sigs =
            generate_ring_signature(&prefix, &wrong_image, &ring, &signer.secret, 0).unwrap();
        // Signature verifies against the image it was built with, but the
        // image no longer corresponds to any ring member's spend.
        assert!(check_ring_signature(&prefix, &wrong_image, &ring, &sigs));
        let honest_image = generate_key_image(&signer.public, &signer.secret);
        assert!(!check_ring_signature(&prefix, &honest_image, &ring, &sigs));
    }

    #[test]
    fn ring_signature_rejects_tampered_member() {
        let prefix = cn_fast_hash(b"tx prefix");
        let (mut ring, signer, image) = make_ring(4, 2);
        let sigs = generate_ring_signature(&prefix, &image, &ring, &signer.secret, 2).unwrap();
        ring[0] = KeyPair::generate().public;
        assert!(!check_ring_signature(&prefix, &image, &ring, &sigs));
    }

    #[test]
    fn ring_signature_length_mismatch_rejected() {
        let prefix = cn_fast_hash(b"tx prefix");
        let (ring, signer, image) = make_ring(3, 0);
        let mut sigs = generate_ring_signature(&prefix, &image, &ring, &signer.secret, 0).unwrap();
        sigs.pop();
        assert!(!check_ring_signature(&prefix, &image, &ring, &sigs));
    }

    #[test]
    fn single_signature_roundtrip() {
        let prefix = cn_fast_hash(b"multisig prefix");
        let kp = KeyPair::generate();
        let sig = generate_signature(&prefix, &kp.public, &kp.secret);
        assert!(check_signature(&prefix, &kp.public, &sig));
        assert!(!check_signature(&prefix, &KeyPair::generate().public, &sig));
    }
}
