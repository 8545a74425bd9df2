//! Binary codec for domain records.
//!
//! All consensus objects and wire payloads are encoded with a fixed-int,
//! size-limited bincode configuration. The decode limit prevents
//! allocation-based DoS from crafted length prefixes within payloads; the
//! fixed configuration keeps encodings canonical so object hashes are stable.

use serde::{de::DeserializeOwned, Serialize};

use crate::{cn_fast_hash, Hash};

/// Errors from encoding or decoding a domain record.
#[derive(Clone, Debug, thiserror::Error)]
pub enum CodecError {
    #[error("encode failed: {0}")]
    Encode(String),
    #[error("decode failed: {0}")]
    Decode(String),
}

/// Size-limited bincode config shared by serialization and deserialization.
fn bincode_config() -> bincode::config::Configuration<
    bincode::config::LittleEndian,
    bincode::config::Fixint,
    bincode::config::Limit<{ 60 * 1024 * 1024 }>,
> {
    bincode::config::legacy().with_limit::<{ 60 * 1024 * 1024 }>()
}

/// Encode a record to its canonical byte form.
pub fn to_binary<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    bincode::serde::encode_to_vec(value, bincode_config()).map_err(|e| CodecError::Encode(e.to_string()))
}

/// Decode a record from bytes, rejecting trailing garbage.
pub fn from_binary<T: DeserializeOwned>(data: &[u8]) -> Result<T, CodecError> {
    let (value, read) = bincode::serde::decode_from_slice(data, bincode_config())
        .map_err(|e| CodecError::Decode(e.to_string()))?;
    if read != data.len() {
        return Err(CodecError::Decode(format!(
            "trailing bytes: consumed {read} of {}",
            data.len()
        )));
    }
    Ok(value)
}

/// Byte size of a record's canonical encoding.
///
/// Consensus records are bounded well under the codec limit
/// (`MAX_TX_SIZE_LIMIT` and `P2P_PACKET_MAX_SIZE` both cap far below the
/// 60 MiB bincode config), so encoding an in-memory record cannot fail.
pub fn binary_size<T: Serialize>(value: &T) -> usize {
    to_binary(value)
        .expect("record encoding is bounded well under the codec limit")
        .len()
}

/// Hash of a record's canonical encoding.
pub fn object_hash<T: Serialize>(value: &T) -> Hash {
    let bytes =
        to_binary(value).expect("record encoding is bounded well under the codec limit");
    cn_fast_hash(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Record {
        version: u8,
        items: Vec<u64>,
        tag: [u8; 32],
    }

    #[test]
    fn roundtrip_is_bitwise() {
        let r = Record {
            version: 5,
            items: vec![1, 2, 3, u64::MAX],
            tag: [7u8; 32],
        };
        let bytes = to_binary(&r).unwrap();
        let back: Record = from_binary(&bytes).unwrap();
        assert_eq!(back, r);
        assert_eq!(to_binary(&back).unwrap(), bytes);
    }

    #[test]
    fn trailing_bytes_rejected() {
        let r = Record {
            version: 1,
            items: vec![],
            tag: [0u8; 32],
        };
        let mut bytes = to_binary(&r).unwrap();
        bytes.push(0xAA);
        assert!(from_binary::<Record>(&bytes).is_err());
    }

    #[test]
    fn object_hash_tracks_content() {
        let a = Record {
            version: 1,
            items: vec![9],
            tag: [0u8; 32],
        };
        let mut b = Record {
            version: 1,
            items: vec![9],
            tag: [0u8; 32],
        };
        assert_eq!(object_hash(&a), object_hash(&b));
        b.items[0] = 10;
        assert_ne!(object_hash(&a), object_hash(&b));
    }
}
