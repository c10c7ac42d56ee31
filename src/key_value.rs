//! Key and value capabilities
//!
//! Keys and values are user-defined. The store only needs a small capability
//! set from each: a serialized size, serialization into a caller-provided
//! buffer, and (for keys) equality against a serialized form plus a byte
//! representation the fingerprint is derived from. Tombstones are encoded as
//! records with a zero-length value, so no dedicated value type is needed.

use std::borrow::Cow;

/// Capability set required of keys.
pub trait LogKey {
    /// Size of the serialized form in bytes.
    fn encoded_len(&self) -> u32;

    /// Serialize into `buf`, which is exactly `encoded_len` bytes.
    fn encode(&self, buf: &mut [u8]);

    /// Byte representation the fingerprint is computed from.
    fn repr(&self) -> Cow<'_, [u8]>;

    /// Compare against a serialized key read back from the log.
    fn matches_encoded(&self, encoded: &[u8]) -> bool;
}

/// Capability set required of values.
pub trait LogValue: Sized {
    /// Size of the serialized form in bytes.
    fn encoded_len(&self) -> u32;

    /// Serialize into `buf`, which is exactly `encoded_len` bytes.
    fn encode(&self, buf: &mut [u8]);

    /// Reconstruct a value from its serialized form.
    fn decode(encoded: &[u8]) -> Self;
}

impl LogKey for Vec<u8> {
    fn encoded_len(&self) -> u32 {
        self.len() as u32
    }

    fn encode(&self, buf: &mut [u8]) {
        buf.copy_from_slice(self);
    }

    fn repr(&self) -> Cow<'_, [u8]> {
        Cow::Borrowed(self)
    }

    fn matches_encoded(&self, encoded: &[u8]) -> bool {
        self[..] == *encoded
    }
}

impl LogValue for Vec<u8> {
    fn encoded_len(&self) -> u32 {
        self.len() as u32
    }

    fn encode(&self, buf: &mut [u8]) {
        buf.copy_from_slice(self);
    }

    fn decode(encoded: &[u8]) -> Self {
        encoded.to_vec()
    }
}

impl LogKey for String {
    fn encoded_len(&self) -> u32 {
        self.len() as u32
    }

    fn encode(&self, buf: &mut [u8]) {
        buf.copy_from_slice(self.as_bytes());
    }

    fn repr(&self) -> Cow<'_, [u8]> {
        Cow::Borrowed(self.as_bytes())
    }

    fn matches_encoded(&self, encoded: &[u8]) -> bool {
        self.as_bytes() == encoded
    }
}

impl LogValue for String {
    fn encoded_len(&self) -> u32 {
        self.len() as u32
    }

    fn encode(&self, buf: &mut [u8]) {
        buf.copy_from_slice(self.as_bytes());
    }

    fn decode(encoded: &[u8]) -> Self {
        String::from_utf8_lossy(encoded).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vec_key_capabilities() {
        let key = b"hello".to_vec();
        assert_eq!(LogKey::encoded_len(&key), 5);

        let mut buf = vec![0u8; 5];
        LogKey::encode(&key, &mut buf);
        assert_eq!(buf, b"hello");

        assert!(key.matches_encoded(b"hello"));
        assert!(!key.matches_encoded(b"world"));
        assert!(!key.matches_encoded(b"hell"));
        assert_eq!(key.repr().as_ref(), b"hello");
    }

    #[test]
    fn test_vec_value_round_trip() {
        let value = vec![1u8, 2, 3, 4];
        let mut buf = vec![0u8; LogValue::encoded_len(&value) as usize];
        LogValue::encode(&value, &mut buf);
        assert_eq!(Vec::<u8>::decode(&buf), value);
    }

    #[test]
    fn test_string_round_trip() {
        let key = "key-one".to_string();
        let value = "value-one".to_string();

        let mut kbuf = vec![0u8; LogKey::encoded_len(&key) as usize];
        LogKey::encode(&key, &mut kbuf);
        assert!(key.matches_encoded(&kbuf));

        let mut vbuf = vec![0u8; LogValue::encoded_len(&value) as usize];
        LogValue::encode(&value, &mut vbuf);
        assert_eq!(String::decode(&vbuf), value);
    }

    #[test]
    fn test_empty_value() {
        let value: Vec<u8> = Vec::new();
        assert_eq!(LogValue::encoded_len(&value), 0);
        assert_eq!(Vec::<u8>::decode(&[]), value);
    }
}
