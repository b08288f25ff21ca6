//! Fixed-capacity byte buffer used by every marshal and unmarshal site.
//!
//! Lives inside shared memory, so it never allocates and every read clamps
//! the stored length against the capacity (the peer may have written it).

use crate::error::{BridgeError, Result};
use serde::{de::DeserializeOwned, Serialize};

/// Outcome of a bounded write.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOutcome {
    pub written: usize,
    pub truncated: bool,
}

#[repr(C)]
pub struct BoundedBuf<const N: usize> {
    len: u32,
    data: [u8; N],
}

impl<const N: usize> BoundedBuf<N> {
    pub const CAPACITY: usize = N;

    pub fn new() -> Self {
        Self { len: 0, data: [0; N] }
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    pub fn len(&self) -> usize {
        (self.len as usize).min(N)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy the largest prefix of `src` that fits.
    pub fn write(&mut self, src: &[u8]) -> WriteOutcome {
        self.write_limited(src, N)
    }

    /// Copy at most `max_len` bytes (further capped by the capacity).
    pub fn write_limited(&mut self, src: &[u8], max_len: usize) -> WriteOutcome {
        let limit = max_len.min(N);
        let n = src.len().min(limit);
        self.data[..n].copy_from_slice(&src[..n]);
        self.len = n as u32;
        WriteOutcome {
            written: n,
            truncated: n < src.len(),
        }
    }

    /// Like [`write_limited`](Self::write_limited) but never splits a UTF-8 character.
    pub fn write_str(&mut self, s: &str, max_len: usize) -> WriteOutcome {
        let mut n = s.len().min(max_len).min(N);
        while !s.is_char_boundary(n) {
            n -= 1;
        }
        let outcome = self.write_limited(&s.as_bytes()[..n], n);
        WriteOutcome {
            written: outcome.written,
            truncated: n < s.len(),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.len()]
    }

    pub fn read_string(&self) -> String {
        String::from_utf8_lossy(self.as_bytes()).into_owned()
    }

    /// Encode `value` with bincode. A value that does not fit is an error,
    /// since a truncated encoding cannot be decoded.
    pub fn write_value<T: Serialize>(&mut self, value: &T) -> Result<()> {
        let size = bincode::serialized_size(value)? as usize;
        if size > N {
            return Err(BridgeError::PayloadTooLarge {
                what: std::any::type_name::<T>(),
                required: size,
                capacity: N,
            });
        }
        bincode::serialize_into(&mut self.data[..size], value)?;
        self.len = size as u32;
        Ok(())
    }

    pub fn read_value<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(bincode::deserialize(self.as_bytes())?)
    }
}

impl<const N: usize> Default for BoundedBuf<N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn test_write_fits() {
        let mut buf = BoundedBuf::<16>::new();
        let outcome = buf.write(b"TestVendor");
        assert_eq!(
            outcome,
            WriteOutcome {
                written: 10,
                truncated: false
            }
        );
        assert_eq!(buf.read_string(), "TestVendor");
    }

    #[test]
    fn test_write_truncates_to_capacity() {
        let mut buf = BoundedBuf::<4>::new();
        let outcome = buf.write(b"abcdef");
        assert!(outcome.truncated);
        assert_eq!(outcome.written, 4);
        assert_eq!(buf.as_bytes(), b"abcd");
    }

    #[test]
    fn test_write_limited_respects_max_len() {
        let mut buf = BoundedBuf::<64>::new();
        let outcome = buf.write_limited(b"Parameter Name", 8);
        assert!(outcome.truncated);
        assert_eq!(buf.read_string(), "Paramete");
    }

    #[test]
    fn test_write_str_keeps_char_boundary() {
        let mut buf = BoundedBuf::<64>::new();
        // 'é' is two bytes; a 2-byte limit would split it after 'a'
        let outcome = buf.write_str("aé", 2);
        assert!(outcome.truncated);
        assert_eq!(buf.read_string(), "a");
    }

    #[test]
    fn test_rewrite_shrinks_length() {
        let mut buf = BoundedBuf::<32>::new();
        let _ = buf.write(b"a long first value");
        let _ = buf.write(b"short");
        assert_eq!(buf.as_bytes(), b"short");
        buf.clear();
        assert!(buf.is_empty());
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Rect {
        top: i16,
        left: i16,
        bottom: i16,
        right: i16,
    }

    #[test]
    fn test_value_roundtrip() {
        let mut buf = BoundedBuf::<64>::new();
        let rect = Rect {
            top: 0,
            left: 0,
            bottom: 300,
            right: 400,
        };
        buf.write_value(&rect).unwrap();
        assert_eq!(buf.read_value::<Rect>().unwrap(), rect);
    }

    #[test]
    fn test_value_too_large_is_rejected() {
        let mut buf = BoundedBuf::<8>::new();
        let err = buf.write_value(&vec![0u8; 64]).unwrap_err();
        assert!(matches!(err, BridgeError::PayloadTooLarge { capacity: 8, .. }));
        assert!(buf.is_empty());
    }
}
