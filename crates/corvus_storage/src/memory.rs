//! In-memory backend for tests and ephemeral databases.

use crate::backend::LogBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;

/// A backend that keeps the whole log in a memory buffer.
///
/// Nothing survives the process; this exists for unit tests and for
/// ephemeral databases opened without a directory.
///
/// # Example
///
/// ```rust
/// use corvus_storage::{LogBackend, MemoryBackend};
///
/// let backend = MemoryBackend::new();
/// backend.append(b"abc").unwrap();
/// assert_eq!(backend.len().unwrap(), 3);
/// ```
#[derive(Debug, Default)]
pub struct MemoryBackend {
    buf: RwLock<Vec<u8>>,
}

impl MemoryBackend {
    /// Creates an empty in-memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a backend pre-seeded with `data`, for recovery tests.
    #[must_use]
    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            buf: RwLock::new(data),
        }
    }

    /// Returns a copy of the whole buffer.
    #[must_use]
    pub fn contents(&self) -> Vec<u8> {
        self.buf.read().clone()
    }
}

impl LogBackend for MemoryBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let buf = self.buf.read();
        let start = usize::try_from(offset).unwrap_or(usize::MAX);
        let end = start.saturating_add(len);
        if end > buf.len() {
            return Err(StorageError::ReadPastEnd {
                offset,
                len,
                size: buf.len() as u64,
            });
        }
        Ok(buf[start..end].to_vec())
    }

    fn append(&self, data: &[u8]) -> StorageResult<u64> {
        let mut buf = self.buf.write();
        let offset = buf.len() as u64;
        buf.extend_from_slice(data);
        Ok(offset)
    }

    fn flush(&self) -> StorageResult<()> {
        Ok(())
    }

    fn sync(&self) -> StorageResult<()> {
        Ok(())
    }

    fn len(&self) -> StorageResult<u64> {
        Ok(self.buf.read().len() as u64)
    }

    fn rewind(&self, size: u64) -> StorageResult<()> {
        let mut buf = self.buf.write();
        let current = buf.len() as u64;
        if size > current {
            return Err(StorageError::RewindPastEnd {
                target: size,
                size: current,
            });
        }
        buf.truncate(size as usize);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_is_empty() {
        let backend = MemoryBackend::new();
        assert!(backend.is_empty().unwrap());
    }

    #[test]
    fn append_returns_offsets() {
        let backend = MemoryBackend::new();
        assert_eq!(backend.append(b"hello").unwrap(), 0);
        assert_eq!(backend.append(b" world").unwrap(), 5);
        assert_eq!(backend.len().unwrap(), 11);
    }

    #[test]
    fn read_back_ranges() {
        let backend = MemoryBackend::new();
        backend.append(b"hello world").unwrap();
        assert_eq!(backend.read_at(0, 5).unwrap(), b"hello");
        assert_eq!(backend.read_at(6, 5).unwrap(), b"world");
    }

    #[test]
    fn read_past_end_fails() {
        let backend = MemoryBackend::new();
        backend.append(b"hello").unwrap();
        assert!(matches!(
            backend.read_at(3, 10),
            Err(StorageError::ReadPastEnd { .. })
        ));
    }

    #[test]
    fn with_data_preseeds() {
        let backend = MemoryBackend::with_data(b"seed".to_vec());
        assert_eq!(backend.read_at(0, 4).unwrap(), b"seed");
    }

    #[test]
    fn rewind_to_zero() {
        let backend = MemoryBackend::new();
        backend.append(b"hello").unwrap();
        backend.rewind(0).unwrap();
        assert!(backend.is_empty().unwrap());
        assert_eq!(backend.append(b"x").unwrap(), 0);
    }

    #[test]
    fn rewind_partial() {
        let backend = MemoryBackend::new();
        backend.append(b"hello world").unwrap();
        backend.rewind(5).unwrap();
        assert_eq!(backend.contents(), b"hello");
    }

    #[test]
    fn rewind_past_end_fails() {
        let backend = MemoryBackend::new();
        backend.append(b"abc").unwrap();
        assert!(matches!(
            backend.rewind(10),
            Err(StorageError::RewindPastEnd { .. })
        ));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(32))]

            #[test]
            fn chunked_appends_read_back_contiguously(
                chunks in proptest::collection::vec(
                    proptest::collection::vec(any::<u8>(), 0..64),
                    0..16,
                ),
            ) {
                let backend = MemoryBackend::new();
                let mut expected: Vec<u8> = Vec::new();
                for chunk in &chunks {
                    let offset = backend.append(chunk).unwrap();
                    prop_assert_eq!(offset, expected.len() as u64);
                    expected.extend_from_slice(chunk);
                }
                prop_assert_eq!(backend.len().unwrap(), expected.len() as u64);
                prop_assert_eq!(backend.read_at(0, expected.len()).unwrap(), expected);
            }

            #[test]
            fn rewind_keeps_exactly_the_prefix(
                data in proptest::collection::vec(any::<u8>(), 1..256),
                cut in any::<prop::sample::Index>(),
            ) {
                let backend = MemoryBackend::new();
                backend.append(&data).unwrap();
                let keep = cut.index(data.len());
                backend.rewind(keep as u64).unwrap();
                prop_assert_eq!(backend.contents(), &data[..keep]);
                prop_assert_eq!(backend.append(b"x").unwrap(), keep as u64);
            }
        }
    }
}
