//! Accumulation buffer for one in-flight photo transfer.
//!
//! The announced size is informational. Senders may declare a size before
//! re-encoding the image, so the sentinel is authoritative: the buffer never
//! truncates or rejects bytes because of the declared size.

use bytes::{Bytes, BytesMut};

use super::wire_format::MAX_PREALLOCATION;

/// Photo transfer record: declared size plus the bytes received so far.
///
/// The received count is the buffer length, so the two cannot drift apart.
#[derive(Debug)]
pub struct PhotoAssembly {
    declared_size: u64,
    buffer: BytesMut,
}

impl PhotoAssembly {
    /// Open a record for a transfer announced with `declared_size` bytes.
    pub fn new(declared_size: u64) -> Self {
        let capacity = usize::try_from(declared_size)
            .unwrap_or(usize::MAX)
            .min(MAX_PREALLOCATION);
        Self {
            declared_size,
            buffer: BytesMut::with_capacity(capacity),
        }
    }

    /// Append payload bytes. The only mutator.
    #[inline]
    pub fn append(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Take the accumulated bytes, leaving the record empty.
    pub fn finalize(&mut self) -> Bytes {
        self.buffer.split().freeze()
    }

    /// Size announced by the device.
    #[inline]
    pub fn declared_size(&self) -> u64 {
        self.declared_size
    }

    /// Bytes received so far.
    #[inline]
    pub fn received(&self) -> u64 {
        self.buffer.len() as u64
    }

    /// Whether the received count matches the announcement.
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.received() == self.declared_size
    }

    /// Progress as a whole percentage, capped at 100.
    ///
    /// Returns `None` for a zero-size announcement.
    pub fn progress_percent(&self) -> Option<u8> {
        if self.declared_size == 0 {
            return None;
        }
        let percent = (u128::from(self.received()) * 100) / u128::from(self.declared_size);
        Some(percent.min(100) as u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_finalize() {
        let mut photo = PhotoAssembly::new(4);
        photo.append(&[0xFF, 0xD8]);
        photo.append(&[0xFF, 0xD9]);

        assert_eq!(photo.received(), 4);
        assert!(photo.is_complete());

        let bytes = photo.finalize();
        assert_eq!(&bytes[..], &[0xFF, 0xD8, 0xFF, 0xD9]);
        assert_eq!(photo.received(), 0);
    }

    #[test]
    fn test_declared_size_does_not_truncate() {
        let mut photo = PhotoAssembly::new(2);
        photo.append(b"abcdef");

        assert_eq!(photo.received(), 6);
        assert!(!photo.is_complete());
        assert_eq!(&photo.finalize()[..], b"abcdef");
    }

    #[test]
    fn test_progress_percent() {
        let mut photo = PhotoAssembly::new(200);
        assert_eq!(photo.progress_percent(), Some(0));

        photo.append(&[0u8; 50]);
        assert_eq!(photo.progress_percent(), Some(25));

        photo.append(&[0u8; 149]);
        assert_eq!(photo.progress_percent(), Some(99));

        photo.append(&[0u8; 100]);
        assert_eq!(photo.progress_percent(), Some(100));
    }

    #[test]
    fn test_progress_zero_declared() {
        let mut photo = PhotoAssembly::new(0);
        photo.append(b"x");
        assert_eq!(photo.progress_percent(), None);
    }

    #[test]
    fn test_huge_declaration_does_not_preallocate() {
        let photo = PhotoAssembly::new(u64::MAX);
        assert_eq!(photo.declared_size(), u64::MAX);
        assert_eq!(photo.received(), 0);
    }
}
