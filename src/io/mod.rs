//! Backing-device abstraction.
//!
//! The filesystem engine performs all of its I/O through the [`BlockDevice`]
//! trait in fixed-size pieces of whatever block size the mounted volume
//! declares. The trait itself is byte-granular so that the 512-byte root
//! block probe can run before the real block size is known.
//!
//! [`MemDevice`] is the memory-backed implementation used by the tests and by
//! image tooling. It shares its storage between clones, the way a block
//! device is shared between a filesystem and the page cache sitting next to
//! it.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use spin::Mutex;

use crate::errors::{CanFail, IOError};

/// A random-access backing store with a fixed size.
pub trait BlockDevice: Send {
    /// Total size of the device, in bytes.
    fn size(&self) -> u64;

    /// Reads `buf.len()` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// [`IOError::OutOfBounds`] if the range does not fit the device,
    /// [`IOError::DeviceError`] if the underlying storage failed.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> CanFail<IOError>;

    /// Writes `buf.len()` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// [`IOError::OutOfBounds`] if the range does not fit the device,
    /// [`IOError::DeviceError`] if the underlying storage failed.
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> CanFail<IOError>;
}

/// Memory-backed [`BlockDevice`].
///
/// Clones share the same storage, so a test (or a caller standing in for the
/// page cache) can keep a handle to the raw bytes while the filesystem owns
/// another.
#[derive(Clone)]
pub struct MemDevice {
    data: Arc<Mutex<Vec<u8>>>,
}

impl MemDevice {
    /// Creates a zero-filled device of `size` bytes.
    pub fn new(size: usize) -> Self {
        Self {
            data: Arc::new(Mutex::new(vec![0u8; size])),
        }
    }

    /// Wraps an existing image.
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self {
            data: Arc::new(Mutex::new(data)),
        }
    }

    /// Runs `f` over the raw image bytes.
    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.data.lock())
    }

    /// Runs `f` over the raw image bytes, mutably.
    pub fn with_bytes_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut self.data.lock())
    }
}

impl BlockDevice for MemDevice {
    fn size(&self) -> u64 {
        self.data.lock().len() as u64
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> CanFail<IOError> {
        let data = self.data.lock();
        let start = usize::try_from(offset).map_err(|_| IOError::OutOfBounds)?;
        let end = start.checked_add(buf.len()).ok_or(IOError::OutOfBounds)?;

        if end > data.len() {
            return Err(IOError::OutOfBounds);
        }

        buf.copy_from_slice(&data[start..end]);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> CanFail<IOError> {
        let mut data = self.data.lock();
        let start = usize::try_from(offset).map_err(|_| IOError::OutOfBounds)?;
        let end = start.checked_add(buf.len()).ok_or(IOError::OutOfBounds)?;

        if end > data.len() {
            return Err(IOError::OutOfBounds);
        }

        data[start..end].copy_from_slice(buf);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_device_roundtrip() {
        let mut dev = MemDevice::new(1024);
        dev.write_at(512, b"hello").unwrap();

        let mut buf = [0u8; 5];
        dev.read_at(512, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn mem_device_out_of_bounds() {
        let mut dev = MemDevice::new(64);
        let mut buf = [0u8; 16];

        assert!(dev.read_at(56, &mut buf).is_err());
        assert!(dev.write_at(u64::MAX, &buf).is_err());
    }

    #[test]
    fn mem_device_clones_share_storage() {
        let mut dev = MemDevice::new(128);
        let alias = dev.clone();

        dev.write_at(0, &[0xa5]).unwrap();
        alias.with_bytes(|bytes| assert_eq!(bytes[0], 0xa5));
    }
}
