//! Byte-addressed storage the pager reads pages from and writes them back to:
//! executable images, mapped files and the swap device.

use std::io;

use parking_lot::Mutex;

pub trait BackingStore: Send + Sync {
    /// Reads up to `dest.len()` bytes starting at `offset`.
    ///
    /// Returns the number of bytes read, which is short only at the end of the store.
    fn read_at(&self, offset: u64, dest: &mut [u8]) -> io::Result<usize>;

    /// Writes `src` at `offset`, returning the number of bytes written.
    fn write_at(&self, offset: u64, src: &[u8]) -> io::Result<usize>;

    /// Current size of the store in bytes.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A store kept entirely in memory. Used as a RAM disk for swap and as the file layer in tests.
#[derive(Debug, Default)]
pub struct MemStore {
    data: Mutex<Vec<u8>>,
    /// Writes never grow the store past its initial size when set.
    fixed_size: bool,
}

impl MemStore {
    /// A store of `size` zero bytes that cannot grow.
    pub fn new(size: usize) -> Self {
        MemStore {
            data: Mutex::new(vec![0; size]),
            fixed_size: true,
        }
    }

    /// A growable store holding `bytes`, like a regular file.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        MemStore {
            data: Mutex::new(bytes.into()),
            fixed_size: false,
        }
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.data.lock().clone()
    }
}

impl BackingStore for MemStore {
    fn read_at(&self, offset: u64, dest: &mut [u8]) -> io::Result<usize> {
        let data = self.data.lock();
        let start = (offset as usize).min(data.len());
        let end = (start + dest.len()).min(data.len());
        let n = end - start;
        dest[..n].copy_from_slice(&data[start..end]);
        Ok(n)
    }

    fn write_at(&self, offset: u64, src: &[u8]) -> io::Result<usize> {
        let mut data = self.data.lock();
        let start = offset as usize;
        let end = start + src.len();
        if end > data.len() {
            if self.fixed_size {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    format!("write of {} bytes at {} past end of store", src.len(), offset),
                ));
            }
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(src);
        Ok(src.len())
    }

    fn len(&self) -> u64 {
        self.data.lock().len() as u64
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;

    /// A store whose every operation fails.
    pub(crate) struct BrokenStore;

    impl BackingStore for BrokenStore {
        fn read_at(&self, _offset: u64, _dest: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::Other, "device error"))
        }

        fn write_at(&self, _offset: u64, _src: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::Other, "device error"))
        }

        fn len(&self) -> u64 {
            1 << 20
        }
    }

    /// Reads like the wrapped store; every write fails.
    pub(crate) struct ReadOnlyStore(pub(crate) MemStore);

    impl BackingStore for ReadOnlyStore {
        fn read_at(&self, offset: u64, dest: &mut [u8]) -> io::Result<usize> {
            self.0.read_at(offset, dest)
        }

        fn write_at(&self, _offset: u64, _src: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "read-only device"))
        }

        fn len(&self) -> u64 {
            self.0.len()
        }
    }

    #[test]
    fn short_read_at_end() {
        let store = MemStore::from_bytes(vec![1, 2, 3]);
        let mut buf = [0u8; 8];
        assert_eq!(store.read_at(1, &mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], &[2, 3]);
        assert_eq!(store.read_at(10, &mut buf).unwrap(), 0);
    }

    #[test]
    fn fixed_store_rejects_growth() {
        let store = MemStore::new(4);
        assert!(store.write_at(2, &[9, 9, 9]).is_err());
        assert_eq!(store.write_at(2, &[9, 9]).unwrap(), 2);
        assert_eq!(store.to_vec(), vec![0, 0, 9, 9]);
    }

    #[test]
    fn file_like_store_grows() {
        let store = MemStore::from_bytes(Vec::new());
        store.write_at(3, &[7]).unwrap();
        assert_eq!(store.len(), 4);
        assert_eq!(store.to_vec(), vec![0, 0, 0, 7]);
    }
}
