//! `FileStore` - a [`BackingStore`] over a file on the host file system.
//!
//! Plain files (the program image, mapped data files) are used as they are.
//! A swap file starts with a small header so a stale file with a different
//! geometry is caught at open time:
//!
//! | field          | size    |
//! |----------------|---------|
//! | magic          | 8 bytes |
//! | slot count     | 8 bytes |
//! | page size      | 8 bytes |
//! | slot 0 .. N-1  | N pages |

use std::{
    fs::File,
    io::{self, Read, Seek, SeekFrom, Write},
    path::Path,
};

use log::debug;
use parking_lot::Mutex;
use vm::{page_table::PAGE_SIZE, BackingStore};

const SWAP_MAGIC: u64 = u64::from_le_bytes(*b"DVMSWAP1");
const HEADER_LEN: u64 = 3 * 8;

#[derive(Debug)]
pub struct FileStore {
    file: Mutex<File>,
    /// Where the payload starts; past the header for swap files.
    base: u64,
    /// Payload size of a swap file, which never grows.
    fixed_len: Option<u64>,
}

impl FileStore {
    /// Opens (or creates) a regular file.
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        Ok(FileStore {
            file: Mutex::new(file),
            base: 0,
            fixed_len: None,
        })
    }

    /// Creates a zeroed swap file with `slots` page-sized slots, replacing any old one.
    pub fn create_swap<P: AsRef<Path>>(path: P, slots: usize) -> io::Result<Self> {
        let mut file = File::create(&path)?;
        file.write_all(&SWAP_MAGIC.to_le_bytes())?;
        file.write_all(&(slots as u64).to_le_bytes())?;
        file.write_all(&(PAGE_SIZE as u64).to_le_bytes())?;
        file.set_len(HEADER_LEN + (slots * PAGE_SIZE) as u64)?;
        drop(file);

        debug!("file_store: created swap file with {} slots", slots);
        Self::open_swap(path)
    }

    /// Opens an existing swap file and checks its header.
    pub fn open_swap<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let mut file = File::options().read(true).write(true).open(path)?;

        let mut header = [0u8; HEADER_LEN as usize];
        file.read_exact(&mut header)?;
        let field = |i: usize| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&header[i * 8..(i + 1) * 8]);
            u64::from_le_bytes(bytes)
        };

        if field(0) != SWAP_MAGIC {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "not a swap file"));
        }
        if field(2) != PAGE_SIZE as u64 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("swap file uses {} byte pages", field(2)),
            ));
        }

        Ok(FileStore {
            file: Mutex::new(file),
            base: HEADER_LEN,
            fixed_len: Some(field(1) * PAGE_SIZE as u64),
        })
    }
}

impl BackingStore for FileStore {
    fn read_at(&self, offset: u64, dest: &mut [u8]) -> io::Result<usize> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(self.base + offset))?;

        let mut done = 0;
        while done < dest.len() {
            match file.read(&mut dest[done..])? {
                0 => break,
                n => done += n,
            }
        }
        Ok(done)
    }

    fn write_at(&self, offset: u64, src: &[u8]) -> io::Result<usize> {
        if let Some(len) = self.fixed_len {
            if offset + src.len() as u64 > len {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "write past the end of the swap file",
                ));
            }
        }

        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(self.base + offset))?;
        file.write_all(src)?;
        Ok(src.len())
    }

    fn len(&self) -> u64 {
        match self.fixed_len {
            Some(len) => len,
            None => self
                .file
                .lock()
                .metadata()
                .map_or(0, |meta| meta.len()),
        }
    }
}
