//! Fork-shared atomic word cells

use std::fmt;
use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use memmap2::{MmapMut, MmapOptions};

use crate::error::{ShmError, ShmResult};

/// Size of one cell's backing file. A single cache line holds the word;
/// the kernel rounds the mapping up to a page either way.
pub const CELL_SIZE: usize = 64;

/// Per-process sequence number for collision-free backing file names.
static CELL_SEQ: AtomicU64 = AtomicU64::new(0);

fn cell_dir() -> PathBuf {
    let shm = Path::new("/dev/shm");
    if shm.is_dir() {
        shm.to_path_buf()
    } else {
        std::env::temp_dir()
    }
}

/// Owned `MAP_SHARED` mapping holding one atomic word at offset zero.
struct CellMapping {
    mmap: MmapMut,
}

impl CellMapping {
    fn word(&self) -> &AtomicI64 {
        unsafe { &*(self.mmap.as_ptr() as *const AtomicI64) }
    }
}

/// A 64-bit integer cell shared across `fork`.
///
/// Created by mapping a freshly created (and immediately unlinked) file
/// in `/dev/shm`, so the cell survives exactly as long as the mappings
/// referencing it. Clones share the same cell; a child forked after
/// creation inherits the mapping and sees the same value.
#[derive(Clone)]
pub struct SharedWord {
    cell: Arc<CellMapping>,
}

impl SharedWord {
    /// Create a new cell seeded with `initial`.
    pub fn new(initial: i64) -> ShmResult<Self> {
        let seq = CELL_SEQ.fetch_add(1, Ordering::Relaxed);
        let path = cell_dir().join(format!("herd_cell_{}_{}", std::process::id(), seq));

        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .mode(0o600)
            .open(&path)
            .map_err(|source| ShmError::Create { path: path.display().to_string(), source })?;
        file.set_len(CELL_SIZE as u64)
            .map_err(|source| ShmError::Create { path: path.display().to_string(), source })?;

        let mmap = unsafe { MmapOptions::new().map_mut(&file)? };

        // The mapping keeps the pages alive; dropping the directory entry
        // makes the cell anonymous and crash-cleaned.
        let _ = std::fs::remove_file(&path);

        let address = mmap.as_ptr() as usize;
        if address % std::mem::align_of::<AtomicI64>() != 0 {
            return Err(ShmError::Alignment { address });
        }

        let word = Self { cell: Arc::new(CellMapping { mmap }) };
        word.store(initial);
        Ok(word)
    }

    /// Read the current value.
    #[inline]
    pub fn load(&self) -> i64 {
        self.cell.word().load(Ordering::SeqCst)
    }

    /// Overwrite the value.
    #[inline]
    pub fn store(&self, value: i64) {
        self.cell.word().store(value, Ordering::SeqCst)
    }

    /// Replace the value, returning the previous one.
    #[inline]
    pub fn swap(&self, value: i64) -> i64 {
        self.cell.word().swap(value, Ordering::SeqCst)
    }
}

impl fmt::Debug for SharedWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SharedWord").field(&self.load()).finish()
    }
}

/// Boolean view over a [`SharedWord`] (0 = false, anything else = true).
#[derive(Clone, Debug)]
pub struct SharedFlag {
    word: SharedWord,
}

impl SharedFlag {
    /// Create a new flag cell seeded with `initial`.
    pub fn new(initial: bool) -> ShmResult<Self> {
        Ok(Self { word: SharedWord::new(initial as i64)? })
    }

    /// Read the flag.
    #[inline]
    pub fn get(&self) -> bool {
        self.word.load() != 0
    }

    /// Set the flag.
    #[inline]
    pub fn set(&self, value: bool) {
        self.word.store(value as i64)
    }
}
