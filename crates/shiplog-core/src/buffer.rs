//! Growable memory-mapped append buffer.
//!
//! The backing file starts with an 8-byte header `{ magic: u32, logical_size: u32 }`
//! (little-endian) followed by the pushed bytes. The mapping always spans a whole
//! number of pages. Growth extends the file and maps it again, so bytes pushed
//! before a growth, or before a process restart, are still there afterwards.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use memmap2::MmapMut;
use tracing::{debug, error, warn};

use crate::error::{CoreError, CoreResult};

/// Sentinel stored in the first four bytes of every initialized buffer file ("SHLB").
pub const BUFFER_MAGIC: u32 = 0x5348_4c42;

/// Size of the `{ magic, logical_size }` header.
pub const BUFFER_HEADER_LEN: usize = 8;

/// Smallest mapping created for a new buffer file: 512 KiB.
pub const DEFAULT_BUFFER_CAPACITY: usize = 512 * 1024;

/// Returns the OS page size, falling back to 4 KiB if the query fails.
pub fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions and only reads a system constant.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        4096
    } else {
        size as usize
    }
}

fn align_up(value: usize, align: usize) -> usize {
    value.div_ceil(align) * align
}

/// Append-only byte buffer backed by a memory-mapped file.
///
/// Capacity is always a multiple of the page size and never shrinks. The logical
/// size only grows through [`MappedBuffer::push`] and returns to zero through
/// [`MappedBuffer::clear`].
pub struct MappedBuffer {
    path: PathBuf,
    file: File,
    map: Option<MmapMut>,
    capacity: usize,
    page_size: usize,
}

impl std::fmt::Debug for MappedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedBuffer")
            .field("path", &self.path)
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}

impl MappedBuffer {
    /// Opens or creates the buffer file with the default 512 KiB floor.
    pub fn open(path: impl AsRef<Path>) -> CoreResult<Self> {
        Self::open_with_capacity(path, DEFAULT_BUFFER_CAPACITY)
    }

    /// Opens or creates the buffer file, mapping at least `min_capacity` bytes or
    /// the current file size, whichever is larger.
    ///
    /// A file whose header magic is missing or whose recorded size does not fit
    /// the mapping is treated as empty and reinitialized.
    pub fn open_with_capacity(path: impl AsRef<Path>, min_capacity: usize) -> CoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let file_size = file.metadata()?.len() as usize;

        let mut buffer = Self {
            path,
            file,
            map: None,
            capacity: 0,
            page_size: page_size(),
        };
        buffer.reserve(file_size.max(min_capacity).max(BUFFER_HEADER_LEN))?;
        buffer.init_header();
        Ok(buffer)
    }

    /// Grows the mapping to the next page-aligned size `>= capacity`.
    ///
    /// No-op when the current capacity already suffices. Any slice previously
    /// returned by [`MappedBuffer::data`] must be dropped first, which the borrow
    /// checker enforces.
    pub fn reserve(&mut self, capacity: usize) -> CoreResult<()> {
        if capacity <= self.capacity {
            return Ok(());
        }
        let new_capacity = align_up(capacity, self.page_size);

        if let Some(map) = self.map.take() {
            if let Err(e) = map.flush_async() {
                warn!(path = %self.path.display(), error = %e, "flush before remap failed");
            }
        }
        self.capacity = 0;

        self.file.set_len(new_capacity as u64)?;
        // SAFETY: the file is opened read/write and owned by this buffer; the
        // previous mapping was dropped above, so no other view of it exists here.
        let map = unsafe { MmapMut::map_mut(&self.file) }.map_err(|e| CoreError::MapFailed {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;
        self.map = Some(map);
        self.capacity = new_capacity;

        debug!(
            path = %self.path.display(),
            capacity = new_capacity,
            "mapped buffer reserved"
        );
        Ok(())
    }

    fn header(&self) -> Option<(u32, u32)> {
        let map = self.map.as_ref()?;
        if map.len() < BUFFER_HEADER_LEN {
            return None;
        }
        let magic = u32::from_le_bytes([map[0], map[1], map[2], map[3]]);
        let size = u32::from_le_bytes([map[4], map[5], map[6], map[7]]);
        Some((magic, size))
    }

    fn set_logical_size(&mut self, size: u32) {
        if let Some(map) = self.map.as_mut() {
            map[4..8].copy_from_slice(&size.to_le_bytes());
        }
    }

    fn init_header(&mut self) {
        let usable = self.capacity.saturating_sub(BUFFER_HEADER_LEN);
        match self.header() {
            Some((BUFFER_MAGIC, size)) if size as usize <= usable => {
                if size > 0 {
                    debug!(path = %self.path.display(), size, "mapped buffer holds data from a previous run");
                }
            }
            Some((magic, size)) => {
                if magic != 0 {
                    warn!(
                        path = %self.path.display(),
                        magic = format_args!("{:#x}", magic),
                        size,
                        "corrupt buffer header, reinitializing"
                    );
                }
                if let Some(map) = self.map.as_mut() {
                    map[0..4].copy_from_slice(&BUFFER_MAGIC.to_le_bytes());
                }
                self.set_logical_size(0);
            }
            None => {}
        }
    }

    /// Whether the mapping exists and carries the expected header magic.
    pub fn is_valid(&self) -> bool {
        matches!(self.header(), Some((BUFFER_MAGIC, _)))
    }

    /// Logical size: bytes pushed since the last clear.
    pub fn len(&self) -> usize {
        match self.header() {
            Some((BUFFER_MAGIC, size)) => size as usize,
            _ => 0,
        }
    }

    /// Whether no bytes are buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Physical size of the mapping, header included.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The buffered bytes.
    pub fn data(&self) -> &[u8] {
        let len = self.len();
        match &self.map {
            Some(map) if self.is_valid() => &map[BUFFER_HEADER_LEN..BUFFER_HEADER_LEN + len],
            _ => &[],
        }
    }

    /// Appends `data`, growing the mapping when it does not fit.
    ///
    /// On an invalid mapping nothing is written and the error is logged.
    pub fn push(&mut self, data: &[u8]) -> CoreResult<()> {
        if !self.is_valid() {
            error!(
                path = %self.path.display(),
                bytes = data.len(),
                "push on invalid mapping, data dropped"
            );
            return Err(CoreError::InvalidMapping);
        }

        let len = self.len();
        let new_len = len + data.len();
        if new_len > u32::MAX as usize {
            return Err(CoreError::BufferOverflow {
                requested: new_len as u64,
                limit: u32::MAX as u64,
            });
        }

        self.reserve(BUFFER_HEADER_LEN + new_len)?;
        let map = self.map.as_mut().ok_or(CoreError::InvalidMapping)?;
        map[BUFFER_HEADER_LEN + len..BUFFER_HEADER_LEN + new_len].copy_from_slice(data);
        self.set_logical_size(new_len as u32);
        Ok(())
    }

    /// Resets the logical size to zero. Capacity is retained.
    pub fn clear(&mut self) {
        if self.is_valid() {
            self.set_logical_size(0);
        }
    }

    /// Fill level: logical size over usable capacity.
    pub fn ratio(&self) -> f64 {
        let usable = self.capacity.saturating_sub(BUFFER_HEADER_LEN);
        if usable == 0 || !self.is_valid() {
            return 0.0;
        }
        self.len() as f64 / usable as f64
    }

    /// Synchronously writes dirty pages back to the backing file.
    pub fn sync(&self) -> CoreResult<()> {
        if let Some(map) = &self.map {
            map.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    fn open_in(dir: &TempDir, name: &str) -> MappedBuffer {
        MappedBuffer::open(dir.path().join(name)).unwrap()
    }

    #[test]
    fn test_new_buffer_uses_default_floor() {
        let dir = TempDir::new().unwrap();
        let buf = open_in(&dir, "a.mmap");
        assert!(buf.is_valid());
        assert!(buf.is_empty());
        assert!(buf.capacity() >= DEFAULT_BUFFER_CAPACITY);
        assert_eq!(buf.capacity() % page_size(), 0);
        let on_disk = std::fs::metadata(dir.path().join("a.mmap")).unwrap().len();
        assert_eq!(on_disk as usize, buf.capacity());
    }

    #[test]
    fn test_push_and_data() {
        let dir = TempDir::new().unwrap();
        let mut buf = open_in(&dir, "a.mmap");
        buf.push(b"hello ").unwrap();
        buf.push(b"world").unwrap();
        assert_eq!(buf.len(), 11);
        assert_eq!(buf.data(), b"hello world");
    }

    #[test]
    fn test_clear_keeps_capacity() {
        let dir = TempDir::new().unwrap();
        let mut buf = MappedBuffer::open_with_capacity(dir.path().join("a.mmap"), 4096).unwrap();
        buf.push(&vec![7u8; 20_000]).unwrap();
        let grown = buf.capacity();
        assert!(grown >= 20_000 + BUFFER_HEADER_LEN);
        buf.clear();
        assert!(buf.is_empty());
        assert_eq!(buf.capacity(), grown);
        assert!(buf.data().is_empty());
    }

    #[test]
    fn test_growth_preserves_content() {
        let dir = TempDir::new().unwrap();
        let mut buf = MappedBuffer::open_with_capacity(dir.path().join("a.mmap"), 4096).unwrap();
        let first: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
        buf.push(&first).unwrap();
        let second = vec![0xabu8; 10_000];
        buf.push(&second).unwrap();
        assert_eq!(&buf.data()[..first.len()], first.as_slice());
        assert_eq!(&buf.data()[first.len()..], second.as_slice());
    }

    #[test]
    fn test_reopen_keeps_pushed_bytes() {
        let dir = TempDir::new().unwrap();
        {
            let mut buf = open_in(&dir, "a.mmap");
            buf.push(b"survives restart").unwrap();
            buf.sync().unwrap();
        }
        let buf = open_in(&dir, "a.mmap");
        assert_eq!(buf.data(), b"survives restart");
    }

    #[test]
    fn test_corrupt_magic_reinitializes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.mmap");
        std::fs::write(&path, vec![0xffu8; 8192]).unwrap();
        let buf = MappedBuffer::open(&path).unwrap();
        assert!(buf.is_valid());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_oversized_logical_size_reinitializes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.mmap");
        let mut raw = vec![0u8; 4096];
        raw[0..4].copy_from_slice(&BUFFER_MAGIC.to_le_bytes());
        raw[4..8].copy_from_slice(&u32::MAX.to_le_bytes());
        std::fs::write(&path, raw).unwrap();
        let buf = MappedBuffer::open_with_capacity(&path, 4096).unwrap();
        assert!(buf.is_empty());
    }

    #[test]
    fn test_ratio() {
        let dir = TempDir::new().unwrap();
        let mut buf = MappedBuffer::open_with_capacity(dir.path().join("a.mmap"), 4096).unwrap();
        assert_eq!(buf.ratio(), 0.0);
        let usable = buf.capacity() - BUFFER_HEADER_LEN;
        buf.push(&vec![1u8; usable / 2]).unwrap();
        assert!((buf.ratio() - 0.5).abs() < 0.01);
        buf.push(&vec![1u8; usable - usable / 2]).unwrap();
        assert!((buf.ratio() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_reserve_is_page_aligned_and_idempotent() {
        let dir = TempDir::new().unwrap();
        let mut buf = open_in(&dir, "a.mmap");
        let before = buf.capacity();
        buf.reserve(before - 1).unwrap();
        assert_eq!(buf.capacity(), before);
        buf.reserve(before + 1).unwrap();
        assert_eq!(buf.capacity(), before + page_size());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_size_tracks_pushes(chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..6000), 1..20)) {
            let dir = TempDir::new().unwrap();
            let mut buf = MappedBuffer::open_with_capacity(dir.path().join("p.mmap"), 4096).unwrap();
            let mut expected = 0usize;
            let mut last_capacity = buf.capacity();
            for chunk in &chunks {
                buf.push(chunk).unwrap();
                expected += chunk.len();
                prop_assert_eq!(buf.len(), expected);
                prop_assert_eq!(buf.capacity() % page_size(), 0);
                prop_assert!(buf.capacity() >= last_capacity);
                prop_assert!(buf.capacity() >= expected + BUFFER_HEADER_LEN);
                last_capacity = buf.capacity();
            }
            let joined: Vec<u8> = chunks.concat();
            prop_assert_eq!(buf.data(), joined.as_slice());
        }
    }
}
