use std::fs::{File, OpenOptions};
use std::io;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};

use memmap2::{MmapMut, MmapOptions};

/// A growable file intended to be mapped into memory and written through
/// directly. Owns the file handle for its entire lifetime; callers get a
/// byte-level view of the current extent through [`Region`].
///
/// Files only ever grow. There is no truncation or compaction at this
/// layer.
pub struct MapFile {
    fd: File,
    path: PathBuf,
    len: u64,
}

impl MapFile {
    /// Opens the file at `path`, creating it if it does not exist. Newly
    /// created files have length zero; callers decide the initial extent.
    ///
    /// # Errors
    ///
    /// Surfaces the underlying I/O error unmodified. Failures at this
    /// layer are not retried.
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<MapFile> {
        let fd = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path.as_ref())?;
        let len = fd.metadata()?.len();
        let path = path.as_ref().canonicalize()?;

        Ok(MapFile { fd, path, len })
    }

    /// Current length of the backing file in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The canonical path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Extends the backing file to `new_len` bytes and returns the
    /// resulting length. The new region reads as zeroes.
    pub fn grow(&mut self, new_len: u64) -> io::Result<u64> {
        // This layer never shrinks a file.
        debug_assert!(new_len >= self.len);
        self.fd.set_len(new_len)?;
        self.len = new_len;
        Ok(self.len)
    }

    /// Maps the file's current full extent into memory.
    pub fn map(&self) -> io::Result<Region> {
        Region::map(&self.fd, self.len as usize)
    }
}

/// A mutable byte view of a mapped file region. Writes land in the page
/// cache immediately; [`Region::sync`] forces them to durable storage.
/// Dropping the region releases the mapping.
///
/// The region assumes exclusive ownership of the backing file: no other
/// mapping or writer may touch the same file while it is alive.
pub struct Region {
    map: MmapMut,
}

impl Region {
    /// Maps exactly `len` bytes of `file` starting at offset zero.
    pub fn map(file: &File, len: usize) -> io::Result<Region> {
        let map = unsafe { MmapOptions::new().len(len).map_mut(file)? };
        Ok(Region { map })
    }

    /// Flushes the mapped bytes to durable storage.
    pub fn sync(&self) -> io::Result<()> {
        self.map.flush()
    }

    /// Length of the mapped region in bytes.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.len() == 0
    }
}

impl Deref for Region {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.map
    }
}

impl DerefMut for Region {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_creates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.bin");

        let mf = MapFile::open(&path).expect("failed to create backing file");
        assert_eq!(mf.len(), 0);
        assert!(mf.is_empty());
        assert!(path.exists());
    }

    #[test]
    fn open_reports_existing_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.bin");
        std::fs::write(&path, vec![0xAA; 512]).unwrap();

        let mf = MapFile::open(&path).unwrap();
        assert_eq!(mf.len(), 512);
    }

    #[test]
    fn grow_extends_and_zero_fills() {
        let dir = tempfile::tempdir().unwrap();
        let mut mf = MapFile::open(dir.path().join("store.bin")).unwrap();

        assert_eq!(mf.grow(4096).unwrap(), 4096);

        let region = mf.map().unwrap();
        assert_eq!(region.len(), 4096);
        assert!(region.iter().all(|&b| b == 0));
    }

    #[test]
    fn mapped_writes_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.bin");

        {
            let mut mf = MapFile::open(&path).unwrap();
            mf.grow(4096).unwrap();
            let mut region = mf.map().unwrap();
            region[0] = 0x55;
            region[4095] = 0x7F;
            region.sync().unwrap();
        }

        let mf = MapFile::open(&path).unwrap();
        assert_eq!(mf.len(), 4096);
        let region = mf.map().unwrap();
        assert_eq!(region[0], 0x55);
        assert_eq!(region[4095], 0x7F);
    }

    #[test]
    fn remap_after_grow_sees_new_extent() {
        let dir = tempfile::tempdir().unwrap();
        let mut mf = MapFile::open(dir.path().join("store.bin")).unwrap();
        mf.grow(4096).unwrap();

        let mut region = mf.map().unwrap();
        region[100] = 1;
        drop(region);

        mf.grow(8192).unwrap();
        let region = mf.map().unwrap();
        assert_eq!(region.len(), 8192);
        assert_eq!(region[100], 1);
        assert_eq!(region[8000], 0);
    }
}
