//! Define the on disk layout of a stores home directory.
//!
//! The home directory owns everything: the address array checkpoint (addr.adx), its redo
//! log (addr.rdx) and the data segment files (segs/<id>.seg).

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Contains the paths for all the files in a store.
#[derive(Clone, Debug)]
pub struct StoreFiles {
    /// The directory containing the store.
    home_dir: PathBuf,
}

impl StoreFiles {
    /// Create a new StoreFiles rooted at home_dir.
    pub fn new<P: Into<PathBuf>>(home_dir: P) -> Self {
        StoreFiles {
            home_dir: home_dir.into(),
        }
    }

    /// The home directory of the store.
    pub fn home_dir(&self) -> &Path {
        &self.home_dir
    }

    /// Path to the address array checkpoint file.
    pub fn addr_path(&self) -> PathBuf {
        self.home_dir.join("addr").with_extension("adx")
    }

    /// Path the checkpoint is staged in before being renamed over the live file.
    pub(crate) fn addr_tmp_path(&self) -> PathBuf {
        self.home_dir.join("addr.adx.tmp")
    }

    /// Path to the address array redo log.
    pub fn redo_path(&self) -> PathBuf {
        self.home_dir.join("addr").with_extension("rdx")
    }

    /// Directory holding the data segment files.
    pub fn segs_dir(&self) -> PathBuf {
        self.home_dir.join("segs")
    }

    /// Path of the segment file with the given id.
    pub fn segment_path(&self, id: u32) -> PathBuf {
        self.segs_dir().join(format!("{id}.seg"))
    }

    /// Create the home directory tree.
    pub(crate) fn create_dirs(&self) -> io::Result<()> {
        fs::create_dir_all(self.segs_dir())
    }

    /// Delete the referenced store files and directories if empty.
    /// If it can not remove a file it will silently ignore this.
    pub fn delete(self) {
        let _ = fs::remove_file(self.addr_path());
        let _ = fs::remove_file(self.addr_tmp_path());
        let _ = fs::remove_file(self.redo_path());
        if let Ok(entries) = fs::read_dir(self.segs_dir()) {
            for entry in entries.flatten() {
                let _ = fs::remove_file(entry.path());
            }
        }
        let _ = fs::remove_dir(self.segs_dir());
        let _ = fs::remove_dir(&self.home_dir);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths() {
        let files = StoreFiles::new("/tmp/some_store");
        assert_eq!(files.addr_path(), PathBuf::from("/tmp/some_store/addr.adx"));
        assert_eq!(files.redo_path(), PathBuf::from("/tmp/some_store/addr.rdx"));
        assert_eq!(
            files.segment_path(7),
            PathBuf::from("/tmp/some_store/segs/7.seg")
        );
    }
}
