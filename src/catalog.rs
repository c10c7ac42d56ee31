//! System catalog
//!
//! A small text file (`sc.txt`) in the store directory recording the paths
//! of the index and data files, plus a reserved line for checkpoint
//! bookkeeping.

use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use crate::common::{KvError, Result};

const CATALOG_FILE: &str = "sc.txt";
const INDEX_FILE: &str = "index.bin";
const DATA_FILE: &str = "data.bin";

/// Paths of the files backing one store.
pub struct Catalog {
    index_path: PathBuf,
    data_path: PathBuf,
}

impl Catalog {
    /// Write a fresh catalog into `dir`, creating the directory if needed.
    pub fn create<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let index_path = dir.join(INDEX_FILE);
        let data_path = dir.join(DATA_FILE);

        let mut file = fs::File::create(dir.join(CATALOG_FILE))?;
        writeln!(file, "{}", index_path.display())?;
        writeln!(file, "{}", data_path.display())?;
        writeln!(file, "checkpoint000")?;
        Ok(Self {
            index_path,
            data_path,
        })
    }

    /// Read an existing catalog from `dir`.
    pub fn load<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let file = fs::File::open(dir.as_ref().join(CATALOG_FILE))?;
        let mut lines = BufReader::new(file).lines();
        let mut next = || -> Result<PathBuf> {
            match lines.next() {
                Some(line) => Ok(PathBuf::from(line?)),
                None => Err(KvError::Io(std::io::Error::other(
                    "catalog is missing a file path",
                ))),
            }
        };
        let index_path = next()?;
        let data_path = next()?;
        Ok(Self {
            index_path,
            data_path,
        })
    }

    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    pub fn data_path(&self) -> &Path {
        &self.data_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_create_then_load() {
        let dir = TempDir::new().unwrap();
        let created = Catalog::create(dir.path()).unwrap();
        let loaded = Catalog::load(dir.path()).unwrap();
        assert_eq!(created.index_path(), loaded.index_path());
        assert_eq!(created.data_path(), loaded.data_path());
        assert!(loaded.index_path().ends_with("index.bin"));
        assert!(loaded.data_path().ends_with("data.bin"));
    }

    #[test]
    fn test_load_missing_catalog_fails() {
        let dir = TempDir::new().unwrap();
        assert!(Catalog::load(dir.path()).is_err());
    }
}
