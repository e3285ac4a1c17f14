//! Where a node keeps its registration between restarts.

use std::path::{Path, PathBuf};

use serbus_proto::RegistrationInfo;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encoding error: {0}")]
    Encoding(#[from] postcard::Error),
}

/// Loads and saves a node's [`RegistrationInfo`].
pub trait RegistrationStore {
    /// The stored record, or [`RegistrationInfo::UNSET`] if there is none.
    fn load(&mut self) -> RegistrationInfo;

    fn save(&mut self, info: &RegistrationInfo) -> Result<(), StoreError>;
}

/// Keeps the record in memory, for tests and simulations.
#[derive(Debug, Clone, Default)]
pub struct MemoryRegistrationStore {
    info: RegistrationInfo,
    saves: usize,
}

impl MemoryRegistrationStore {
    pub const fn new(info: RegistrationInfo) -> Self {
        Self { info, saves: 0 }
    }

    #[inline(always)]
    pub const fn info(&self) -> &RegistrationInfo {
        &self.info
    }

    /// Number of times the record was saved.
    #[inline(always)]
    pub const fn saves(&self) -> usize {
        self.saves
    }
}

impl RegistrationStore for MemoryRegistrationStore {
    fn load(&mut self) -> RegistrationInfo {
        self.info
    }

    fn save(&mut self, info: &RegistrationInfo) -> Result<(), StoreError> {
        self.info = *info;
        self.saves += 1;
        Ok(())
    }
}

/// Keeps the record in a file, encoded with `postcard`.
#[derive(Debug, Clone)]
pub struct FileRegistrationStore {
    path: PathBuf,
}

impl FileRegistrationStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[inline(always)]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn try_load(&self) -> Result<RegistrationInfo, StoreError> {
        let bytes = std::fs::read(&self.path)?;
        Ok(postcard::from_bytes(&bytes)?)
    }
}

impl RegistrationStore for FileRegistrationStore {
    /// A missing or unreadable file yields [`RegistrationInfo::UNSET`].
    fn load(&mut self) -> RegistrationInfo {
        match self.try_load() {
            Ok(info) => info,
            Err(StoreError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("no registration at {}", self.path.display());
                RegistrationInfo::UNSET
            }
            Err(e) => {
                log::warn!("ignoring registration at {}: {e}", self.path.display());
                RegistrationInfo::UNSET
            }
        }
    }

    fn save(&mut self, info: &RegistrationInfo) -> Result<(), StoreError> {
        let bytes = postcard::to_stdvec(info)?;
        std::fs::write(&self.path, bytes)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serbus_proto::Address;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("serbus-{}-{name}", std::process::id()))
    }

    #[test]
    fn file_store_keeps_the_record() {
        let path = temp_path("keeps");
        let info = RegistrationInfo {
            address: Address(0x1234),
            registration_id: 0xDEAD_BEEF,
            network_id: 7,
        };

        FileRegistrationStore::new(&path).save(&info).unwrap();
        assert_eq!(FileRegistrationStore::new(&path).load(), info);

        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn missing_file_is_unset() {
        let mut store = FileRegistrationStore::new(temp_path("missing"));
        assert!(store.load().is_unset());
    }

    #[test]
    fn corrupt_file_is_unset() {
        let path = temp_path("corrupt");
        std::fs::write(&path, [0xFF]).unwrap();

        assert!(FileRegistrationStore::new(&path).load().is_unset());

        std::fs::remove_file(path).unwrap();
    }
}
