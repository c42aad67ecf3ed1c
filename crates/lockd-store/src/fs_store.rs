use crate::{Store, StoreResult, io_error, key::DeviceKey, seal::Sealer, validate_key};
use std::{
    fmt,
    fs::{self, OpenOptions},
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
};

const RECORD_EXT: &str = "rec";

/// Filesystem-backed store rooted at `<root>/records`. Each record is sealed
/// with the device key and replaced atomically (temp file, fsync, rename).
#[derive(Clone)]
pub struct FsStore {
    records_dir: PathBuf,
    sealer: Sealer,
}

impl fmt::Debug for FsStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FsStore")
            .field("records_dir", &self.records_dir)
            .finish()
    }
}

impl FsStore {
    pub fn open(root: impl AsRef<Path>, key: &DeviceKey) -> StoreResult<Self> {
        let records_dir = root.as_ref().join("records");
        fs::create_dir_all(&records_dir).map_err(|e| io_error(&records_dir, e))?;
        Ok(Self {
            records_dir,
            sealer: Sealer::new(key)?,
        })
    }

    pub fn root(&self) -> &Path {
        &self.records_dir
    }

    fn record_path(&self, key: &str) -> PathBuf {
        self.records_dir.join(format!("{key}.{RECORD_EXT}"))
    }

    fn write_atomic(path: &Path, bytes: &[u8]) -> StoreResult<()> {
        let tmp = path.with_extension("tmp");
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp)
                .map_err(|e| io_error(&tmp, e))?;
            file.write_all(bytes).map_err(|e| io_error(&tmp, e))?;
            file.sync_all().map_err(|e| io_error(&tmp, e))?;
        }
        fs::rename(&tmp, path).map_err(|e| io_error(path, e))?;
        Ok(())
    }
}

impl Store for FsStore {
    fn put(&self, key: &str, bytes: &[u8]) -> StoreResult<()> {
        validate_key(key)?;
        let sealed = self.sealer.seal(key, bytes)?;
        Self::write_atomic(&self.record_path(key), &sealed)
    }

    fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        validate_key(key)?;
        let path = self.record_path(key);
        match fs::read(&path) {
            Ok(sealed) => Ok(Some(self.sealer.open(key, &sealed)?)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(io_error(path, err)),
        }
    }

    fn delete(&self, key: &str) -> StoreResult<()> {
        validate_key(key)?;
        let path = self.record_path(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(io_error(path, err)),
        }
    }
}
