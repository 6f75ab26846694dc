use std::fmt;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use fs2::FileExt as _;

use crate::error::{Error, Result};

/// Exclusive advisory lock on the engine root. Held for the lifetime of
/// the engine; a second `Open` of the same root fails instead of racing
/// the log files.
#[derive(Clone)]
pub struct LockFile {
    path: Arc<Path>,
    #[allow(unused)]
    lock: Arc<File>,
}

impl LockFile {
    pub fn lock(root: &Path) -> Result<Self> {
        let path = root.join("db.lock");
        let lock = File::create(&path).map_err(|e| Error::io("create", &path, e))?;
        lock.try_lock_exclusive().map_err(|e| {
            Error::InvalidArgument(format!(
                "store at {} is already open: {e}",
                root.display()
            ))
        })?;

        Ok(Self {
            path: path.into(),
            lock: lock.into(),
        })
    }
}

impl fmt::Debug for LockFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockFile").field("path", &self.path).finish()
    }
}
