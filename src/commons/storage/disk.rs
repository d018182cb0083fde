//! Filesystem-based storage.

use std::{fs, io};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::ser::Serialize;
use tempfile::NamedTempFile;

use super::Error;


//------------ Constants -----------------------------------------------------

/// The directory under the root that contains temporary files.
const TMP_FILE_DIR: &str = ".tmp";

/// The directory under the root that contains the lock files.
const LOCK_FILE_DIR: &str = ".locks";

/// The name of the lock file for a namespace.
const LOCK_FILE_NAME: &str = "lockfile.lock";


//------------ Store ---------------------------------------------------------

/// A storage backend that uses the filesystem for storing values.
///
/// Each namespace has its own directory under the base directory, with one
/// `<key>.json` file per value. Values are written to `.tmp` first and then
/// renamed into place, so readers never see partial files. Writers take an
/// advisory lock on `.locks/<namespace>/lockfile.lock`.
///
/// Temporary files are created with mode 0600 and keep it after the
/// rename, so private keys are only readable by the daemon's user.
#[derive(Debug)]
pub struct Store {
    root: PathBuf,
    tmp: PathBuf,
    locks: PathBuf,
}

impl Store {
    pub fn new(base: &Path, namespace: &str) -> Result<Self, Error> {
        let root = base.join(namespace);
        let tmp = base.join(TMP_FILE_DIR);
        let locks = base.join(LOCK_FILE_DIR).join(namespace);

        for dir in [&root, &tmp, &locks] {
            fs::create_dir_all(dir).map_err(|err| {
                Error::io(format!("failed to create directory '{}'", dir.display()), err)
            })?;
        }

        Ok(Store { root, tmp, locks })
    }

    fn key_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}.json"))
    }

    fn lock(&self) -> Result<FileLock, Error> {
        FileLock::create(&self.locks)
    }
}


/// # Reading
impl Store {
    pub fn has(&self, key: &str) -> Result<bool, Error> {
        self.key_path(key).try_exists().map_err(|err| {
            Error::io(format!("failed to check existence of key '{key}'"), err)
        })
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, Error> {
        let path = self.key_path(key);
        let file = match File::open(&path) {
            Ok(file) => io::BufReader::new(file),
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(Error::io(format!("failed to open file '{}'", path.display()), err));
            }
        };
        match serde_json::from_reader(file) {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.is_io() => Err(Error::io(
                format!("failed to read stored file '{}'", path.display()),
                err.into(),
            )),
            Err(err) => Err(Error::deserialize(key, err)),
        }
    }

    pub fn keys(&self) -> Result<Vec<String>, Error> {
        let dir = match fs::read_dir(&self.root) {
            Ok(dir) => dir,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(vec![]),
            Err(err) => {
                return Err(Error::io(
                    format!("failed to read directory '{}'", self.root.display()),
                    err,
                ));
            }
        };

        let mut res = vec![];
        for item in dir {
            let item = item.map_err(|err| {
                Error::io(format!("failed to read directory '{}'", self.root.display()), err)
            })?;
            let is_file = item.file_type().map(|t| t.is_file()).unwrap_or(false);
            if !is_file {
                continue;
            }
            if let Some(key) = item
                .file_name()
                .into_string()
                .ok()
                .and_then(|name| name.strip_suffix(".json").map(ToString::to_string))
            {
                res.push(key);
            }
        }
        Ok(res)
    }
}


/// # Writing
impl Store {
    pub fn store<T: Serialize>(&self, key: &str, value: &T) -> Result<(), Error> {
        let mut file_lock = self.lock()?;
        let _write_lock = file_lock.write()?;

        let path = self.key_path(key);

        // Write to a temporary file first to ensure that the file can be
        // written entirely.
        let mut tmp_file = NamedTempFile::new_in(&self.tmp).map_err(|err| {
            Error::io(format!("writing temp file failed for key: '{key}'"), err)
        })?;

        let res = serde_json::to_writer_pretty(&mut io::BufWriter::new(&mut tmp_file), value);
        if let Err(err) = res {
            if err.is_io() {
                return Err(Error::io(
                    format!(
                        "failed to write temp file '{}' for key '{}'",
                        tmp_file.as_ref().display(),
                        key
                    ),
                    err.into(),
                ));
            } else {
                return Err(Error::serialize(key, err));
            }
        }

        tmp_file.persist(&path).map_err(|err| {
            Error::io(
                format!(
                    "failed to rename temp file '{}' to '{}'",
                    err.file.path().display(),
                    path.display()
                ),
                err.error,
            )
        })?;

        Ok(())
    }

    pub fn delete(&self, key: &str) -> Result<(), Error> {
        let mut file_lock = self.lock()?;
        let _write_lock = file_lock.write()?;

        let path = self.key_path(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(Error::io(format!("failed to delete '{}'", path.display()), err)),
        }
    }
}


//------------ FileLock ------------------------------------------------------

struct FileLock {
    lock: fd_lock::RwLock<File>,
}

impl FileLock {
    fn create(dir: &Path) -> Result<Self, Error> {
        let lock_path = dir.join(LOCK_FILE_NAME);
        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&lock_path)
            .map_err(|err| {
                Error::io(format!("failed to open lock file '{}'", lock_path.display()), err)
            })?;

        Ok(FileLock { lock: fd_lock::RwLock::new(lock_file) })
    }

    fn write(&mut self) -> Result<fd_lock::RwLockWriteGuard<'_, File>, Error> {
        self.lock
            .write()
            .map_err(|e| Error::other(format!("Cannot get file lock: {e}")))
    }
}
