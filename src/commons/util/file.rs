use std::fs;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::Path;

use log::trace;
use tempfile::NamedTempFile;

use crate::commons::error::CustodyIoError;

pub fn create_dir(dir: &Path) -> Result<(), CustodyIoError> {
    if !dir.is_dir() {
        fs::create_dir_all(dir)
            .map_err(|e| CustodyIoError::new(format!("could not create dir: {}", dir.to_string_lossy()), e))?;
    }
    Ok(())
}

/// Reads a file, returning `None` if it does not exist.
pub fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, CustodyIoError> {
    let mut f = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(CustodyIoError::new(format!("Could not open: '{}'", path.to_string_lossy()), e)),
    };
    let mut bytes = Vec::new();
    f.read_to_end(&mut bytes)
        .map_err(|e| CustodyIoError::new(format!("Could not read: {}", path.to_string_lossy()), e))?;
    Ok(Some(bytes))
}

/// Replaces the file at `path` with `content` in one rename.
///
/// The new file gets `mode` (unix only) before it becomes visible, so a
/// private key is never briefly world readable.
pub fn save_atomic(content: &[u8], path: &Path, mode: Option<u32>) -> Result<(), CustodyIoError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    create_dir(parent)?;

    let mut tmp = NamedTempFile::new_in(parent)
        .map_err(|e| CustodyIoError::new(format!("Could not create temp file in: {}", parent.to_string_lossy()), e))?;
    tmp.write_all(content)
        .map_err(|e| CustodyIoError::new(format!("Could not write to: {}", tmp.path().to_string_lossy()), e))?;

    #[cfg(unix)]
    if let Some(mode) = mode {
        use std::os::unix::fs::PermissionsExt;
        tmp.as_file()
            .set_permissions(fs::Permissions::from_mode(mode))
            .map_err(|e| CustodyIoError::new(format!("Could not set mode {:o} on: {}", mode, path.to_string_lossy()), e))?;
    }
    #[cfg(not(unix))]
    let _ = mode;

    tmp.persist(path)
        .map_err(|e| CustodyIoError::new(format!("Could not save: {}", path.to_string_lossy()), e.error))?;

    trace!("Saved file: {}", path.to_string_lossy());
    Ok(())
}

/// Deletes a file if it exists.
pub fn delete_file(path: &Path) -> Result<(), CustodyIoError> {
    trace!("Removing file: {}", path.to_string_lossy());
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CustodyIoError::new(format!("Could not remove file: {}", path.to_string_lossy()), e)),
    }
}

/// Opens a file for appending, creating it and its parent dirs as needed.
pub fn open_append(path: &Path) -> Result<File, CustodyIoError> {
    if let Some(parent) = path.parent() {
        create_dir(parent)?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| CustodyIoError::new(format!("Could not open for append: {}", path.to_string_lossy()), e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_atomic_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub/cert.pem");

        assert_eq!(read_optional(&path).unwrap(), None);
        save_atomic(b"one", &path, None).unwrap();
        save_atomic(b"two", &path, Some(0o600)).unwrap();
        assert_eq!(read_optional(&path).unwrap(), Some(b"two".to_vec()));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        delete_file(&path).unwrap();
        delete_file(&path).unwrap();
        assert_eq!(read_optional(&path).unwrap(), None);
    }
}
