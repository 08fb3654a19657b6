use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use super::ObjectStore;
use crate::error::StorageError;

/// Object store rooted at a directory; each bucket is a subdirectory and each
/// key a file inside it. Names are form-urlencoded into file names, so any
/// camera name yields a usable key while `put` still returns the key as given.
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, bucket: &str, key: &str) -> Result<PathBuf, StorageError> {
        Ok(self
            .root
            .join(encode_component(bucket)?)
            .join(encode_component(key)?))
    }
}

impl ObjectStore for FsObjectStore {
    fn put(
        &self,
        bucket: &str,
        key: &str,
        bytes: &[u8],
        _content_type: &str,
    ) -> Result<String, StorageError> {
        let path = self.path_for(bucket, key)?;
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        write_atomic(&path, bytes)?;
        log::debug!("stored {} bytes at {}", bytes.len(), path.display());
        Ok(key.to_string())
    }
}

/// One path component per bucket or key. Separators are percent-encoded and
/// a leading '.' is escaped, so the result never leaves its directory.
fn encode_component(name: &str) -> Result<String, StorageError> {
    if name.is_empty() {
        return Err(StorageError::InvalidKey(name.to_string()));
    }
    let encoded: String = url::form_urlencoded::byte_serialize(name.as_bytes()).collect();
    Ok(match encoded.strip_prefix('.') {
        Some(rest) => format!("%2E{}", rest),
        None => encoded,
    })
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<(), StorageError> {
    // Encoded names never start with '.', so the temp name cannot collide with one.
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp_path = path.with_file_name(format!(".{}.tmp", file_name));
    {
        let mut file = File::create(&tmp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    fs::rename(tmp_path, path)?;
    Ok(())
}
