//! Content-addressed storage for attachment bytes.
//!
//! Blobs are keyed by the hex SHA-256 of their content and sharded by the first two
//! hash characters: `{root}/{hash[0..2]}/{hash}`.

use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;

use sha2::{Digest, Sha256};

#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    pub hash: String,
    pub size: usize,
    /// False when a blob with the same hash was already on disk.
    pub is_new: bool,
}

impl BlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn compute_hash(data: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(data);
        hex::encode(hasher.finalize())
    }

    /// Writes `data` under its hash. Writing the same bytes twice is a no-op.
    pub fn store(&self, data: &[u8]) -> io::Result<StoredBlob> {
        let hash = Self::compute_hash(data);
        let path = self.path_for(&hash);

        if path.exists() {
            return Ok(StoredBlob {
                hash,
                size: data.len(),
                is_new: false,
            });
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Concurrent writers of the same hash race on the rename, and both produce
        // identical final content.
        let temp_path = path.with_extension(format!("{}.tmp", uuid::Uuid::now_v7().simple()));
        let mut file = fs::File::create(&temp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
        fs::rename(&temp_path, &path)?;

        Ok(StoredBlob {
            hash,
            size: data.len(),
            is_new: true,
        })
    }

    pub fn get(&self, hash: &str) -> io::Result<Vec<u8>> {
        fs::read(self.path_for(hash))
    }

    pub fn exists(&self, hash: &str) -> bool {
        self.path_for(hash).exists()
    }

    /// Returns `Ok(false)` when the blob was already absent.
    pub fn delete(&self, hash: &str) -> io::Result<bool> {
        match fs::remove_file(self.path_for(hash)) {
            Ok(()) => Ok(true),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(error) => Err(error),
        }
    }

    pub fn path_for(&self, hash: &str) -> PathBuf {
        if hash.len() < 2 {
            return self.root.join(hash);
        }
        self.root.join(&hash[0..2]).join(hash)
    }
}
