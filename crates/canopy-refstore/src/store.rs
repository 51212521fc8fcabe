use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, warn};

use canopy_crypto::Keccak256Hasher;
use canopy_types::Hash;

use crate::error::{RefStoreError, RefStoreResult};

const COPY_BUF_SIZE: usize = 32 * 1024;

type Metadata = HashMap<String, BTreeMap<String, String>>;

/// Flat-directory content-addressed blob store.
///
/// Two locks: one for blob files, one for the metadata sidecar. Writers
/// stream through a temp file and a Keccak-256 hasher; the rename to
/// `ref-<hex>` happens only once the hash (and hence the final name) is
/// known.
pub struct RefStore {
    root_path: PathBuf,
    file_mu: Mutex<()>,
    metadata_mu: Mutex<()>,
}

impl RefStore {
    pub fn new(root_path: impl Into<PathBuf>) -> Self {
        Self {
            root_path: root_path.into(),
            file_mu: Mutex::new(()),
            metadata_mu: Mutex::new(()),
        }
    }

    fn ensure_root_path(&self) -> RefStoreResult<()> {
        fs::create_dir_all(&self.root_path)?;
        Ok(())
    }

    fn blob_path(&self, hash: &Hash) -> PathBuf {
        self.root_path.join(format!("ref-{}", hash.to_hex()))
    }

    /// Open a stored blob; returns the reader and its size in bytes.
    pub fn object(&self, hash: &Hash) -> RefStoreResult<(File, u64)> {
        let _guard = self.file_mu.lock().expect("ref store lock poisoned");
        self.ensure_root_path()?;

        let path = self.blob_path(hash);
        let size = fs::metadata(&path)
            .map_err(|_| RefStoreError::NotFound(*hash))?
            .len();
        let file = File::open(&path).map_err(|_| RefStoreError::NotFound(*hash))?;
        Ok((file, size))
    }

    /// Store a blob, hashing on the fly. Returns its content address.
    pub fn store_object(
        &self,
        reader: &mut dyn Read,
        content_type: &str,
    ) -> RefStoreResult<Hash> {
        let _guard = self.file_mu.lock().expect("ref store lock poisoned");
        self.ensure_root_path()?;

        let mut tmp = tempfile::NamedTempFile::new_in(&self.root_path)?;
        let mut hasher = Keccak256Hasher::new();
        let mut buf = [0u8; COPY_BUF_SIZE];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            tmp.write_all(&buf[..n])?;
        }
        tmp.flush()?;

        let hash = hasher.finalize();
        tmp.persist(self.blob_path(&hash))
            .map_err(|e| RefStoreError::Io(e.error))?;

        self.set_content_type(&hash, content_type)?;
        debug!(hash = %hash.short_hex(), content_type, "stored ref");
        Ok(hash)
    }

    pub fn have_object(&self, hash: &Hash) -> bool {
        let _guard = self.file_mu.lock().expect("ref store lock poisoned");
        self.blob_path(hash).exists()
    }

    /// The recorded content type, if any.
    pub fn content_type(&self, hash: &Hash) -> RefStoreResult<Option<String>> {
        let _guard = self.metadata_mu.lock().expect("ref store lock poisoned");
        let metadata = self.read_metadata()?;
        Ok(metadata
            .get(&hash.to_hex())
            .and_then(|entry| entry.get("Content-Type"))
            .cloned())
    }

    fn set_content_type(&self, hash: &Hash, content_type: &str) -> RefStoreResult<()> {
        let _guard = self.metadata_mu.lock().expect("ref store lock poisoned");
        let mut metadata = self.read_metadata()?;
        metadata
            .entry(hash.to_hex())
            .or_default()
            .insert("Content-Type".to_string(), content_type.to_string());

        let path = self.metadata_path();
        let body = serde_json::to_vec(&metadata)
            .map_err(|e| RefStoreError::Metadata(e.to_string()))?;
        fs::write(path, body)?;
        Ok(())
    }

    fn metadata_path(&self) -> PathBuf {
        self.root_path.join("metadata.json")
    }

    fn read_metadata(&self) -> RefStoreResult<Metadata> {
        match fs::read(self.metadata_path()) {
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Metadata::new()),
            Err(err) => Err(err.into()),
            Ok(bytes) if bytes.is_empty() => Ok(Metadata::new()),
            Ok(bytes) => {
                serde_json::from_slice(&bytes).map_err(|e| RefStoreError::Metadata(e.to_string()))
            }
        }
    }

    /// Every blob hash currently in the store.
    pub fn all_hashes(&self) -> RefStoreResult<Vec<Hash>> {
        let _guard = self.file_mu.lock().expect("ref store lock poisoned");
        self.ensure_root_path()?;

        let mut hashes = Vec::new();
        for entry in fs::read_dir(&self.root_path)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(hex) = Path::new(&name)
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix("ref-"))
            else {
                continue;
            };
            match Hash::from_hex(hex) {
                Ok(hash) => hashes.push(hash),
                Err(_) => warn!(file = ?name, "ignoring malformed ref filename"),
            }
        }
        Ok(hashes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_crypto::keccak256;
    use std::io::Cursor;

    fn store() -> (tempfile::TempDir, RefStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = RefStore::new(dir.path().join("refs"));
        (dir, store)
    }

    #[test]
    fn store_then_read_back() {
        let (_dir, store) = store();
        let hash = store
            .store_object(&mut Cursor::new(b"hello world".to_vec()), "text/plain")
            .unwrap();

        let (mut reader, size) = store.object(&hash).unwrap();
        assert_eq!(size, 11);
        let mut contents = Vec::new();
        reader.read_to_end(&mut contents).unwrap();
        assert_eq!(contents, b"hello world");
    }

    #[test]
    fn stored_hash_matches_content_digest() {
        let (_dir, store) = store();
        let hash = store
            .store_object(&mut Cursor::new(b"payload".to_vec()), "application/octet-stream")
            .unwrap();
        assert_eq!(hash, keccak256(b"payload"));

        // Re-reading and re-hashing gives the same address.
        let (mut reader, _) = store.object(&hash).unwrap();
        let mut contents = Vec::new();
        reader.read_to_end(&mut contents).unwrap();
        assert_eq!(keccak256(&contents), hash);
    }

    #[test]
    fn have_object_reflects_presence() {
        let (_dir, store) = store();
        let hash = store
            .store_object(&mut Cursor::new(b"x".to_vec()), "text/plain")
            .unwrap();
        assert!(store.have_object(&hash));
        assert!(!store.have_object(&keccak256(b"absent")));
    }

    #[test]
    fn missing_object_is_not_found() {
        let (_dir, store) = store();
        assert!(matches!(
            store.object(&keccak256(b"nope")),
            Err(RefStoreError::NotFound(_))
        ));
    }

    #[test]
    fn content_type_sidecar() {
        let (_dir, store) = store();
        let h1 = store
            .store_object(&mut Cursor::new(b"a".to_vec()), "text/html")
            .unwrap();
        let h2 = store
            .store_object(&mut Cursor::new(b"b".to_vec()), "image/jpeg")
            .unwrap();

        assert_eq!(store.content_type(&h1).unwrap(), Some("text/html".into()));
        assert_eq!(store.content_type(&h2).unwrap(), Some("image/jpeg".into()));
        assert_eq!(store.content_type(&keccak256(b"zz")).unwrap(), None);
    }

    #[test]
    fn all_hashes_lists_blobs_only() {
        let (_dir, store) = store();
        let h1 = store
            .store_object(&mut Cursor::new(b"one".to_vec()), "text/plain")
            .unwrap();
        let h2 = store
            .store_object(&mut Cursor::new(b"two".to_vec()), "text/plain")
            .unwrap();

        let mut hashes = store.all_hashes().unwrap();
        hashes.sort();
        let mut expected = vec![h1, h2];
        expected.sort();
        assert_eq!(hashes, expected);
    }

    #[test]
    fn storing_identical_content_is_idempotent() {
        let (_dir, store) = store();
        let h1 = store
            .store_object(&mut Cursor::new(b"same".to_vec()), "text/plain")
            .unwrap();
        let h2 = store
            .store_object(&mut Cursor::new(b"same".to_vec()), "text/plain")
            .unwrap();
        assert_eq!(h1, h2);
        assert_eq!(store.all_hashes().unwrap().len(), 1);
    }

    #[test]
    fn concurrent_writers_do_not_corrupt() {
        use std::sync::Arc;
        use std::thread;

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(RefStore::new(dir.path().join("refs")));

        let handles: Vec<_> = (0u8..8)
            .map(|i| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    let body = vec![i; 1000];
                    store
                        .store_object(&mut Cursor::new(body), "application/octet-stream")
                        .unwrap()
                })
            })
            .collect();

        let hashes: Vec<Hash> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for hash in &hashes {
            assert!(store.have_object(hash));
        }
        assert_eq!(store.all_hashes().unwrap().len(), 8);
    }
}
