use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use ckdflow_core::error::{Error, Result};

use super::Storage;

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Local filesystem storage rooted at a directory.
#[derive(Debug)]
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .map_err(|e| Error::Storage(format!("mkdir {}: {e}", root.display())))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, key: &str) -> PathBuf {
        self.root.join(key.trim_start_matches('/'))
    }
}

impl Storage for FsStorage {
    fn write(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let p = self.path(key);
        if let Some(parent) = p.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::Storage(format!("mkparent: {e}")))?;
        }
        // Write to a sibling temp file, then rename: readers never observe a
        // partially written payload.
        let tmp = p.with_extension(format!(
            "tmp-{}-{}",
            std::process::id(),
            TMP_SEQ.fetch_add(1, Ordering::Relaxed)
        ));
        let mut f = File::create(&tmp).map_err(|e| Error::Storage(format!("create: {e}")))?;
        f.write_all(bytes)
            .map_err(|e| Error::Storage(format!("write: {e}")))?;
        f.sync_all()
            .map_err(|e| Error::Storage(format!("sync: {e}")))?;
        fs::rename(&tmp, &p).map_err(|e| Error::Storage(format!("rename: {e}")))?;
        Ok(())
    }

    fn append(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let p = self.path(key);
        if let Some(parent) = p.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::Storage(format!("mkparent: {e}")))?;
        }
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&p)
            .map_err(|e| Error::Storage(format!("open append: {e}")))?;
        f.write_all(bytes)
            .map_err(|e| Error::Storage(format!("append: {e}")))?;
        f.flush()
            .map_err(|e| Error::Storage(format!("flush: {e}")))?;
        Ok(())
    }

    fn read(&self, key: &str) -> Result<Vec<u8>> {
        let p = self.path(key);
        fs::read(&p).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound(key.to_string()),
            _ => Error::Storage(format!("read {}: {e}", p.display())),
        })
    }

    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.path(key).is_file())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let p = self.path(key);
        if p.exists() {
            fs::remove_file(p).map_err(|e| Error::Storage(format!("delete: {e}")))?;
        }
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut results = Vec::new();
        if !self.root.exists() {
            return Ok(results);
        }

        fn visit_dirs(root: &Path, dir: &Path, results: &mut Vec<String>) -> std::io::Result<()> {
            for entry in fs::read_dir(dir)? {
                let entry = entry?;
                let path = entry.path();
                if path.is_dir() {
                    visit_dirs(root, &path, results)?;
                } else if let Ok(rel) = path.strip_prefix(root) {
                    let key = rel
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/");
                    results.push(key);
                }
            }
            Ok(())
        }

        visit_dirs(&self.root, &self.root, &mut results)
            .map_err(|e| Error::Storage(format!("list: {e}")))?;
        results.retain(|k| k.starts_with(prefix) && !k.contains(".tmp-"));
        results.sort();
        Ok(results)
    }

    fn size(&self, key: &str) -> Result<u64> {
        let meta = fs::metadata(self.path(key)).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound(key.to_string()),
            _ => Error::Storage(format!("size: {e}")),
        })?;
        Ok(meta.len())
    }

    fn location(&self, key: &str) -> String {
        self.path(key).to_string_lossy().to_string()
    }
}
