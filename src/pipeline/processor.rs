use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use ignore::WalkBuilder;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use crate::indexes::store::Document;

/// Free-list of byte buffers. A fixed pool hands out zeroed buffers of one
/// size (read chunks); an elastic pool hands out empty vectors that keep
/// their grown capacity (whole-file accumulators). Both grow to the number
/// of concurrent borrowers and never shrink.
struct BufferPool {
    fixed_len: Option<usize>,
    free: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    fn fixed(len: usize) -> Self {
        Self {
            fixed_len: Some(len),
            free: Mutex::new(Vec::new()),
        }
    }

    fn elastic() -> Self {
        Self {
            fixed_len: None,
            free: Mutex::new(Vec::new()),
        }
    }

    fn get(&self) -> Vec<u8> {
        let pooled = self.free.lock().expect("buffer pool lock poisoned").pop();
        pooled.unwrap_or_else(|| match self.fixed_len {
            Some(len) => vec![0u8; len],
            None => Vec::new(),
        })
    }

    fn put(&self, mut buf: Vec<u8>) {
        if self.fixed_len.is_none() {
            buf.clear();
        }
        self.free.lock().expect("buffer pool lock poisoned").push(buf);
    }
}

/// Walks directory trees and reads files into [`Document`]s, filtering by
/// the index's allowed extensions.
pub struct FileProcessor {
    allowed: BTreeMap<String, bool>,
    chunk_buffers: BufferPool,
    accumulators: BufferPool,
    max_file_size: u64,
}

impl FileProcessor {
    pub fn new(allowed: BTreeMap<String, bool>, chunk_size: usize, max_file_size: u64) -> Self {
        Self {
            allowed,
            chunk_buffers: BufferPool::fixed(chunk_size.max(4096)),
            accumulators: BufferPool::elastic(),
            max_file_size,
        }
    }

    pub fn allows(&self, path: &Path) -> bool {
        extension_of(path)
            .map(|ext| self.allowed.get(&ext).copied().unwrap_or(false))
            .unwrap_or(false)
    }

    /// Traverse the tree under `path`. Every directory (the root included)
    /// goes to `dir_sink`; every allowed file to `file_sink`. Unreadable
    /// entries are logged and skipped.
    pub async fn walk(
        &self,
        path: &Path,
        file_sink: &flume::Sender<PathBuf>,
        dir_sink: &flume::Sender<PathBuf>,
    ) {
        let walker = WalkBuilder::new(path).standard_filters(false).build();
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    debug!(%err, "skipping unreadable entry");
                    continue;
                }
            };
            let is_dir = entry.file_type().map_or(false, |t| t.is_dir());
            let entry_path = entry.into_path();
            if is_dir {
                if dir_sink.send_async(entry_path).await.is_err() {
                    return;
                }
            } else if self.allows(&entry_path) {
                if file_sink.send_async(entry_path).await.is_err() {
                    return;
                }
            }
        }
    }

    /// Read one file into a Document and emit it. The pending counter is
    /// incremented just before emission; a skipped file leaves it untouched.
    pub async fn read(
        &self,
        path: PathBuf,
        doc_sink: &flume::Sender<Document>,
        pending: &AtomicI64,
    ) {
        if !self.allows(&path) {
            debug!(path = %path.display(), "extension not allowed, skipping");
            return;
        }

        let mut file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(err) => {
                warn!(%err, path = %path.display(), "open failed, skipping");
                return;
            }
        };
        let meta = match file.metadata().await {
            Ok(meta) => meta,
            Err(err) => {
                warn!(%err, path = %path.display(), "stat failed, skipping");
                return;
            }
        };
        if self.max_file_size > 0 && meta.len() > self.max_file_size {
            debug!(path = %path.display(), size = meta.len(), "file too large, skipping");
            return;
        }

        let mut chunk = self.chunk_buffers.get();
        let mut content = self.accumulators.get();
        let mut failed = false;
        loop {
            match file.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => content.extend_from_slice(&chunk[..n]),
                Err(err) => {
                    warn!(%err, path = %path.display(), "read failed, skipping");
                    failed = true;
                    break;
                }
            }
        }

        let doc = if failed {
            None
        } else {
            let mod_time = meta
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            Some(Document {
                size: meta.len() as i64,
                mod_time,
                extension: extension_of(&path).unwrap_or_default(),
                content: String::from_utf8_lossy(&content).into_owned(),
                path,
            })
        };

        self.chunk_buffers.put(chunk);
        self.accumulators.put(content);

        let Some(doc) = doc else { return };
        pending.fetch_add(1, Ordering::SeqCst);
        if doc_sink.send_async(doc).await.is_err() {
            pending.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// Lowercase extension including the leading dot, or None for files
/// without one.
pub fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .map(|ext| format!(".{}", ext.to_string_lossy().to_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn allowed() -> BTreeMap<String, bool> {
        BTreeMap::from([
            (".txt".to_owned(), true),
            (".md".to_owned(), true),
            (".tmp".to_owned(), false),
        ])
    }

    #[test]
    fn extension_is_lowercased_and_dotted() {
        assert_eq!(extension_of(Path::new("a/B.TXT")), Some(".txt".to_owned()));
        assert_eq!(extension_of(Path::new("a/b")), None);
    }

    #[test]
    fn disabled_and_unknown_extensions_are_rejected() {
        let processor = FileProcessor::new(allowed(), 1024, 0);
        assert!(processor.allows(Path::new("a.txt")));
        assert!(processor.allows(Path::new("A.MD")));
        assert!(!processor.allows(Path::new("a.tmp")));
        assert!(!processor.allows(Path::new("a.png")));
        assert!(!processor.allows(Path::new("noext")));
    }

    #[test]
    fn buffer_pool_reuses_returned_buffers() {
        let pool = BufferPool::elastic();
        let mut buf = pool.get();
        buf.extend_from_slice(b"grown");
        let capacity = buf.capacity();
        pool.put(buf);

        let buf = pool.get();
        assert!(buf.is_empty());
        assert_eq!(buf.capacity(), capacity);
    }

    #[tokio::test]
    async fn walk_emits_dirs_and_filtered_files() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("docs");
        fs::create_dir_all(root.join("sub")).unwrap();
        fs::write(root.join("a.txt"), "hello").unwrap();
        fs::write(root.join("c.png"), "binary").unwrap();
        fs::write(root.join("sub/b.md"), "world").unwrap();

        let processor = FileProcessor::new(allowed(), 1024, 0);
        let (file_tx, file_rx) = flume::unbounded();
        let (dir_tx, dir_rx) = flume::unbounded();
        processor.walk(&root, &file_tx, &dir_tx).await;
        drop((file_tx, dir_tx));

        let mut files: Vec<_> = file_rx.drain().collect();
        files.sort();
        assert_eq!(files, vec![root.join("a.txt"), root.join("sub/b.md")]);

        let mut dirs: Vec<_> = dir_rx.drain().collect();
        dirs.sort();
        assert_eq!(dirs, vec![root.clone(), root.join("sub")]);
    }

    #[tokio::test]
    async fn read_emits_document_and_increments_pending() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("a.txt");
        fs::write(&file, "hello world").unwrap();

        let processor = FileProcessor::new(allowed(), 4, 0);
        let (doc_tx, doc_rx) = flume::unbounded();
        let pending = AtomicI64::new(0);

        processor.read(file.clone(), &doc_tx, &pending).await;

        assert_eq!(pending.load(Ordering::SeqCst), 1);
        let doc = doc_rx.try_recv().unwrap();
        assert_eq!(doc.path, file);
        assert_eq!(doc.content, "hello world");
        assert_eq!(doc.extension, ".txt");
        assert_eq!(doc.size, 11);
    }

    #[tokio::test]
    async fn read_skips_disallowed_missing_and_oversized() {
        let tmp = tempfile::tempdir().unwrap();
        let processor = FileProcessor::new(allowed(), 1024, 4);
        let (doc_tx, doc_rx) = flume::unbounded();
        let pending = AtomicI64::new(0);

        // wrong extension
        let png = tmp.path().join("c.png");
        fs::write(&png, "data").unwrap();
        processor.read(png, &doc_tx, &pending).await;

        // nonexistent
        processor
            .read(tmp.path().join("missing.txt"), &doc_tx, &pending)
            .await;

        // above the size cap
        let big = tmp.path().join("big.txt");
        fs::write(&big, "way past four bytes").unwrap();
        processor.read(big, &doc_tx, &pending).await;

        assert_eq!(pending.load(Ordering::SeqCst), 0);
        assert!(doc_rx.is_empty());
    }
}
