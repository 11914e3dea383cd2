use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use tantivy::collector::TopDocs;
use tantivy::directory::{Directory, MmapDirectory};
use tantivy::query::{AllQuery, Query};
use tantivy::schema::Value;
use tantivy::{doc, Index, IndexReader, IndexWriter, ReloadPolicy, Term};
use tracing::debug;

use super::schema::DocFields;

pub const EXTENSIONS_KEY: &str = "__extensions__";
pub const BASE_PATH_KEY: &str = "__base_path__";

/// Memory handed to the tantivy writer for its own segment building.
const WRITER_MEMORY_BUDGET: usize = 50_000_000;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("an index already exists at {0}")]
    AlreadyExists(PathBuf),

    #[error("no index found at {0}")]
    NotFound(PathBuf),

    #[error("index engine error")]
    Engine(#[from] tantivy::TantivyError),

    #[error("index directory error")]
    Directory(#[from] tantivy::directory::error::OpenDirectoryError),

    #[error("index io error")]
    Io(#[from] std::io::Error),

    #[error("descriptor blob {0} is missing or unreadable")]
    Meta(&'static str),
}

/// One file's metadata and contents, as handed to the index. `path` is
/// absolute here; the store keys documents by the path relative to the
/// index base.
#[derive(Debug, Clone)]
pub struct Document {
    pub path: PathBuf,
    pub size: i64,
    pub mod_time: DateTime<Utc>,
    pub extension: String,
    pub content: String,
}

/// A hit coming back out of the index. Contents are not stored, so hits
/// carry metadata only; `path` has been re-absolutized against the index
/// base.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub path: PathBuf,
    pub score: f32,
    pub size: i64,
    pub mod_time: String,
    pub extension: String,
}

#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct IndexStats {
    pub documents_indexed: u64,
    pub bytes_indexed: u64,
}

impl fmt::Display for IndexStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} documents indexed ({} MiB)",
            self.documents_indexed,
            self.bytes_indexed / (1024 * 1024)
        )
    }
}

enum BatchOp {
    Add(Document),
    Delete(String),
}

/// Staged mutations, applied and committed atomically by
/// [`IndexStore::commit`]. Adds are upserts keyed by the document path.
#[derive(Default)]
pub struct Batch {
    ops: Vec<BatchOp>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// A persistent inverted index over one folder tree. Tantivy allows a single
/// writer per index, so all mutations funnel through the writer mutex; reads
/// go through a reader that is reloaded on every commit.
pub struct IndexStore {
    fields: DocFields,
    index: Index,
    reader: IndexReader,
    writer: Mutex<IndexWriter>,
    meta: MmapDirectory,
    base_path: PathBuf,
    stats: Mutex<IndexStats>,
}

impl std::fmt::Debug for IndexStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexStore")
            .field("base_path", &self.base_path)
            .finish()
    }
}

impl IndexStore {
    /// Create a fresh index at `index_path` for the tree rooted at `root`.
    /// Fails if anything already lives at `index_path`.
    pub fn create(
        index_path: &Path,
        root: &Path,
        extensions: &BTreeMap<String, bool>,
    ) -> Result<Self, StoreError> {
        if index_path.exists() {
            return Err(StoreError::AlreadyExists(index_path.to_path_buf()));
        }
        fs::create_dir_all(index_path)?;

        let fields = DocFields::new();
        let index = Index::create_in_dir(index_path, fields.schema.clone())?;
        let meta = MmapDirectory::open(index_path)?;

        let base_path = root.parent().unwrap_or_else(|| Path::new("")).to_path_buf();
        let extensions_blob =
            serde_json::to_vec(extensions).map_err(|_| StoreError::Meta(EXTENSIONS_KEY))?;
        meta.atomic_write(Path::new(EXTENSIONS_KEY), &extensions_blob)?;
        meta.atomic_write(
            Path::new(BASE_PATH_KEY),
            base_path.to_string_lossy().as_bytes(),
        )?;

        Self::assemble(fields, index, meta, base_path)
    }

    /// Open an existing index, reading the base path back from its
    /// descriptor blob.
    pub fn open(index_path: &Path) -> Result<Self, StoreError> {
        if !index_path.exists() {
            return Err(StoreError::NotFound(index_path.to_path_buf()));
        }
        let fields = DocFields::new();
        let index = Index::open_in_dir(index_path)?;
        let meta = MmapDirectory::open(index_path)?;

        let raw = meta
            .atomic_read(Path::new(BASE_PATH_KEY))
            .map_err(|_| StoreError::Meta(BASE_PATH_KEY))?;
        let base_path = PathBuf::from(String::from_utf8_lossy(&raw).into_owned());

        Self::assemble(fields, index, meta, base_path)
    }

    fn assemble(
        fields: DocFields,
        index: Index,
        meta: MmapDirectory,
        base_path: PathBuf,
    ) -> Result<Self, StoreError> {
        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::OnCommit)
            .try_into()?;
        let writer = index.writer(WRITER_MEMORY_BUDGET)?;

        Ok(Self {
            fields,
            index,
            reader,
            writer: Mutex::new(writer),
            meta,
            base_path,
            stats: Mutex::new(IndexStats::default()),
        })
    }

    pub fn fields(&self) -> &DocFields {
        &self.fields
    }

    pub fn index(&self) -> &Index {
        &self.index
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// The allowed-extension map persisted at creation time.
    pub fn extensions(&self) -> Result<BTreeMap<String, bool>, StoreError> {
        let raw = self.get_meta(EXTENSIONS_KEY)?;
        serde_json::from_slice(&raw).map_err(|_| StoreError::Meta(EXTENSIONS_KEY))
    }

    pub fn get_meta(&self, key: &'static str) -> Result<Vec<u8>, StoreError> {
        self.meta
            .atomic_read(Path::new(key))
            .map_err(|_| StoreError::Meta(key))
    }

    pub fn set_meta(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        Ok(self.meta.atomic_write(Path::new(key), value)?)
    }

    /// The document id for `path`: its path relative to the index base.
    pub fn relative_id(&self, path: &Path) -> String {
        path.strip_prefix(&self.base_path)
            .unwrap_or(path)
            .to_string_lossy()
            .into_owned()
    }

    pub fn new_batch(&self) -> Batch {
        Batch::default()
    }

    /// Stage an upsert keyed by `doc.path`.
    pub fn add(&self, batch: &mut Batch, doc: Document) {
        batch.ops.push(BatchOp::Add(doc));
    }

    /// Stage a point deletion.
    pub fn delete(&self, batch: &mut Batch, path: &Path) {
        batch.ops.push(BatchOp::Delete(self.relative_id(path)));
    }

    /// Delete one document and commit immediately. Used for watcher-driven
    /// removals, which are rare enough not to batch.
    pub fn delete_single(&self, path: &Path) -> Result<(), StoreError> {
        let rel = self.relative_id(path);
        let mut writer = self.writer.lock().expect("index writer lock poisoned");
        writer.delete_term(Term::from_field_text(self.fields.path, &rel));
        writer.commit()?;
        drop(writer);
        self.reader.reload()?;
        debug!(path = %rel, "document deleted");
        Ok(())
    }

    /// Apply a staged batch atomically: deletes and upserts in order, one
    /// engine commit, reader reload, stats update.
    pub fn commit(&self, batch: Batch) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut docs: u64 = 0;
        let mut bytes: u64 = 0;
        {
            let mut writer = self.writer.lock().expect("index writer lock poisoned");
            for op in batch.ops {
                match op {
                    BatchOp::Add(doc) => {
                        let rel = self.relative_id(&doc.path);
                        let dir = Path::new(&rel)
                            .parent()
                            .map(|p| p.to_string_lossy().into_owned())
                            .unwrap_or_default();
                        docs += 1;
                        bytes += doc.content.len() as u64;

                        writer.delete_term(Term::from_field_text(self.fields.path, &rel));
                        writer.add_document(doc!(
                            self.fields.path => rel,
                            self.fields.dir => dir,
                            self.fields.size => doc.size,
                            self.fields.mod_time =>
                                tantivy::DateTime::from_timestamp_secs(doc.mod_time.timestamp()),
                            self.fields.extension => doc.extension,
                            self.fields.content => doc.content,
                        ))?;
                    }
                    BatchOp::Delete(rel) => {
                        writer.delete_term(Term::from_field_text(self.fields.path, &rel));
                    }
                }
            }
            writer.commit()?;
        }
        self.reader.reload()?;
        self.record_commit(docs, bytes);
        Ok(())
    }

    /// Run a query and read hits back out, re-absolutizing each path.
    pub fn search(&self, query: &dyn Query, limit: usize) -> Result<Vec<SearchHit>, StoreError> {
        let searcher = self.reader.searcher();
        let top = searcher.search(query, &TopDocs::with_limit(limit.max(1)))?;

        let mut hits = Vec::with_capacity(top.len());
        for (score, addr) in top {
            let doc = searcher.doc(addr)?;
            let Some(rel) = doc.get_first(self.fields.path).and_then(Value::as_text) else {
                continue;
            };
            let size = doc
                .get_first(self.fields.size)
                .and_then(Value::as_i64)
                .unwrap_or_default();
            let mod_time = doc
                .get_first(self.fields.mod_time)
                .and_then(Value::as_date)
                .and_then(|d| DateTime::<Utc>::from_timestamp(d.into_timestamp_secs(), 0))
                .map(|d| d.to_rfc3339_opts(SecondsFormat::Secs, true))
                .unwrap_or_default();
            let extension = doc
                .get_first(self.fields.extension)
                .and_then(Value::as_text)
                .unwrap_or_default()
                .to_owned();

            hits.push(SearchHit {
                path: self.base_path.join(rel),
                score,
                size,
                mod_time,
                extension,
            });
        }
        Ok(hits)
    }

    /// Every relative document id in the index. Drives folder-tree rebuilds
    /// on startup.
    pub fn all_paths(&self) -> Result<Vec<String>, StoreError> {
        let searcher = self.reader.searcher();
        let count = searcher.num_docs() as usize;
        let top = searcher.search(&AllQuery, &TopDocs::with_limit(count.max(1)))?;

        let mut paths = Vec::with_capacity(top.len());
        for (_, addr) in top {
            let doc = searcher.doc(addr)?;
            if let Some(rel) = doc.get_first(self.fields.path).and_then(Value::as_text) {
                paths.push(rel.to_owned());
            }
        }
        Ok(paths)
    }

    pub fn doc_count(&self) -> u64 {
        self.reader.searcher().num_docs()
    }

    fn record_commit(&self, docs: u64, bytes: u64) {
        let mut stats = self.stats.lock().expect("stats lock poisoned");
        stats.documents_indexed += docs;
        stats.bytes_indexed += bytes;
    }

    pub fn stats(&self) -> IndexStats {
        *self.stats.lock().expect("stats lock poisoned")
    }

    /// Flush any buffered writer state. Dropping the store releases the rest.
    pub fn close(&self) -> Result<(), StoreError> {
        let mut writer = self.writer.lock().expect("index writer lock poisoned");
        writer.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tantivy::query::TermQuery;
    use tantivy::schema::IndexRecordOption;

    fn extensions() -> BTreeMap<String, bool> {
        BTreeMap::from([(".txt".to_owned(), true), (".md".to_owned(), true)])
    }

    fn doc(path: &str, content: &str) -> Document {
        Document {
            path: PathBuf::from(path),
            size: content.len() as i64,
            mod_time: Utc::now(),
            extension: ".txt".to_owned(),
            content: content.to_owned(),
        }
    }

    fn path_query(store: &IndexStore, rel: &str) -> TermQuery {
        TermQuery::new(
            Term::from_field_text(store.fields().path, rel),
            IndexRecordOption::Basic,
        )
    }

    #[test]
    fn create_then_open_round_trips_descriptor() {
        let tmp = tempfile::tempdir().unwrap();
        let index_path = tmp.path().join("index/docs");
        let root = tmp.path().join("docs");

        let store = IndexStore::create(&index_path, &root, &extensions()).unwrap();
        assert_eq!(store.base_path(), tmp.path());
        drop(store);

        let store = IndexStore::open(&index_path).unwrap();
        assert_eq!(store.base_path(), tmp.path());
        assert_eq!(store.extensions().unwrap(), extensions());
    }

    #[test]
    fn create_refuses_existing_index() {
        let tmp = tempfile::tempdir().unwrap();
        let index_path = tmp.path().join("index/docs");
        let root = tmp.path().join("docs");

        IndexStore::create(&index_path, &root, &extensions()).unwrap();
        let err = IndexStore::create(&index_path, &root, &extensions()).unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
    }

    #[test]
    fn open_missing_index_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let err = IndexStore::open(&tmp.path().join("index/none")).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn commit_makes_documents_searchable_with_absolute_paths() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("docs");
        let store =
            IndexStore::create(&tmp.path().join("index/docs"), &root, &extensions()).unwrap();

        let mut batch = store.new_batch();
        store.add(&mut batch, doc(&root.join("a.txt").to_string_lossy(), "hello"));
        store.commit(batch).unwrap();

        let hits = store.search(&path_query(&store, "docs/a.txt"), 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].path, root.join("a.txt"));
        assert_eq!(hits[0].extension, ".txt");
        assert_eq!(hits[0].size, 5);
    }

    #[test]
    fn repeated_add_keeps_one_document_per_path() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("docs");
        let store =
            IndexStore::create(&tmp.path().join("index/docs"), &root, &extensions()).unwrap();
        let file = root.join("a.txt");

        for content in ["one", "two", "three"] {
            let mut batch = store.new_batch();
            store.add(&mut batch, doc(&file.to_string_lossy(), content));
            store.commit(batch).unwrap();
        }

        assert_eq!(store.doc_count(), 1);
        let hits = store.search(&path_query(&store, "docs/a.txt"), 10).unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn delete_single_removes_the_document() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("docs");
        let store =
            IndexStore::create(&tmp.path().join("index/docs"), &root, &extensions()).unwrap();
        let file = root.join("a.txt");

        let mut batch = store.new_batch();
        store.add(&mut batch, doc(&file.to_string_lossy(), "hello"));
        store.commit(batch).unwrap();
        assert_eq!(store.doc_count(), 1);

        store.delete_single(&file).unwrap();
        assert_eq!(store.doc_count(), 0);
        assert!(store
            .search(&path_query(&store, "docs/a.txt"), 10)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn batched_deletes_apply_with_the_commit() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("docs");
        let store =
            IndexStore::create(&tmp.path().join("index/docs"), &root, &extensions()).unwrap();

        let mut batch = store.new_batch();
        store.add(&mut batch, doc(&root.join("a.txt").to_string_lossy(), "one"));
        store.add(&mut batch, doc(&root.join("b.txt").to_string_lossy(), "two"));
        store.commit(batch).unwrap();
        assert_eq!(store.doc_count(), 2);

        let mut batch = store.new_batch();
        store.delete(&mut batch, &root.join("a.txt"));
        store.commit(batch).unwrap();

        assert_eq!(store.doc_count(), 1);
        assert!(store
            .search(&path_query(&store, "docs/a.txt"), 10)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn meta_blobs_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let store = IndexStore::create(
            &tmp.path().join("index/docs"),
            &tmp.path().join("docs"),
            &extensions(),
        )
        .unwrap();

        store.set_meta("__custom__", b"payload").unwrap();
        assert_eq!(store.get_meta("__custom__").unwrap(), b"payload");
        assert!(store.get_meta("__absent__").is_err());
    }

    #[test]
    fn all_paths_lists_every_document() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("docs");
        let store =
            IndexStore::create(&tmp.path().join("index/docs"), &root, &extensions()).unwrap();

        let mut batch = store.new_batch();
        store.add(&mut batch, doc(&root.join("a.txt").to_string_lossy(), "x"));
        store.add(
            &mut batch,
            doc(&root.join("sub/b.txt").to_string_lossy(), "y"),
        );
        store.commit(batch).unwrap();

        let mut paths = store.all_paths().unwrap();
        paths.sort();
        assert_eq!(paths, vec!["docs/a.txt", "docs/sub/b.txt"]);
    }
}
