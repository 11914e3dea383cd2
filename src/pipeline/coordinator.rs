use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::application::config::configuration::Configuration;
use crate::indexes::store::{Batch, Document, IndexStats, IndexStore};
use crate::tree::Folder;

use super::processor::FileProcessor;
use super::watcher::{ChangeCallbacks, FileWatcher};

/// One unit of pipeline input: a path and what happened to it. Produced by
/// the initial scan trigger and by watcher callbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkItem {
    Create(PathBuf),
    Update(PathBuf),
    Delete(PathBuf),
}

pub type CompletionCallback = Box<dyn Fn() + Send + Sync>;

/// Scan bookkeeping shared between the coordinator handle and its workers.
///
/// `pending_work` counts documents emitted into the pipeline but not yet
/// committed; zero means everything produced so far is durable. The epoch
/// ticks on every `initial_scan` so workers discard quiet-tick streaks that
/// started under a previous scan.
struct ScanState {
    pending_work: AtomicI64,
    epoch: AtomicU64,
    completed: AtomicBool,
    done: Notify,
    on_complete: Mutex<Option<CompletionCallback>>,
}

impl Default for ScanState {
    fn default() -> Self {
        Self {
            pending_work: AtomicI64::new(0),
            epoch: AtomicU64::new(0),
            // nothing to complete until the first scan is requested
            completed: AtomicBool::new(true),
            done: Notify::new(),
            on_complete: Mutex::new(None),
        }
    }
}

/// Per-index orchestration: owns the pipeline channels, the worker pool, the
/// watcher and the folder tree, and routes filesystem changes into the index.
pub struct Coordinator {
    store: Arc<IndexStore>,
    watcher: Arc<FileWatcher>,
    work_tx: flume::Sender<WorkItem>,
    cancel: watch::Sender<bool>,
    scan: Arc<ScanState>,
    tree: Arc<Mutex<Folder>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Coordinator {
    /// Wire up channels, spawn the worker pool and hook the watcher into the
    /// work channel. The pipeline is idle until work arrives.
    pub fn new(store: Arc<IndexStore>, config: &Configuration) -> anyhow::Result<Arc<Self>> {
        let buffer = config.channel_buffer_size.max(1);
        let (work_tx, work_rx) = flume::bounded::<WorkItem>(buffer * 2);
        let (file_tx, file_rx) = flume::bounded::<PathBuf>(buffer * 4);
        let (doc_tx, doc_rx) = flume::bounded::<Document>(buffer);
        let (dir_tx, dir_rx) = flume::bounded::<PathBuf>(4);
        let (cancel, cancel_rx) = watch::channel(false);

        let processor = Arc::new(FileProcessor::new(
            store.extensions()?,
            config.read_chunk_size,
            config.max_file_size,
        ));

        let watcher = {
            let deletes = work_tx.clone();
            let updates = work_tx.clone();
            let creates = work_tx.clone();
            Arc::new(FileWatcher::new(
                ChangeCallbacks {
                    on_delete: Box::new(move |path| forward(&deletes, WorkItem::Delete(path))),
                    on_update: Box::new(move |path| forward(&updates, WorkItem::Update(path))),
                    on_create: Box::new(move |path| forward(&creates, WorkItem::Create(path))),
                },
                config.debounce_window(),
            )?)
        };

        let scan = Arc::new(ScanState::default());
        let tree = Arc::new(Mutex::new(Folder::root()));

        let mut workers = Vec::new();
        workers.push(tokio::spawn(dispatch_work(
            Arc::clone(&store),
            work_rx,
            file_tx.clone(),
            cancel_rx.clone(),
        )));

        let pool_half = (config.worker_count / 2).max(1);
        for _ in 0..pool_half {
            workers.push(tokio::spawn(read_files(
                Arc::clone(&processor),
                file_rx.clone(),
                file_tx.clone(),
                doc_tx.clone(),
                dir_tx.clone(),
                Arc::clone(&scan),
                cancel_rx.clone(),
            )));
        }
        for _ in 0..pool_half {
            workers.push(tokio::spawn(index_documents(
                Arc::clone(&store),
                doc_rx.clone(),
                Arc::clone(&scan),
                config.batch_memory_limit,
                config.flush_interval(),
                cancel_rx.clone(),
            )));
        }
        workers.push(tokio::spawn(subscribe_dirs(
            Arc::clone(&store),
            Arc::clone(&watcher),
            Arc::clone(&tree),
            dir_rx,
            cancel_rx,
        )));

        Ok(Arc::new(Self {
            store,
            watcher,
            work_tx,
            cancel,
            scan,
            tree,
            workers: Mutex::new(workers),
        }))
    }

    pub fn store(&self) -> Arc<IndexStore> {
        Arc::clone(&self.store)
    }

    /// Kick off a full scan: reset the pending counter and feed the root
    /// through the pipeline as a synthetic create.
    pub async fn initial_scan(&self, path: &Path) {
        self.scan.pending_work.store(0, Ordering::SeqCst);
        self.scan.completed.store(false, Ordering::SeqCst);
        self.scan.epoch.fetch_add(1, Ordering::SeqCst);
        if self
            .work_tx
            .send_async(WorkItem::Create(path.to_path_buf()))
            .await
            .is_err()
        {
            warn!(path = %path.display(), "work channel closed, scan not started");
        }
    }

    pub async fn enqueue(&self, item: WorkItem) {
        if self.work_tx.send_async(item).await.is_err() {
            warn!("work channel closed, dropping item");
        }
    }

    /// Store a callback fired once per initial scan, on quiescence. Invoked
    /// from a worker; spurious re-invocation across scans is possible and
    /// the callback must tolerate it.
    pub fn set_on_complete(&self, callback: CompletionCallback) {
        *self
            .scan
            .on_complete
            .lock()
            .expect("completion callback lock poisoned") = Some(callback);
    }

    /// Await quiescence of the current scan.
    pub async fn scan_complete(&self) {
        let notified = self.scan.done.notified();
        tokio::pin!(notified);
        // register before checking the flag: notify_waiters() stores no
        // permit, so the other order can miss a completion forever
        notified.as_mut().enable();
        if self.scan.completed.load(Ordering::SeqCst) {
            return;
        }
        notified.await;
    }

    pub fn start_watching(&self) {
        self.watcher.start();
    }

    /// Watch a directory and record it in the folder tree. The pipeline does
    /// this for every directory it discovers; the registry does it when
    /// re-opening an index.
    pub fn track_dir(&self, dir: &Path) {
        track_dir(&self.store, &self.watcher, &self.tree, dir);
    }

    pub fn folder_tree(&self) -> Folder {
        self.tree.lock().expect("folder tree lock poisoned").clone()
    }

    /// A selected folder (in index-relative form) plus all of its known
    /// descendant directories.
    pub fn expand_dirs(&self, folder: &Path) -> Vec<String> {
        self.tree
            .lock()
            .expect("folder tree lock poisoned")
            .expand(folder)
            .into_iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect()
    }

    pub fn pending_work(&self) -> i64 {
        self.scan.pending_work.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> IndexStats {
        self.store.stats()
    }

    /// Cancel the workers, drain what they own, join them and close the
    /// store. Safe to call once; the coordinator is inert afterwards.
    pub async fn shutdown(&self) {
        info!("coordinator shutting down");
        let _ = self.cancel.send(true);
        let workers: Vec<_> = self
            .workers
            .lock()
            .expect("worker handle lock poisoned")
            .drain(..)
            .collect();
        for result in futures::future::join_all(workers).await {
            if let Err(err) = result {
                error!(%err, "worker panicked during shutdown");
            }
        }
        if let Err(err) = self.store.close() {
            error!(%err, "failed to close index store");
        }
    }
}

fn forward(sender: &flume::Sender<WorkItem>, item: WorkItem) {
    // blocking send: a full work channel is the backpressure path
    if sender.send(item).is_err() {
        debug!("work channel closed, dropping change");
    }
}

fn track_dir(
    store: &IndexStore,
    watcher: &FileWatcher,
    tree: &Mutex<Folder>,
    dir: &Path,
) {
    if let Err(err) = watcher.add(dir) {
        debug!(%err, dir = %dir.display(), "failed to watch directory");
    }
    let rel = store.relative_id(dir);
    tree.lock()
        .expect("folder tree lock poisoned")
        .insert(Path::new(&rel));
}

/// Single dispatcher: deletes go straight to the store, creates and updates
/// to the file channel.
async fn dispatch_work(
    store: Arc<IndexStore>,
    work_rx: flume::Receiver<WorkItem>,
    file_tx: flume::Sender<PathBuf>,
    mut cancel: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = cancel.changed() => return,
            item = work_rx.recv_async() => {
                let Ok(item) = item else { return };
                match item {
                    WorkItem::Delete(path) => {
                        let store = Arc::clone(&store);
                        tokio::spawn(async move {
                            let target = path.clone();
                            match tokio::task::spawn_blocking(move || store.delete_single(&target)).await {
                                Ok(Ok(())) => {}
                                Ok(Err(err)) => warn!(%err, path = %path.display(), "delete failed"),
                                Err(err) => warn!(%err, "delete task failed"),
                            }
                        });
                    }
                    WorkItem::Create(path) | WorkItem::Update(path) => {
                        tokio::select! {
                            _ = cancel.changed() => return,
                            sent = file_tx.send_async(path) => {
                                if sent.is_err() { return; }
                            }
                        }
                    }
                }
            }
        }
    }
}

/// File-reader worker: directories are walked back into the file channel,
/// files are read into documents.
async fn read_files(
    processor: Arc<FileProcessor>,
    file_rx: flume::Receiver<PathBuf>,
    file_tx: flume::Sender<PathBuf>,
    doc_tx: flume::Sender<Document>,
    dir_tx: flume::Sender<PathBuf>,
    scan: Arc<ScanState>,
    mut cancel: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = cancel.changed() => return,
            path = file_rx.recv_async() => {
                let Ok(path) = path else { return };
                tokio::select! {
                    _ = cancel.changed() => return,
                    _ = async {
                        match tokio::fs::metadata(&path).await {
                            Ok(meta) if meta.is_dir() => {
                                processor.walk(&path, &file_tx, &dir_tx).await;
                            }
                            Ok(_) => {
                                processor.read(path, &doc_tx, &scan.pending_work).await;
                            }
                            Err(err) => {
                                debug!(%err, path = %path.display(), "stat failed, skipping");
                            }
                        }
                    } => {}
                }
            }
        }
    }
}

/// Indexer worker: owns one batch, flushing on size or on the ticker, and
/// runs the quiescence check on every tick.
async fn index_documents(
    store: Arc<IndexStore>,
    doc_rx: flume::Receiver<Document>,
    scan: Arc<ScanState>,
    batch_limit: usize,
    flush_interval: Duration,
    mut cancel: watch::Receiver<bool>,
) {
    let mut batch = store.new_batch();
    let mut batch_bytes = 0usize;
    let mut batch_docs = 0i64;
    let mut quiet_ticks = 0u32;
    let mut seen_epoch = scan.epoch.load(Ordering::SeqCst);

    let mut ticker = tokio::time::interval_at(
        tokio::time::Instant::now() + flush_interval,
        flush_interval,
    );
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.changed() => {
                flush_batch(&store, batch, batch_docs, &scan).await;
                return;
            }
            doc = doc_rx.recv_async() => {
                let Ok(doc) = doc else {
                    flush_batch(&store, batch, batch_docs, &scan).await;
                    return;
                };
                batch_bytes += doc.content.len();
                batch_docs += 1;
                store.add(&mut batch, doc);
                if batch_bytes >= batch_limit {
                    batch = flush_batch(&store, batch, batch_docs, &scan).await;
                    batch_bytes = 0;
                    batch_docs = 0;
                }
            }
            _ = ticker.tick() => {
                batch = flush_batch(&store, batch, batch_docs, &scan).await;
                batch_bytes = 0;
                batch_docs = 0;

                let epoch = scan.epoch.load(Ordering::SeqCst);
                if epoch != seen_epoch {
                    seen_epoch = epoch;
                    quiet_ticks = 0;
                    continue;
                }
                if scan.pending_work.load(Ordering::SeqCst) == 0 {
                    quiet_ticks += 1;
                    // two consecutive quiet ticks: nothing was emitted or
                    // staged anywhere in between
                    if quiet_ticks >= 2 && !scan.completed.swap(true, Ordering::SeqCst) {
                        debug!("scan quiescent");
                        scan.done.notify_waiters();
                        let callback = scan
                            .on_complete
                            .lock()
                            .expect("completion callback lock poisoned");
                        if let Some(callback) = callback.as_ref() {
                            callback();
                        }
                    }
                } else {
                    quiet_ticks = 0;
                }
            }
        }
    }
}

/// Commit a batch off the async runtime. The pending counter only moves on a
/// successful commit; a failed one is logged and the documents stay pending
/// until a later event re-stages them.
async fn flush_batch(
    store: &Arc<IndexStore>,
    batch: Batch,
    batch_docs: i64,
    scan: &ScanState,
) -> Batch {
    if batch.is_empty() {
        return batch;
    }
    let committing = Arc::clone(store);
    match tokio::task::spawn_blocking(move || committing.commit(batch)).await {
        Ok(Ok(())) => {
            scan.pending_work.fetch_sub(batch_docs, Ordering::SeqCst);
            debug!(docs = batch_docs, "batch committed");
        }
        Ok(Err(err)) => error!(%err, "batch commit failed"),
        Err(err) => error!(%err, "commit task failed"),
    }
    store.new_batch()
}

/// Dir-subscriber: every directory the walker discovers becomes watched and
/// lands in the folder tree.
async fn subscribe_dirs(
    store: Arc<IndexStore>,
    watcher: Arc<FileWatcher>,
    tree: Arc<Mutex<Folder>>,
    dir_rx: flume::Receiver<PathBuf>,
    mut cancel: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = cancel.changed() => return,
            dir = dir_rx.recv_async() => {
                let Ok(dir) = dir else { return };
                track_dir(&store, &watcher, &tree, &dir);
            }
        }
    }
}
