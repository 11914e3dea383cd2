use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, error};

/// A typed change, produced once the debounce window has settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    Created(PathBuf),
    Updated(PathBuf),
    Deleted(PathBuf),
}

pub type ChangeFn = Box<dyn Fn(PathBuf) + Send + Sync>;

pub struct ChangeCallbacks {
    pub on_delete: ChangeFn,
    pub on_update: ChangeFn,
    pub on_create: ChangeFn,
}

/// Filesystem watcher with debouncing.
///
/// Raw OS events land in a queue; every arrival re-arms an idle timer, and
/// only when the timer expires is the queue drained, classified and
/// dispatched. Editors that write a file several times per save thus cost
/// one reindex, not five. Watches are per-directory and non-recursive; the
/// coordinator adds each directory as the pipeline discovers it.
pub struct FileWatcher {
    watcher: Mutex<RecommendedWatcher>,
    events: flume::Receiver<Event>,
    callbacks: Arc<ChangeCallbacks>,
    debounce: Duration,
    started: AtomicBool,
}

impl FileWatcher {
    pub fn new(callbacks: ChangeCallbacks, debounce: Duration) -> Result<Self, notify::Error> {
        let (tx, rx) = flume::unbounded();
        let watcher =
            notify::recommended_watcher(move |res: Result<Event, notify::Error>| match res {
                Ok(event) => {
                    let _ = tx.send(event);
                }
                Err(err) => error!(%err, "filesystem watcher error"),
            })?;

        Ok(Self {
            watcher: Mutex::new(watcher),
            events: rx,
            callbacks: Arc::new(callbacks),
            debounce,
            started: AtomicBool::new(false),
        })
    }

    /// Begin watching a single directory. Subdirectories are not implied.
    pub fn add(&self, path: &Path) -> Result<(), notify::Error> {
        self.watcher
            .lock()
            .expect("watcher lock poisoned")
            .watch(path, RecursiveMode::NonRecursive)
    }

    /// Begin event delivery. The debounce loop runs on its own thread and
    /// exits when the watcher is dropped.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let events = self.events.clone();
        let callbacks = Arc::clone(&self.callbacks);
        let debounce = self.debounce;
        thread::Builder::new()
            .name("watch-debounce".to_owned())
            .spawn(move || debounce_loop(events, callbacks, debounce))
            .expect("failed to spawn watcher thread");
    }
}

fn debounce_loop(
    events: flume::Receiver<Event>,
    callbacks: Arc<ChangeCallbacks>,
    debounce: Duration,
) {
    let mut queue: Vec<Event> = Vec::new();
    let mut deadline = Instant::now() + debounce;
    loop {
        match events.recv_deadline(deadline) {
            Ok(event) => {
                queue.push(event);
                deadline = Instant::now() + debounce;
            }
            Err(flume::RecvTimeoutError::Timeout) => {
                dispatch(&mut queue, &callbacks);
                deadline = Instant::now() + debounce;
            }
            Err(flume::RecvTimeoutError::Disconnected) => {
                dispatch(&mut queue, &callbacks);
                debug!("watcher closed, debounce loop exiting");
                return;
            }
        }
    }
}

fn dispatch(queue: &mut Vec<Event>, callbacks: &ChangeCallbacks) {
    for change in classify(queue.drain(..)) {
        match change {
            Change::Deleted(path) => (callbacks.on_delete)(path),
            Change::Updated(path) => (callbacks.on_update)(path),
            Change::Created(path) => (callbacks.on_create)(path),
        }
    }
}

/// Collapse a drained event queue into typed changes, in order.
///
/// Rename halves are paired inside the window: a `From` is held until the
/// next `To`, becoming delete(old) + create(new). An unpaired `From` is a
/// plain delete (the file left the watched tree); an unpaired `To` a plain
/// create.
pub(crate) fn classify(events: impl IntoIterator<Item = Event>) -> Vec<Change> {
    let mut changes = Vec::new();
    let mut pending_rename: Option<PathBuf> = None;

    for event in events {
        let mut paths = event.paths.into_iter();
        let Some(path) = paths.next() else {
            continue;
        };
        match event.kind {
            EventKind::Create(_) => changes.push(Change::Created(path)),
            EventKind::Remove(_) => changes.push(Change::Deleted(path)),
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
                if let Some(old) = pending_rename.take() {
                    changes.push(Change::Deleted(old));
                }
                pending_rename = Some(path);
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
                if let Some(old) = pending_rename.take() {
                    changes.push(Change::Deleted(old));
                }
                changes.push(Change::Created(path));
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
                if let Some(new) = paths.next() {
                    changes.push(Change::Deleted(path));
                    changes.push(Change::Created(new));
                }
            }
            EventKind::Modify(_) => changes.push(Change::Updated(path)),
            _ => debug!(?event.kind, "ignoring event"),
        }
    }
    if let Some(old) = pending_rename {
        changes.push(Change::Deleted(old));
    }
    // editors write a file several times per save; only the settled state
    // matters
    changes.dedup();
    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, MetadataKind, RemoveKind};

    fn event(kind: EventKind, paths: &[&str]) -> Event {
        let mut event = Event::new(kind);
        for path in paths {
            event = event.add_path(PathBuf::from(path));
        }
        event
    }

    #[test]
    fn plain_events_map_to_their_callbacks() {
        let changes = classify(vec![
            event(EventKind::Create(CreateKind::File), &["a.txt"]),
            event(
                EventKind::Modify(ModifyKind::Data(DataChange::Content)),
                &["b.txt"],
            ),
            event(EventKind::Remove(RemoveKind::File), &["c.txt"]),
        ]);
        assert_eq!(
            changes,
            vec![
                Change::Created(PathBuf::from("a.txt")),
                Change::Updated(PathBuf::from("b.txt")),
                Change::Deleted(PathBuf::from("c.txt")),
            ]
        );
    }

    #[test]
    fn rename_halves_pair_into_delete_plus_create() {
        let changes = classify(vec![
            event(
                EventKind::Modify(ModifyKind::Name(RenameMode::From)),
                &["old.txt"],
            ),
            event(
                EventKind::Modify(ModifyKind::Name(RenameMode::To)),
                &["new.txt"],
            ),
        ]);
        assert_eq!(
            changes,
            vec![
                Change::Deleted(PathBuf::from("old.txt")),
                Change::Created(PathBuf::from("new.txt")),
            ]
        );
    }

    #[test]
    fn unpaired_rename_from_is_a_delete() {
        let changes = classify(vec![event(
            EventKind::Modify(ModifyKind::Name(RenameMode::From)),
            &["gone.txt"],
        )]);
        assert_eq!(changes, vec![Change::Deleted(PathBuf::from("gone.txt"))]);
    }

    #[test]
    fn unpaired_rename_to_is_a_create() {
        let changes = classify(vec![event(
            EventKind::Modify(ModifyKind::Name(RenameMode::To)),
            &["arrived.txt"],
        )]);
        assert_eq!(changes, vec![Change::Created(PathBuf::from("arrived.txt"))]);
    }

    #[test]
    fn both_halves_in_one_event_split_correctly() {
        let changes = classify(vec![event(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            &["old.txt", "new.txt"],
        )]);
        assert_eq!(
            changes,
            vec![
                Change::Deleted(PathBuf::from("old.txt")),
                Change::Created(PathBuf::from("new.txt")),
            ]
        );
    }

    #[test]
    fn repeated_writes_collapse_to_one_update() {
        let write = || {
            event(
                EventKind::Modify(ModifyKind::Data(DataChange::Content)),
                &["a.txt"],
            )
        };
        let changes = classify(vec![write(), write(), write()]);
        assert_eq!(changes, vec![Change::Updated(PathBuf::from("a.txt"))]);
    }

    #[test]
    fn metadata_changes_count_as_updates_and_access_is_ignored() {
        let changes = classify(vec![
            event(
                EventKind::Modify(ModifyKind::Metadata(MetadataKind::WriteTime)),
                &["a.txt"],
            ),
            event(EventKind::Access(notify::event::AccessKind::Any), &["a.txt"]),
        ]);
        assert_eq!(changes, vec![Change::Updated(PathBuf::from("a.txt"))]);
    }
}
