use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::application::config::configuration::Configuration;
use crate::indexes::query::{self, QueryError};
use crate::indexes::store::{IndexStats, IndexStore, SearchHit, StoreError};
use crate::pipeline::coordinator::{Coordinator, WorkItem};
use crate::tree::Folder;

/// Process-wide mapping from index short-name to its coordinator. Queries
/// read it lock-free; only the foreground thread inserts or removes entries.
pub type IndexPool = Arc<scc::HashMap<String, Arc<Coordinator>>>;

#[derive(thiserror::Error, Debug)]
pub enum RegistryError {
    #[error("{0} does not exist or is not a directory")]
    InvalidPath(PathBuf),

    #[error("no index registered for {0}")]
    UnknownIndex(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error("registry io error")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub struct Registry {
    config: Arc<Configuration>,
    pool: IndexPool,
}

impl Registry {
    pub fn new(config: Arc<Configuration>) -> Self {
        Self {
            config,
            pool: Arc::default(),
        }
    }

    /// Open every index listed in the registry file. Duplicate roots are
    /// deduplicated by short-name; unreadable indexes are logged and
    /// omitted.
    pub async fn load(&self) -> anyhow::Result<()> {
        for root in read_registry_lines(&self.config.registry_file) {
            let Some(short) = short_name(&root) else {
                continue;
            };
            if self.pool.read(&short, |_, _| ()).is_some() {
                debug!(%short, "duplicate registry entry, skipping");
                continue;
            }
            match self.open_index(&short).await {
                Ok(coordinator) => {
                    let _ = self.pool.insert(short, coordinator);
                }
                Err(err) => {
                    warn!(%err, root = %root.display(), "skipping unreadable index");
                }
            }
        }
        Ok(())
    }

    /// Re-open a previously created index: read its descriptor back, re-arm
    /// the watcher over every known directory, rebuild the folder tree and
    /// replay the offline journal.
    async fn open_index(&self, short: &str) -> Result<Arc<Coordinator>, RegistryError> {
        let store = Arc::new(IndexStore::open(&self.config.index_path(short))?);
        let coordinator = Coordinator::new(Arc::clone(&store), &self.config)?;

        let mut dirs = BTreeSet::new();
        for rel in store.all_paths()? {
            let mut ancestor = Path::new(&rel).parent();
            while let Some(dir) = ancestor {
                if dir.as_os_str().is_empty() {
                    break;
                }
                dirs.insert(dir.to_path_buf());
                ancestor = dir.parent();
            }
        }
        for rel in dirs {
            coordinator.track_dir(&store.base_path().join(rel));
        }

        coordinator.start_watching();
        self.replay_journal(&coordinator, short).await;
        Ok(coordinator)
    }

    /// Create an index over `root` and run the initial scan to completion.
    /// Returns the updated tree view for the folder picker.
    pub async fn index_folder(
        &self,
        root: &Path,
        extensions: BTreeMap<String, bool>,
    ) -> Result<Folder, RegistryError> {
        if !root.is_dir() {
            return Err(RegistryError::InvalidPath(root.to_path_buf()));
        }
        let root = fs::canonicalize(root)?;
        let short =
            short_name(&root).ok_or_else(|| RegistryError::InvalidPath(root.clone()))?;

        let store = Arc::new(IndexStore::create(
            &self.config.index_path(&short),
            &root,
            &extensions,
        )?);
        append_registry_line(&self.config.registry_file, &root)?;

        let coordinator = Coordinator::new(store, &self.config)?;
        coordinator.start_watching();
        let _ = self.pool.insert(short.clone(), Arc::clone(&coordinator));

        info!(%short, root = %root.display(), "indexing new folder");
        coordinator.initial_scan(&root).await;
        coordinator.scan_complete().await;
        info!(%short, stats = %coordinator.stats(), "initial scan finished");

        Ok(self.tree_view())
    }

    /// Drop an index: stop its pipeline and delete the on-disk index. The
    /// registry file stays append-only; with the directory gone, the next
    /// startup's open fails and the entry is skipped.
    pub async fn remove_folder(&self, root: &Path) -> Result<Folder, RegistryError> {
        let short =
            short_name(root).ok_or_else(|| RegistryError::InvalidPath(root.to_path_buf()))?;
        let Some(coordinator) = self.pool.read(&short, |_, v| Arc::clone(v)) else {
            return Err(RegistryError::UnknownIndex(short));
        };

        coordinator.shutdown().await;
        self.pool.remove(&short);
        if let Err(err) = fs::remove_dir_all(self.config.index_path(&short)) {
            warn!(%err, %short, "could not remove index directory");
        }
        info!(%short, "index removed");
        Ok(self.tree_view())
    }

    /// Run a query over the given folders: group them by owning index,
    /// build one composite query per group and concatenate the hits.
    /// Scores are not comparable across indexes, so no re-ranking happens.
    pub async fn search(
        &self,
        query: &str,
        folders: &[PathBuf],
    ) -> Result<Vec<SearchHit>, RegistryError> {
        query::validate(query)?;

        let mut results = Vec::new();
        for (coordinator, group) in self.group_folders(folders) {
            let store = coordinator.store();
            let dirs: BTreeSet<String> = group
                .iter()
                .flat_map(|folder| coordinator.expand_dirs(folder))
                .collect();
            let dirs: Vec<String> = dirs.into_iter().collect();

            let user = query::parse(store.index(), store.fields(), query)?;
            let composite = query::restricted(user, store.fields(), &dirs);
            let limit = self.config.search_limit;
            let hits = tokio::task::spawn_blocking(move || store.search(&composite, limit))
                .await
                .map_err(|err| RegistryError::Other(anyhow::anyhow!(err)))??;
            results.extend(hits);
        }
        Ok(results)
    }

    /// The terms a query would highlight in the preview panel.
    pub fn extract_terms(&self, query: &str) -> Result<Vec<String>, QueryError> {
        query::extract_terms(query)
    }

    /// Union of every index's folder tree, for the folder picker.
    pub fn tree_view(&self) -> Folder {
        let mut root = Folder::root();
        self.pool.scan(|_, coordinator| {
            root.merge(coordinator.folder_tree());
        });
        root
    }

    /// Absolute roots of all open indexes.
    pub fn roots(&self) -> Vec<PathBuf> {
        let mut roots = Vec::new();
        self.pool.scan(|short, coordinator| {
            roots.push(coordinator.store().base_path().join(short));
        });
        roots.sort();
        roots
    }

    pub fn stats(&self) -> Vec<(String, IndexStats)> {
        let mut stats = Vec::new();
        self.pool.scan(|short, coordinator| {
            stats.push((short.clone(), coordinator.stats()));
        });
        stats.sort_by(|a, b| a.0.cmp(&b.0));
        stats
    }

    pub async fn shutdown(&self) {
        let mut coordinators = Vec::new();
        self.pool.scan(|short, coordinator| {
            coordinators.push((short.clone(), Arc::clone(coordinator)));
        });
        for (short, coordinator) in coordinators {
            debug!(%short, "closing index");
            coordinator.shutdown().await;
        }
        self.pool.clear();
    }

    /// Bin each folder under the index whose short-name owns it. Folders may
    /// arrive in index-relative form (from the tree widget) or absolute;
    /// both normalize to the relative form the `dir` field uses. Folders
    /// matching no index are dropped, as are groups with no folders.
    fn group_folders(&self, folders: &[PathBuf]) -> Vec<(Arc<Coordinator>, Vec<PathBuf>)> {
        let mut groups: Vec<(String, Arc<Coordinator>, Vec<PathBuf>)> = Vec::new();
        for folder in folders {
            let mut owner: Option<(String, Arc<Coordinator>, PathBuf)> = None;
            self.pool.scan(|short, coordinator| {
                if owner.is_none() {
                    if let Some(rel) =
                        relative_folder(folder, short, coordinator.store().base_path())
                    {
                        owner = Some((short.clone(), Arc::clone(coordinator), rel));
                    }
                }
            });
            let Some((short, coordinator, rel)) = owner else {
                debug!(folder = %folder.display(), "folder matches no index");
                continue;
            };
            match groups.iter_mut().find(|(name, _, _)| *name == short) {
                Some((_, _, group)) => group.push(rel),
                None => groups.push((short, coordinator, vec![rel])),
            }
        }
        groups
            .into_iter()
            .map(|(_, coordinator, group)| (coordinator, group))
            .collect()
    }

    async fn replay_journal(&self, coordinator: &Coordinator, short: &str) {
        let path = self.config.journal_path(short);
        let Ok(raw) = fs::read_to_string(&path) else {
            return;
        };
        let mut replayed = 0usize;
        for line in raw.lines() {
            if let Some(item) = parse_journal_line(line) {
                coordinator.enqueue(item).await;
                replayed += 1;
            }
        }
        if replayed > 0 {
            info!(%short, replayed, "replayed pending changes");
        }
        if let Err(err) = fs::remove_file(&path) {
            debug!(%err, "could not clear journal");
        }
    }
}

/// The index identifier: the basename of the indexed root.
pub fn short_name(root: &Path) -> Option<String> {
    root.file_name().map(|n| n.to_string_lossy().into_owned())
}

/// A folder's index-relative form under `short`, if that index owns it.
fn relative_folder(folder: &Path, short: &str, base: &Path) -> Option<PathBuf> {
    let rel = if folder.is_absolute() {
        folder.strip_prefix(base).ok()?
    } else {
        folder
    };
    let first = rel.components().next()?;
    (first.as_os_str() == std::ffi::OsStr::new(short)).then(|| rel.to_path_buf())
}

pub(crate) fn read_registry_lines(path: &Path) -> Vec<PathBuf> {
    let Ok(raw) = fs::read_to_string(path) else {
        return Vec::new();
    };
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(PathBuf::from)
        .collect()
}

pub(crate) fn append_registry_line(path: &Path, root: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let mut file = fs::OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{}", root.display())
}

/// One journal line: `<kind>:<path>`, written by the offline helper while
/// the main app is closed.
pub(crate) fn parse_journal_line(line: &str) -> Option<WorkItem> {
    let (kind, path) = line.trim().split_once(':')?;
    if path.is_empty() {
        return None;
    }
    let path = PathBuf::from(path);
    match kind {
        "create" => Some(WorkItem::Create(path)),
        "update" => Some(WorkItem::Update(path)),
        "delete" => Some(WorkItem::Delete(path)),
        _ => None,
    }
}
