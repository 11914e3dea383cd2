use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use serde::Serialize;

/// Prefix tree over the directories of an index, built as the pipeline
/// discovers them. The GUI renders it as the folder picker; the query layer
/// expands a selected folder into its known descendants with it.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct Folder {
    pub name: String,
    pub children: BTreeMap<String, Folder>,
}

impl Folder {
    pub fn root() -> Self {
        Self::default()
    }

    /// Insert a directory path, creating intermediate nodes as needed.
    pub fn insert(&mut self, path: &Path) {
        let mut node = self;
        for part in components(path) {
            node = node
                .children
                .entry(part.clone())
                .or_insert_with(|| Folder {
                    name: part,
                    children: BTreeMap::new(),
                });
        }
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.descend(path).is_some()
    }

    fn descend(&self, path: &Path) -> Option<&Folder> {
        let mut node = self;
        for part in components(path) {
            node = node.children.get(&part)?;
        }
        Some(node)
    }

    /// Remove the subtree rooted at `path`, if present.
    pub fn remove(&mut self, path: &Path) {
        let parts = components(path);
        let Some((last, ancestors)) = parts.split_last() else {
            return;
        };
        let mut node = self;
        for part in ancestors {
            match node.children.get_mut(part) {
                Some(child) => node = child,
                None => return,
            }
        }
        node.children.remove(last);
    }

    /// The path itself plus every known directory beneath it. Unknown paths
    /// expand to themselves only, so a restriction on them still applies.
    pub fn expand(&self, path: &Path) -> Vec<PathBuf> {
        let mut out = vec![path.to_path_buf()];
        if let Some(node) = self.descend(path) {
            node.collect_descendants(path, &mut out);
        }
        out
    }

    fn collect_descendants(&self, prefix: &Path, out: &mut Vec<PathBuf>) {
        for (name, child) in &self.children {
            let child_path = prefix.join(name);
            child.collect_descendants(&child_path, out);
            out.push(child_path);
        }
    }

    /// Union another tree into this one.
    pub fn merge(&mut self, other: Folder) {
        for (name, child) in other.children {
            match self.children.get_mut(&name) {
                Some(existing) => existing.merge(child),
                None => {
                    self.children.insert(name, child);
                }
            }
        }
    }
}

fn components(path: &Path) -> Vec<String> {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect()
}
