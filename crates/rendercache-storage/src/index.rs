//! In-memory folder index mirroring a shard's blob directory
//!
//! Folders live in a flat arena and refer to each other by id, so traversal
//! is a loop over path segments with no nested locking. A single reader-writer
//! lock guards the arena of one shard.
//!
//! A folder's child maps are authoritative only while `is_valid` is set,
//! which happens right after a full listing of that folder. A miss below an
//! unpopulated folder is `Unknown`, not `Absent`. Entries can still be added
//! to unpopulated folders one at a time (log replay, single stats, writes).
//!
//! Names are compared case-insensitively.

use crate::layout::{parent_folder, physical_path, split_folder, split_relative};
use parking_lot::RwLock;
use rendercache_common::{now_millis, system_time_millis, CacheEntry, Error, Result};
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

type NodeId = usize;

const ROOT: NodeId = 0;

/// Result of an index-only lookup
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Lookup {
    /// The entry is indexed
    Hit(CacheEntry),
    /// The containing folder is populated and has no such file
    Absent,
    /// Some folder on the path has not been populated; the index cannot tell
    Unknown,
}

/// Why the index and the disk disagree
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DriftKind {
    /// An indexed file no longer exists
    Disappeared,
    /// An indexed file was rewritten without going through the cache
    Modified,
}

/// A detected disagreement between index and disk
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DriftEvent {
    /// Folder that was cleared and needs re-population
    pub folder: String,
    /// File that triggered the detection
    pub path: String,
    pub kind: DriftKind,
}

/// Callback notified on every drift detection
pub type DriftListener = Arc<dyn Fn(&DriftEvent) + Send + Sync>;

/// Result of a lookup that may fall back to the filesystem
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StatOutcome {
    Found(CacheEntry),
    Absent,
    /// The index claimed the entry but disk disagreed; the folder was cleared
    Drifted(DriftEvent),
}

/// Summary of one folder population
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PopulateReport {
    pub files: usize,
    pub folders: usize,
    pub bytes: u64,
    /// Files whose on-disk metadata changed behind the index's back
    pub modified: usize,
    /// Previously indexed files that no longer exist
    pub vanished: usize,
}

impl PopulateReport {
    fn absorb(&mut self, other: &Self) {
        self.files += other.files;
        self.folders += other.folders;
        self.bytes += other.bytes;
        self.modified += other.modified;
        self.vanished += other.vanished;
    }
}

#[derive(Debug)]
struct FolderNode {
    name: String,
    parent: Option<NodeId>,
    folders: HashMap<String, NodeId>,
    files: HashMap<String, CacheEntry>,
    is_valid: bool,
}

impl FolderNode {
    fn new(name: &str, parent: Option<NodeId>) -> Self {
        Self {
            name: name.to_string(),
            parent,
            folders: HashMap::new(),
            files: HashMap::new(),
            is_valid: false,
        }
    }
}

#[derive(Debug)]
struct Arena {
    nodes: Vec<Option<FolderNode>>,
    free: Vec<NodeId>,
    total_bytes: u64,
    file_count: usize,
}

enum FolderProbe {
    Found(NodeId),
    Absent,
    Unknown,
}

fn fold(name: &str) -> String {
    name.to_lowercase()
}

fn file_name(path: &str) -> &str {
    path.rsplit_once('/').map_or(path, |(_, name)| name)
}

fn missing_node(id: NodeId) -> Error {
    Error::internal(format!("folder index node {id} is not allocated"))
}

impl Arena {
    fn new() -> Self {
        Self {
            nodes: vec![Some(FolderNode::new("", None))],
            free: Vec::new(),
            total_bytes: 0,
            file_count: 0,
        }
    }

    fn node(&self, id: NodeId) -> Option<&FolderNode> {
        self.nodes.get(id).and_then(Option::as_ref)
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut FolderNode> {
        self.nodes
            .get_mut(id)
            .and_then(Option::as_mut)
            .ok_or_else(|| missing_node(id))
    }

    fn alloc(&mut self, node: FolderNode) -> NodeId {
        if let Some(id) = self.free.pop() {
            self.nodes[id] = Some(node);
            id
        } else {
            self.nodes.push(Some(node));
            self.nodes.len() - 1
        }
    }

    fn probe(&self, segments: &[&str]) -> FolderProbe {
        let mut current = ROOT;
        for segment in segments {
            let Some(node) = self.node(current) else {
                return FolderProbe::Unknown;
            };
            match node.folders.get(&fold(segment)) {
                Some(&child) => current = child,
                None if node.is_valid => return FolderProbe::Absent,
                None => return FolderProbe::Unknown,
            }
        }
        FolderProbe::Found(current)
    }

    /// Walk to a folder, creating unpopulated nodes for missing segments
    fn ensure_folder(&mut self, segments: &[&str]) -> Result<NodeId> {
        let mut current = ROOT;
        for segment in segments {
            let folded = fold(segment);
            let existing = self.node_mut(current)?.folders.get(&folded).copied();
            current = match existing {
                Some(child) => child,
                None => {
                    let child = self.alloc(FolderNode::new(segment, Some(current)));
                    self.node_mut(current)?.folders.insert(folded, child);
                    child
                }
            };
        }
        Ok(current)
    }

    fn put_file(&mut self, folder: NodeId, entry: CacheEntry) -> Result<Option<CacheEntry>> {
        let size = entry.size_bytes;
        let name = fold(file_name(&entry.relative_path));
        let previous = self.node_mut(folder)?.files.insert(name, entry);
        match &previous {
            Some(old) => self.total_bytes = self.total_bytes - old.size_bytes + size,
            None => {
                self.total_bytes += size;
                self.file_count += 1;
            }
        }
        Ok(previous)
    }

    fn take_file(&mut self, folder: NodeId, name: &str) -> Result<Option<CacheEntry>> {
        let removed = self.node_mut(folder)?.files.remove(&fold(name));
        if let Some(entry) = &removed {
            self.total_bytes -= entry.size_bytes;
            self.file_count -= 1;
        }
        Ok(removed)
    }

    /// Release a node and everything below it
    fn free_subtree(&mut self, id: NodeId) {
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            let Some(node) = self.nodes.get_mut(next).and_then(Option::take) else {
                continue;
            };
            for entry in node.files.values() {
                self.total_bytes -= entry.size_bytes;
                self.file_count -= 1;
            }
            stack.extend(node.folders.values().copied());
            self.free.push(next);
        }
    }

    /// Drop all children of a folder and mark it unpopulated
    fn clear(&mut self, id: NodeId) -> Result<()> {
        let node = self.node_mut(id)?;
        let folders: Vec<NodeId> = node.folders.drain().map(|(_, child)| child).collect();
        let files: Vec<CacheEntry> = node.files.drain().map(|(_, entry)| entry).collect();
        node.is_valid = false;

        for entry in files {
            self.total_bytes -= entry.size_bytes;
            self.file_count -= 1;
        }
        for child in folders {
            self.free_subtree(child);
        }
        Ok(())
    }

    fn folder_path(&self, id: NodeId) -> String {
        let mut parts = Vec::new();
        let mut current = Some(id);
        while let Some(next) = current {
            let Some(node) = self.node(next) else { break };
            if next != ROOT {
                parts.push(node.name.as_str());
            }
            current = node.parent;
        }
        parts.reverse();
        parts.join("/")
    }
}

/// In-memory tree of one shard's blob directory
pub struct FolderIndex {
    root: PathBuf,
    arena: RwLock<Arena>,
    listener: Option<DriftListener>,
}

impl FolderIndex {
    /// Create an empty (entirely unpopulated) index over `root`
    pub fn new(root: impl Into<PathBuf>, listener: Option<DriftListener>) -> Self {
        Self {
            root: root.into(),
            arena: RwLock::new(Arena::new()),
            listener,
        }
    }

    /// Physical directory mirrored by this index
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Physical location of a relative path
    pub fn physical_path(&self, relative_path: &str) -> Result<PathBuf> {
        Ok(physical_path(&self.root, &split_folder(relative_path)?))
    }

    /// Look up a file without touching the filesystem
    pub fn lookup(&self, relative_path: &str) -> Result<Lookup> {
        let segments = split_relative(relative_path)?;
        let (folder, name) = segments.split_at(segments.len() - 1);
        let arena = self.arena.read();

        let id = match arena.probe(folder) {
            FolderProbe::Found(id) => id,
            FolderProbe::Absent => return Ok(Lookup::Absent),
            FolderProbe::Unknown => return Ok(Lookup::Unknown),
        };
        let Some(node) = arena.node(id) else {
            return Ok(Lookup::Unknown);
        };
        Ok(match node.files.get(&fold(name[0])) {
            Some(entry) => Lookup::Hit(entry.clone()),
            None if node.is_valid => Lookup::Absent,
            None => Lookup::Unknown,
        })
    }

    /// Look up a file, confirming against the filesystem
    ///
    /// An `Unknown` answer is resolved with one stat and the result indexed.
    /// An indexed entry whose file is gone, or whose modification time no
    /// longer matches, is drift: the containing folder is cleared entirely and
    /// the listener is notified. An entry removed or replaced through the
    /// index between the lookup and the stat is not drift; the lookup is
    /// repeated instead.
    pub fn lookup_or_stat(&self, relative_path: &str) -> Result<StatOutcome> {
        let physical = self.physical_path(relative_path)?;

        loop {
            let indexed = self.lookup(relative_path)?;
            let on_disk = match fs::metadata(&physical) {
                Ok(meta) if meta.is_file() => Some(meta),
                Ok(_) => None,
                Err(e) if e.kind() == ErrorKind::NotFound => None,
                Err(e) => return Err(e.into()),
            };

            let (seen, kind) = match (indexed, on_disk) {
                (Lookup::Absent | Lookup::Unknown, None) => return Ok(StatOutcome::Absent),
                (Lookup::Absent, Some(_)) => return Ok(StatOutcome::Absent),
                (Lookup::Unknown, Some(meta)) => {
                    let entry = entry_from_metadata(relative_path, &meta, None);
                    self.insert(entry.clone())?;
                    return Ok(StatOutcome::Found(entry));
                }
                (Lookup::Hit(entry), None) => (entry, DriftKind::Disappeared),
                (Lookup::Hit(entry), Some(meta)) => {
                    let modified = meta.modified().map(system_time_millis).unwrap_or_default();
                    if modified == entry.modified_ms && meta.len() == entry.size_bytes {
                        return Ok(StatOutcome::Found(entry));
                    }
                    (entry, DriftKind::Modified)
                }
            };

            if let Some(event) = self.drift(relative_path, kind, &seen)? {
                return Ok(StatOutcome::Drifted(event));
            }
        }
    }

    /// Record that an indexed file is gone, e.g. after a failed open
    ///
    /// Returns the drift event if the index still claimed the file.
    pub fn report_missing(&self, relative_path: &str) -> Result<Option<DriftEvent>> {
        match self.lookup(relative_path)? {
            Lookup::Hit(seen) => self.drift(relative_path, DriftKind::Disappeared, &seen),
            Lookup::Absent | Lookup::Unknown => Ok(None),
        }
    }

    /// Clear the folder of `relative_path` if it still holds the entry `seen`
    fn drift(
        &self,
        relative_path: &str,
        kind: DriftKind,
        seen: &CacheEntry,
    ) -> Result<Option<DriftEvent>> {
        let segments = split_relative(relative_path)?;
        let (folder_segments, name) = segments.split_at(segments.len() - 1);
        {
            let mut arena = self.arena.write();
            let FolderProbe::Found(id) = arena.probe(folder_segments) else {
                return Ok(None);
            };
            let unchanged = arena
                .node(id)
                .and_then(|node| node.files.get(&fold(name[0])))
                .is_some_and(|e| e.modified_ms == seen.modified_ms && e.size_bytes == seen.size_bytes);
            if !unchanged {
                return Ok(None);
            }
            arena.clear(id)?;
        }

        let event = DriftEvent {
            folder: parent_folder(relative_path).to_string(),
            path: relative_path.to_string(),
            kind,
        };
        if let Some(listener) = &self.listener {
            listener(&event);
        }
        Ok(Some(event))
    }

    /// Drop everything known about a folder and mark it unpopulated
    pub fn clear_folder(&self, folder: &str) -> Result<()> {
        let segments = split_folder(folder)?;
        let mut arena = self.arena.write();
        match arena.probe(&segments) {
            FolderProbe::Found(id) => arena.clear(id),
            FolderProbe::Absent | FolderProbe::Unknown => Ok(()),
        }
    }

    /// Re-list exactly one folder from disk and swap in the result
    ///
    /// Access times of files that were already indexed and are unchanged on
    /// disk are preserved. Known subfolders keep their (possibly populated)
    /// subtrees; subfolders that vanished are released.
    pub fn populate(&self, folder: &str) -> Result<PopulateReport> {
        let segments = split_folder(folder)?;
        let physical = physical_path(&self.root, &segments);

        let mut listed_files = Vec::new();
        let mut listed_folders = Vec::new();
        match fs::read_dir(&physical) {
            Ok(entries) => {
                for entry in entries {
                    let entry = entry?;
                    let Ok(name) = entry.file_name().into_string() else {
                        continue;
                    };
                    let meta = match entry.metadata() {
                        Ok(meta) => meta,
                        Err(e) if e.kind() == ErrorKind::NotFound => continue,
                        Err(e) => return Err(e.into()),
                    };
                    if meta.is_dir() {
                        listed_folders.push(name);
                    } else if meta.is_file() {
                        listed_files.push((name, meta));
                    }
                }
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let mut report = PopulateReport {
            files: listed_files.len(),
            folders: listed_folders.len(),
            ..Default::default()
        };
        let mut drifted = Vec::new();

        {
            let mut arena = self.arena.write();
            let id = arena.ensure_folder(&segments)?;
            let node = arena.node_mut(id)?;
            let mut old_files = std::mem::take(&mut node.files);
            let mut old_folders = std::mem::take(&mut node.folders);
            let old_bytes: u64 = old_files.values().map(|e| e.size_bytes).sum();
            let old_count = old_files.len();

            let mut files = HashMap::with_capacity(listed_files.len());
            for (name, meta) in listed_files {
                let relative = if folder.is_empty() {
                    name.clone()
                } else {
                    format!("{folder}/{name}")
                };
                let folded = fold(&name);
                let previous = old_files.remove(&folded);
                let mut entry = entry_from_metadata(&relative, &meta, None);
                if let Some(old) = previous {
                    if old.modified_ms == entry.modified_ms && old.size_bytes == entry.size_bytes {
                        entry.key = old.key;
                        entry.created_ms = old.created_ms;
                        entry.accessed_ms = old.accessed_ms;
                    } else {
                        report.modified += 1;
                        drifted.push(DriftEvent {
                            folder: folder.to_string(),
                            path: relative.clone(),
                            kind: DriftKind::Modified,
                        });
                    }
                }
                report.bytes += entry.size_bytes;
                files.insert(folded, entry);
            }
            report.vanished = old_files.len();

            let mut folders = HashMap::with_capacity(listed_folders.len());
            let mut created = Vec::new();
            for name in listed_folders {
                let folded = fold(&name);
                match old_folders.remove(&folded) {
                    Some(child) => {
                        folders.insert(folded, child);
                    }
                    None => created.push((folded, name)),
                }
            }

            let new_count = files.len();
            let node = arena.node_mut(id)?;
            node.files = files;
            node.folders = folders;
            node.is_valid = true;
            arena.total_bytes = arena.total_bytes - old_bytes + report.bytes;
            arena.file_count = arena.file_count - old_count + new_count;

            for (folded, name) in created {
                let child = arena.alloc(FolderNode::new(&name, Some(id)));
                arena.node_mut(id)?.folders.insert(folded, child);
            }
            for child in old_folders.into_values() {
                arena.free_subtree(child);
            }
        }

        if let Some(listener) = &self.listener {
            for event in &drifted {
                listener(event);
            }
        }
        Ok(report)
    }

    /// Populate a folder and every folder below it
    pub fn populate_tree(&self, folder: &str) -> Result<PopulateReport> {
        let mut total = PopulateReport::default();
        let mut pending = vec![folder.to_string()];
        while let Some(next) = pending.pop() {
            let report = self.populate(&next)?;
            total.absorb(&report);

            let segments = split_folder(&next)?;
            let arena = self.arena.read();
            if let FolderProbe::Found(id) = arena.probe(&segments) {
                if let Some(node) = arena.node(id) {
                    for child in node.folders.values() {
                        pending.push(arena.folder_path(*child));
                    }
                }
            }
        }
        Ok(total)
    }

    /// Insert or replace one entry, creating unpopulated folders as needed
    pub fn insert(&self, entry: CacheEntry) -> Result<Option<CacheEntry>> {
        let segments = split_relative(&entry.relative_path)?;
        let mut arena = self.arena.write();
        let id = arena.ensure_folder(&segments[..segments.len() - 1])?;
        arena.put_file(id, entry)
    }

    /// Remove one entry
    pub fn remove(&self, relative_path: &str) -> Result<Option<CacheEntry>> {
        self.remove_matching(relative_path, |_| true)
    }

    /// Remove an entry only if it was not accessed since `accessed_ms`
    ///
    /// Used by eviction so that an entry hit after the candidate list was
    /// built survives the sweep.
    pub fn remove_if_idle_since(
        &self,
        relative_path: &str,
        accessed_ms: u64,
    ) -> Result<Option<CacheEntry>> {
        self.remove_matching(relative_path, |entry| entry.accessed_ms <= accessed_ms)
    }

    fn remove_matching(
        &self,
        relative_path: &str,
        predicate: impl Fn(&CacheEntry) -> bool,
    ) -> Result<Option<CacheEntry>> {
        let segments = split_relative(relative_path)?;
        let (folder, name) = segments.split_at(segments.len() - 1);
        let mut arena = self.arena.write();
        let FolderProbe::Found(id) = arena.probe(folder) else {
            return Ok(None);
        };
        let matches = arena
            .node(id)
            .and_then(|node| node.files.get(&fold(name[0])))
            .is_some_and(|entry| predicate(entry));
        if !matches {
            return Ok(None);
        }
        arena.take_file(id, name[0])
    }

    /// Mark an entry as accessed now
    ///
    /// Returns false if the entry is not indexed; the caller then has to
    /// fall back to `lookup_or_stat`.
    pub fn bump_access(&self, relative_path: &str) -> bool {
        self.bump_access_at(relative_path, now_millis())
    }

    /// Mark an entry as accessed at a given time (unix millis)
    pub fn bump_access_at(&self, relative_path: &str, accessed_ms: u64) -> bool {
        let Ok(segments) = split_relative(relative_path) else {
            return false;
        };
        let (folder, name) = segments.split_at(segments.len() - 1);
        let mut arena = self.arena.write();
        let FolderProbe::Found(id) = arena.probe(folder) else {
            return false;
        };
        match arena.node_mut(id) {
            Ok(node) => match node.files.get_mut(&fold(name[0])) {
                Some(entry) => {
                    entry.accessed_ms = accessed_ms;
                    true
                }
                None => false,
            },
            Err(_) => false,
        }
    }

    /// Entries of one folder, least recently accessed first
    ///
    /// Ties are broken by name so the order is deterministic.
    pub fn sorted_entries_by_access(&self, folder: &str) -> Result<Vec<(String, CacheEntry)>> {
        let segments = split_folder(folder)?;
        let arena = self.arena.read();
        let FolderProbe::Found(id) = arena.probe(&segments) else {
            return Ok(Vec::new());
        };
        let Some(node) = arena.node(id) else {
            return Ok(Vec::new());
        };
        let mut entries: Vec<(String, CacheEntry)> = node
            .files
            .values()
            .map(|entry| (file_name(&entry.relative_path).to_string(), entry.clone()))
            .collect();
        entries.sort_by(|a, b| {
            a.1.accessed_ms
                .cmp(&b.1.accessed_ms)
                .then_with(|| a.0.cmp(&b.0))
        });
        Ok(entries)
    }

    /// Every indexed entry, least recently accessed first
    #[must_use]
    pub fn entries_by_access(&self) -> Vec<CacheEntry> {
        let mut entries = self.snapshot();
        entries.sort_by(|a, b| {
            a.accessed_ms
                .cmp(&b.accessed_ms)
                .then_with(|| a.relative_path.cmp(&b.relative_path))
        });
        entries
    }

    /// Copy of every indexed entry, in no particular order
    #[must_use]
    pub fn snapshot(&self) -> Vec<CacheEntry> {
        let arena = self.arena.read();
        let mut entries = Vec::with_capacity(arena.file_count);
        for node in arena.nodes.iter().flatten() {
            entries.extend(node.files.values().cloned());
        }
        entries
    }

    /// Whether a folder has been fully listed since it was last invalidated
    #[must_use]
    pub fn is_populated(&self, folder: &str) -> bool {
        let Ok(segments) = split_folder(folder) else {
            return false;
        };
        let arena = self.arena.read();
        match arena.probe(&segments) {
            FolderProbe::Found(id) => arena.node(id).is_some_and(|n| n.is_valid),
            FolderProbe::Absent | FolderProbe::Unknown => false,
        }
    }

    /// Drop the whole tree
    pub fn reset(&self) {
        *self.arena.write() = Arena::new();
    }

    /// Sum of indexed file sizes
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.arena.read().total_bytes
    }

    /// Number of indexed files
    #[must_use]
    pub fn len(&self) -> usize {
        self.arena.read().file_count
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of live folder nodes, including the root
    #[must_use]
    pub fn folder_count(&self) -> usize {
        let arena = self.arena.read();
        arena.nodes.len() - arena.free.len()
    }
}

fn entry_from_metadata(
    relative_path: &str,
    meta: &fs::Metadata,
    key: Option<rendercache_common::CacheKey>,
) -> CacheEntry {
    let modified = meta.modified().map(system_time_millis).unwrap_or_default();
    let created = meta.created().map(system_time_millis).unwrap_or(modified);
    CacheEntry {
        key,
        relative_path: relative_path.to_string(),
        size_bytes: meta.len(),
        created_ms: created,
        modified_ms: modified,
        accessed_ms: modified,
    }
}

/// Build an entry for a file that was just written through the cache
pub(crate) fn entry_for_written_file(
    relative_path: &str,
    physical: &Path,
    key: rendercache_common::CacheKey,
) -> Result<CacheEntry> {
    let meta = fs::metadata(physical)?;
    let mut entry = entry_from_metadata(relative_path, &meta, Some(key));
    entry.accessed_ms = now_millis();
    Ok(entry)
}
