use dashmap::DashMap;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::{debug, warn};

use super::{is_compatible_format, join_path, normalize_path, split_path, validate_segment, HasGroups, FORMAT_VERSION};
use crate::core::config::StorageConfig;
use crate::core::errors::{JobError, Result};

const LEAF_PREFIX: u8 = b'v';
const GROUP_PREFIX: u8 = b'g';

const ENCODING_RAW: u8 = 0;
const ENCODING_ZSTD: u8 = 1;

/// Tags stored with every group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupMeta {
    /// Fully qualified type of the object stored in the group
    pub type_name: String,
    pub name: String,
    pub version: Option<String>,
    /// Record layout version, set on the root group only
    pub format_version: Option<String>,
}

impl GroupMeta {
    fn plain(name: &str) -> Self {
        Self {
            type_name: "group".to_string(),
            name: name.to_string(),
            version: None,
            format_version: None,
        }
    }
}

/// Opens job records and shares handles between tasks of this process.
///
/// sled holds an exclusive file lock per database, so a record can only be
/// open once per process; the pool hands out clones of the live handle instead.
pub struct RecordStore {
    config: StorageConfig,
    open: DashMap<PathBuf, Weak<OpenRecord>>,
}

struct OpenRecord {
    path: PathBuf,
    db: sled::Db,
    config: StorageConfig,
    writer: Mutex<()>,
}

impl Drop for OpenRecord {
    fn drop(&mut self) {
        if let Err(e) = self.db.flush() {
            warn!(path = %self.path.display(), "Failed to flush record on close: {}", e);
        }
    }
}

impl RecordStore {
    pub fn new(config: StorageConfig) -> Self {
        Self {
            config,
            open: DashMap::new(),
        }
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Open an existing record
    pub async fn open(&self, path: &Path) -> Result<RecordHandle> {
        if !path.exists() {
            return Err(JobError::not_found(format!(
                "job record {} does not exist",
                path.display()
            )));
        }
        let handle = self.open_inner(path).await?;
        handle.check_format()?;
        Ok(handle)
    }

    /// Open a record, creating it with the given root tags when absent
    pub async fn create(&self, path: &Path, type_name: &str, name: &str, version: &str) -> Result<RecordHandle> {
        let handle = self.open_inner(path).await?;
        match handle.root_meta()? {
            Some(_) => handle.check_format()?,
            None => {
                let meta = GroupMeta {
                    type_name: type_name.to_string(),
                    name: name.to_string(),
                    version: Some(version.to_string()),
                    format_version: Some(FORMAT_VERSION.to_string()),
                };
                handle
                    .record
                    .db
                    .insert(group_key(""), serde_json::to_vec(&meta)?)?;
                handle.record.db.flush_async().await?;
            }
        }
        Ok(handle)
    }

    pub fn exists(&self, path: &Path) -> bool {
        path.is_dir()
    }

    /// `true` while some task of this process holds a handle to the record
    pub fn is_open(&self, path: &Path) -> bool {
        self.open
            .get(path)
            .map(|weak| weak.strong_count() > 0)
            .unwrap_or(false)
    }

    /// Delete a record from disk. Fails with a conflict while it is open in this process.
    pub async fn remove(&self, path: &Path) -> Result<()> {
        if self.is_open(path) {
            return Err(JobError::conflict(format!(
                "job record {} is still open",
                path.display()
            )));
        }
        self.open.remove(path);
        match tokio::fs::remove_dir_all(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn open_inner(&self, path: &Path) -> Result<RecordHandle> {
        let path = path.to_path_buf();
        let mut attempt = 0;
        loop {
            if let Some(record) = self.open.get(&path).and_then(|weak| weak.upgrade()) {
                return Ok(RecordHandle { record });
            }

            let open_path = path.clone();
            let opened = tokio::task::spawn_blocking(move || sled::Config::new().path(open_path).open())
                .await
                .map_err(|e| JobError::internal(format!("record open task failed: {}", e)))?;

            match opened {
                Ok(db) => {
                    let record = Arc::new(OpenRecord {
                        path: path.clone(),
                        db,
                        config: self.config.clone(),
                        writer: Mutex::new(()),
                    });
                    self.open.insert(path.clone(), Arc::downgrade(&record));
                    debug!(path = %path.display(), "Opened job record");
                    return Ok(RecordHandle { record });
                }
                // Held by another process (or a concurrent open in this one)
                Err(sled::Error::Io(e)) if attempt < self.config.open_retries => {
                    attempt += 1;
                    debug!(path = %path.display(), attempt, "Record locked, retrying open: {}", e);
                    tokio::time::sleep(self.config.open_retry_interval).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Shared handle to an open job record; the record is closed when the last
/// handle is dropped.
#[derive(Clone)]
pub struct RecordHandle {
    record: Arc<OpenRecord>,
}

impl std::fmt::Debug for RecordHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordHandle")
            .field("path", &self.record.path)
            .finish()
    }
}

/// Child of a record group
#[derive(Debug, Clone)]
pub enum RecordNode {
    Value(Value),
    Group(RecordGroup),
}

impl RecordHandle {
    pub fn path(&self) -> &Path {
        &self.record.path
    }

    pub fn root_meta(&self) -> Result<Option<GroupMeta>> {
        self.group_meta("")
    }

    pub fn group_meta(&self, path: &str) -> Result<Option<GroupMeta>> {
        let path = normalize_path(path)?;
        match self.record.db.get(group_key(&path))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn check_format(&self) -> Result<()> {
        let meta = self.root_meta()?.ok_or_else(|| {
            JobError::not_found(format!("{} is not a job record", self.path().display()))
        })?;
        let version = meta.format_version.as_deref().unwrap_or("0.0");
        if !is_compatible_format(version) {
            return Err(JobError::configuration(format!(
                "record {} has format version {}, expected {}",
                self.path().display(),
                version,
                FORMAT_VERSION
            )));
        }
        Ok(())
    }

    /// Read a leaf value or a whole subtree as JSON
    pub fn read(&self, path: &str) -> Result<Value> {
        self.read_opt(path)?.ok_or_else(|| {
            JobError::not_found(format!(
                "path '{}' in record {}",
                path,
                self.path().display()
            ))
        })
    }

    pub fn read_opt(&self, path: &str) -> Result<Option<Value>> {
        let path = normalize_path(path)?;
        if let Some(bytes) = self.record.db.get(leaf_key(&path))? {
            return Ok(Some(decode_leaf(&bytes)?));
        }
        if self.record.db.contains_key(group_key(&path))? {
            return Ok(Some(self.read_subtree(&path)?));
        }
        Ok(None)
    }

    pub fn read_as<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        Ok(serde_json::from_value(self.read(path)?)?)
    }

    pub fn exists(&self, path: &str) -> Result<bool> {
        let path = normalize_path(path)?;
        Ok(self.record.db.contains_key(leaf_key(&path))?
            || self.record.db.contains_key(group_key(&path))?)
    }

    pub fn is_group(&self, path: &str) -> Result<bool> {
        let path = normalize_path(path)?;
        Ok(self.record.db.contains_key(group_key(&path))?)
    }

    /// Immediate children of a group, partitioned into (nodes, groups)
    pub fn list(&self, path: &str) -> Result<(Vec<String>, Vec<String>)> {
        let path = normalize_path(path)?;
        if !self.record.db.contains_key(group_key(&path))? {
            return Err(JobError::not_found(format!(
                "group '{}' in record {}",
                path,
                self.path().display()
            )));
        }
        let nodes = self.child_names(LEAF_PREFIX, &path)?;
        let groups = self.child_names(GROUP_PREFIX, &path)?;
        Ok((nodes, groups))
    }

    pub fn group(&self, path: &str) -> Result<RecordGroup> {
        let path = normalize_path(path)?;
        if !self.is_group(&path)? {
            return Err(JobError::not_found(format!("group '{}'", path)));
        }
        Ok(RecordGroup {
            handle: self.clone(),
            path,
        })
    }

    /// Write a single value; objects become groups
    pub fn write(&self, path: &str, value: &Value) -> Result<()> {
        self.with_scoped("", |scope| scope.write(path, value))
    }

    pub fn write_as<T: Serialize>(&self, path: &str, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.write(path, &value)
    }

    pub fn remove(&self, path: &str) -> Result<()> {
        self.with_scoped("", |scope| scope.remove(path))
    }

    /// Acquire `group` for a bulk write. Nothing reaches the record unless
    /// [`ScopedWrite::commit`] is called.
    pub fn scoped(&self, group: &str) -> Result<ScopedWrite<'_>> {
        let guard = self
            .record
            .writer
            .lock()
            .map_err(|_| JobError::internal("record writer lock poisoned"))?;
        Ok(ScopedWrite {
            handle: self,
            _guard: guard,
            base: normalize_path(group)?,
            pending: BTreeMap::new(),
        })
    }

    /// Run `f` inside a scoped write: all of its writes are applied atomically
    /// when it returns `Ok`, none of them when it returns `Err`.
    pub fn with_scoped<T, F>(&self, group: &str, f: F) -> Result<T>
    where
        F: FnOnce(&mut ScopedWrite<'_>) -> Result<T>,
    {
        let mut scope = self.scoped(group)?;
        let result = f(&mut scope)?;
        scope.commit()?;
        Ok(result)
    }

    pub async fn flush(&self) -> Result<()> {
        self.record.db.flush_async().await?;
        Ok(())
    }

    /// Make committed writes durable when `flush_on_commit` is set. Commits
    /// themselves never block on the disk.
    pub async fn sync(&self) -> Result<()> {
        if self.record.config.flush_on_commit {
            self.flush().await?;
        }
        Ok(())
    }

    fn child_names(&self, kind: u8, parent: &str) -> Result<Vec<String>> {
        let prefix = child_prefix(kind, parent);
        let mut names = BTreeSet::new();
        for item in self.record.db.scan_prefix(&prefix) {
            let (key, _) = item?;
            let rest = &key[prefix.len()..];
            if rest.is_empty() || rest.contains(&b'/') {
                continue;
            }
            names.insert(String::from_utf8_lossy(rest).into_owned());
        }
        Ok(names.into_iter().collect())
    }

    fn read_subtree(&self, path: &str) -> Result<Value> {
        let mut root = Map::new();

        for item in self.record.db.scan_prefix(child_prefix(GROUP_PREFIX, path)) {
            let (key, _) = item?;
            let rel = relative(&key, path);
            if rel.is_empty() {
                continue;
            }
            insert_at(&mut root, &rel, None)?;
        }
        for item in self.record.db.scan_prefix(child_prefix(LEAF_PREFIX, path)) {
            let (key, bytes) = item?;
            let rel = relative(&key, path);
            if rel.is_empty() {
                continue;
            }
            insert_at(&mut root, &rel, Some(decode_leaf(&bytes)?))?;
        }
        Ok(Value::Object(root))
    }
}

/// A group inside an open record
#[derive(Debug, Clone)]
pub struct RecordGroup {
    handle: RecordHandle,
    path: String,
}

impl RecordGroup {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn meta(&self) -> Result<Option<GroupMeta>> {
        self.handle.group_meta(&self.path)
    }

    pub fn read(&self, name: &str) -> Result<Value> {
        self.handle.read(&join_path(&self.path, name))
    }
}

impl HasGroups for RecordGroup {
    type Child = RecordNode;

    fn list_nodes(&self) -> Result<Vec<String>> {
        Ok(self.handle.list(&self.path)?.0)
    }

    fn list_groups(&self) -> Result<Vec<String>> {
        Ok(self.handle.list(&self.path)?.1)
    }

    fn list_all(&self) -> Result<(Vec<String>, Vec<String>)> {
        self.handle.list(&self.path)
    }

    fn child(&self, name: &str) -> Result<RecordNode> {
        validate_segment(name)?;
        let path = join_path(&self.path, name);
        if self.handle.is_group(&path)? {
            Ok(RecordNode::Group(RecordGroup {
                handle: self.handle.clone(),
                path,
            }))
        } else {
            Ok(RecordNode::Value(self.handle.read(&path)?))
        }
    }
}

/// Pending writes to one group of a record. Reads through the scope see the
/// pending state; dropping it without `commit` discards everything.
pub struct ScopedWrite<'a> {
    handle: &'a RecordHandle,
    _guard: MutexGuard<'a, ()>,
    base: String,
    pending: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl<'a> ScopedWrite<'a> {
    fn absolute(&self, path: &str) -> Result<String> {
        let path = normalize_path(path)?;
        Ok(match (self.base.is_empty(), path.is_empty()) {
            (true, _) => path,
            (false, true) => self.base.clone(),
            (false, false) => format!("{}/{}", self.base, path),
        })
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.pending.get(key) {
            Some(value) => Ok(value.clone()),
            None => Ok(self.handle.record.db.get(key)?.map(|v| v.to_vec())),
        }
    }

    fn contains(&self, key: &[u8]) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    fn keys_with_prefix(&self, prefix: &[u8]) -> Result<BTreeSet<Vec<u8>>> {
        let mut keys = BTreeSet::new();
        for item in self.handle.record.db.scan_prefix(prefix) {
            let (key, _) = item?;
            keys.insert(key.to_vec());
        }
        for (key, value) in self.pending.range(prefix.to_vec()..) {
            if !key.starts_with(prefix) {
                break;
            }
            match value {
                Some(_) => keys.insert(key.clone()),
                None => keys.remove(key),
            };
        }
        Ok(keys)
    }

    /// Write `value` at `path` relative to the scope's group
    pub fn write(&mut self, path: &str, value: &Value) -> Result<()> {
        let path = self.absolute(path)?;
        if path.is_empty() {
            let Value::Object(fields) = value else {
                return Err(JobError::conflict("the record root can only hold a group"));
            };
            self.clear_children("")?;
            for (name, field) in fields {
                validate_segment(name)?;
                self.put(name, field)?;
            }
            return Ok(());
        }
        self.ensure_parents(&path)?;
        self.remove_subtree(&path)?;
        self.put(&path, value)
    }

    pub fn write_as<T: Serialize>(&mut self, path: &str, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.write(path, &value)
    }

    /// Create an empty group with explicit type tags
    pub fn create_group(&mut self, path: &str, meta: GroupMeta) -> Result<()> {
        let path = self.absolute(path)?;
        if path.is_empty() {
            return Err(JobError::conflict("the record root already exists"));
        }
        self.ensure_parents(&path)?;
        self.remove_subtree(&path)?;
        self.pending
            .insert(group_key(&path), Some(serde_json::to_vec(&meta)?));
        Ok(())
    }

    pub fn remove(&mut self, path: &str) -> Result<()> {
        let path = self.absolute(path)?;
        if path.is_empty() {
            return self.clear_children("");
        }
        self.remove_subtree(&path)
    }

    /// Read a leaf or subtree as it would look after commit
    pub fn read_opt(&self, path: &str) -> Result<Option<Value>> {
        let path = self.absolute(path)?;
        if let Some(bytes) = self.get(&leaf_key(&path))? {
            return Ok(Some(decode_leaf(&bytes)?));
        }
        if !self.contains(&group_key(&path))? {
            return Ok(None);
        }
        let mut root = Map::new();
        for key in self.keys_with_prefix(&child_prefix(GROUP_PREFIX, &path))? {
            let rel = relative(&key, &path);
            if !rel.is_empty() {
                insert_at(&mut root, &rel, None)?;
            }
        }
        for key in self.keys_with_prefix(&child_prefix(LEAF_PREFIX, &path))? {
            let rel = relative(&key, &path);
            if rel.is_empty() {
                continue;
            }
            if let Some(bytes) = self.get(&key)? {
                insert_at(&mut root, &rel, Some(decode_leaf(&bytes)?))?;
            }
        }
        Ok(Some(Value::Object(root)))
    }

    /// Number of pending key operations
    pub fn pending_ops(&self) -> usize {
        self.pending.len()
    }

    /// Apply every pending write as one atomic batch. Durability is left to
    /// [`RecordHandle::sync`].
    pub fn commit(self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let mut batch = sled::Batch::default();
        for (key, value) in &self.pending {
            match value {
                Some(bytes) => batch.insert(key.as_slice(), bytes.as_slice()),
                None => batch.remove(key.as_slice()),
            }
        }
        self.handle.record.db.apply_batch(batch)?;
        debug!(
            path = %self.handle.path().display(),
            group = %self.base,
            ops = self.pending.len(),
            "Committed scoped write"
        );
        Ok(())
    }

    fn put(&mut self, path: &str, value: &Value) -> Result<()> {
        match value {
            Value::Object(fields) => {
                let name = split_path(path).map(|(_, n)| n).unwrap_or("");
                self.pending
                    .insert(group_key(path), Some(serde_json::to_vec(&GroupMeta::plain(name))?));
                for (field, inner) in fields {
                    validate_segment(field)?;
                    self.put(&join_path(path, field), inner)?;
                }
            }
            other => {
                let encoded = encode_leaf(other, &self.handle.record.config)?;
                self.pending.insert(leaf_key(path), Some(encoded));
            }
        }
        Ok(())
    }

    fn ensure_parents(&mut self, path: &str) -> Result<()> {
        let mut current = String::new();
        let segments: Vec<&str> = path.split('/').collect();
        for segment in &segments[..segments.len() - 1] {
            current = join_path(&current, segment);
            if self.contains(&leaf_key(&current))? {
                return Err(JobError::conflict(format!(
                    "'{}' holds a value, not a group",
                    current
                )));
            }
            if !self.contains(&group_key(&current))? {
                self.pending.insert(
                    group_key(&current),
                    Some(serde_json::to_vec(&GroupMeta::plain(segment))?),
                );
            }
        }
        Ok(())
    }

    fn remove_subtree(&mut self, path: &str) -> Result<()> {
        for key in [leaf_key(path), group_key(path)] {
            if self.contains(&key)? {
                self.pending.insert(key, None);
            }
        }
        self.clear_children(path)
    }

    fn clear_children(&mut self, path: &str) -> Result<()> {
        for kind in [LEAF_PREFIX, GROUP_PREFIX] {
            for key in self.keys_with_prefix(&child_prefix(kind, path))? {
                if key.len() > 1 {
                    self.pending.insert(key, None);
                }
            }
        }
        Ok(())
    }
}

fn leaf_key(path: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(path.len() + 1);
    key.push(LEAF_PREFIX);
    key.extend_from_slice(path.as_bytes());
    key
}

fn group_key(path: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(path.len() + 1);
    key.push(GROUP_PREFIX);
    key.extend_from_slice(path.as_bytes());
    key
}

/// Key prefix of every descendant of `parent` of the given kind
fn child_prefix(kind: u8, parent: &str) -> Vec<u8> {
    let mut key = vec![kind];
    if !parent.is_empty() {
        key.extend_from_slice(parent.as_bytes());
        key.push(b'/');
    }
    key
}

/// Path of `key` relative to `parent`, without the kind byte
fn relative(key: &[u8], parent: &str) -> String {
    let skip = if parent.is_empty() { 1 } else { parent.len() + 2 };
    key.get(skip..)
        .map(|rest| String::from_utf8_lossy(rest).into_owned())
        .unwrap_or_default()
}

fn insert_at(root: &mut Map<String, Value>, rel: &str, leaf: Option<Value>) -> Result<()> {
    let segments: Vec<&str> = rel.split('/').collect();
    let (last, parents) = match segments.split_last() {
        Some(split) => split,
        None => return Ok(()),
    };
    let mut current = root;
    for segment in parents {
        let entry = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        current = entry
            .as_object_mut()
            .ok_or_else(|| JobError::internal(format!("corrupt record: '{}' is not a group", rel)))?;
    }
    match leaf {
        Some(value) => {
            current.insert(last.to_string(), value);
        }
        None => {
            current
                .entry(last.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
        }
    }
    Ok(())
}

fn encode_leaf(value: &Value, config: &StorageConfig) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(value)?;
    if json.len() > config.compression_threshold {
        let compressed = zstd::encode_all(json.as_slice(), config.compression_level)?;
        let mut bytes = Vec::with_capacity(compressed.len() + 1);
        bytes.push(ENCODING_ZSTD);
        bytes.extend_from_slice(&compressed);
        Ok(bytes)
    } else {
        let mut bytes = Vec::with_capacity(json.len() + 1);
        bytes.push(ENCODING_RAW);
        bytes.extend_from_slice(&json);
        Ok(bytes)
    }
}

fn decode_leaf(bytes: &[u8]) -> Result<Value> {
    match bytes.split_first() {
        Some((&ENCODING_RAW, json)) => Ok(serde_json::from_slice(json)?),
        Some((&ENCODING_ZSTD, compressed)) => {
            let json = zstd::decode_all(compressed)?;
            Ok(serde_json::from_slice(&json)?)
        }
        Some((other, _)) => Err(JobError::internal(format!(
            "unknown leaf encoding {}",
            other
        ))),
        None => Err(JobError::internal("empty leaf value")),
    }
}
