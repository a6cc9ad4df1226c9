//! LabelSet - a namespace of labels over one ordered store.
//!
//! ## Physical layout
//!
//! ```text
//! {set}:labels              registry, one LabelInfo per label
//! {set}/{label}             elements of a label (shards = 0)
//! {set}#shard{n}            elements of every label hashing to n,
//!                           keyed "{label}/{id}" (shards > 0)
//! ```
//!
//! Names are normalized to `[A-Za-z0-9_.-]`, so the `:`, `/` and `#`
//! separators keep every set's collections apart.
//!
//! Shard routing hashes the normalized label name with FNV-1a, which is
//! stable across processes and builds.

use super::element::LabelElement;
use super::error::{LabelError, LabelResult};
use super::label::{Label, LabelContext};
use super::store::{KeyRange, OrderedStore};
use super::version::{LamportVersions, VersionSource};
use crate::clock::{Clock, SystemClock};
use fnv::FnvHasher;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::hash::Hasher;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, info};

/// Longest normalized set or label name, in bytes.
pub const MAX_NAME_LEN: usize = 120;

const REGISTRY_PAGE: usize = 500;

/// Registry record for one label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelInfo {
    pub name: String,
    pub created_ms: u64,
    pub writer: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

/// Maps a caller-supplied name onto the storage-safe alphabet
/// `[A-Za-z0-9_.-]`; anything else becomes `_`.
///
/// Distinct inputs may normalize to the same name.
pub fn normalize_name(name: &str) -> LabelResult<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(LabelError::InvalidName(name.to_string()));
    }
    let mut out = normalize_chars(trimmed);
    if out.len() > MAX_NAME_LEN {
        out.truncate(MAX_NAME_LEN);
    }
    Ok(out)
}

fn normalize_chars(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Shard for a normalized label name.
pub fn shard_for(label: &str, shards: u32) -> u32 {
    let mut hasher = FnvHasher::default();
    hasher.write(label.as_bytes());
    (hasher.finish() % u64::from(shards.max(1))) as u32
}

/// Namespace of labels holding elements of type `E`.
pub struct LabelSet<E> {
    name: String,
    shards: u32,
    ctx: Arc<LabelContext>,
    _marker: PhantomData<fn() -> E>,
}

impl<E> Clone for LabelSet<E> {
    fn clone(&self) -> Self {
        LabelSet {
            name: self.name.clone(),
            shards: self.shards,
            ctx: self.ctx.clone(),
            _marker: PhantomData,
        }
    }
}

impl<E: LabelElement> LabelSet<E> {
    /// Opens set `name` for `writer`, with Lamport versions, the system
    /// clock and one collection per label.
    pub fn new(store: Arc<dyn OrderedStore>, name: &str, writer: &str) -> LabelResult<Self> {
        let name = normalize_name(name)?;
        let writer = normalize_name(writer)?;
        Ok(LabelSet {
            name,
            shards: 0,
            ctx: Arc::new(LabelContext {
                store,
                versions: Arc::new(LamportVersions::new(writer.clone())),
                clock: SystemClock::shared(),
                writer,
            }),
            _marker: PhantomData,
        })
    }

    /// Co-locates labels in `shards` shared collections; 0 disables.
    pub fn with_shards(mut self, shards: u32) -> Self {
        self.shards = shards;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        let mut ctx = (*self.ctx).clone();
        ctx.clock = clock;
        self.ctx = Arc::new(ctx);
        self
    }

    pub fn with_versions(mut self, versions: Arc<dyn VersionSource>) -> Self {
        let mut ctx = (*self.ctx).clone();
        ctx.versions = versions;
        self.ctx = Arc::new(ctx);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shards(&self) -> u32 {
        self.shards
    }

    pub fn writer(&self) -> &str {
        &self.ctx.writer
    }

    fn registry(&self) -> String {
        format!("{}:labels", self.name)
    }

    /// Physical collection for a normalized label name.
    pub fn collection_for(&self, label: &str) -> String {
        if self.shards == 0 {
            format!("{}/{}", self.name, label)
        } else {
            format!("{}#shard{}", self.name, shard_for(label, self.shards))
        }
    }

    fn handle(&self, label: String) -> Label<E> {
        let collection = self.collection_for(&label);
        let key_prefix = if self.shards == 0 {
            String::new()
        } else {
            format!("{}/", label)
        };
        Label::new(label, collection, key_prefix, self.ctx.clone())
    }

    fn new_info(&self, name: &str, attributes: BTreeMap<String, String>) -> LabelInfo {
        LabelInfo {
            name: name.to_string(),
            created_ms: self.ctx.clock.now().as_millis(),
            writer: self.ctx.writer.clone(),
            attributes,
        }
    }

    /// Opens a label, registering it if needed. Racing openers converge on
    /// the first registration.
    pub fn open_label(&self, name: &str) -> LabelResult<Label<E>> {
        self.open_label_with(name, BTreeMap::new())
    }

    /// Like [`open_label`](Self::open_label); `attributes` only apply when
    /// this call registers the label.
    pub fn open_label_with(
        &self,
        name: &str,
        attributes: BTreeMap<String, String>,
    ) -> LabelResult<Label<E>> {
        let name = normalize_name(name)?;
        let info = serde_json::to_vec(&self.new_info(&name, attributes))?;
        match self.ctx.store.put_if_absent(&self.registry(), &name, info)? {
            Some(_) => debug!(set = %self.name, label = %name, "opened existing label"),
            None => info!(set = %self.name, label = %name, "registered label"),
        }
        Ok(self.handle(name))
    }

    /// Registers a new label; fails if the name is taken.
    pub fn create_label(&self, name: &str) -> LabelResult<Label<E>> {
        self.create_label_with(name, BTreeMap::new())
    }

    pub fn create_label_with(
        &self,
        name: &str,
        attributes: BTreeMap<String, String>,
    ) -> LabelResult<Label<E>> {
        let name = normalize_name(name)?;
        let info = serde_json::to_vec(&self.new_info(&name, attributes))?;
        if self
            .ctx
            .store
            .put_if_absent(&self.registry(), &name, info)?
            .is_some()
        {
            return Err(LabelError::LabelExists(name));
        }
        info!(set = %self.name, label = %name, "created label");
        Ok(self.handle(name))
    }

    pub fn get_label(&self, name: &str) -> LabelResult<Option<Label<E>>> {
        let name = normalize_name(name)?;
        match self.ctx.store.get(&self.registry(), &name)? {
            Some(_) => Ok(Some(self.handle(name))),
            None => Ok(None),
        }
    }

    pub fn contains_label(&self, name: &str) -> LabelResult<bool> {
        Ok(self.get_label(name)?.is_some())
    }

    /// Registry records of every label whose normalized name starts with
    /// `prefix`, in name order.
    pub fn label_infos(&self, prefix: &str) -> LabelResult<Vec<LabelInfo>> {
        let range = KeyRange::prefix(normalize_chars(prefix));
        let registry = self.registry();
        let mut infos = Vec::new();
        let mut after: Option<String> = None;
        loop {
            let page = self
                .ctx
                .store
                .scan(&registry, &range, after.as_deref(), REGISTRY_PAGE)?;
            let done = page.len() < REGISTRY_PAGE;
            for (key, bytes) in page {
                infos.push(serde_json::from_slice::<LabelInfo>(&bytes)?);
                after = Some(key);
            }
            if done {
                return Ok(infos);
            }
        }
    }

    pub fn label_names(&self, prefix: &str) -> LabelResult<Vec<String>> {
        Ok(self
            .label_infos(prefix)?
            .into_iter()
            .map(|info| info.name)
            .collect())
    }

    /// Unregisters a label and deletes its elements.
    pub fn drop_label(&self, name: &str) -> LabelResult<bool> {
        let name = normalize_name(name)?;
        if self.ctx.store.remove(&self.registry(), &name)?.is_none() {
            return Ok(false);
        }
        let removed = self.handle(name.clone()).clear()?;
        info!(set = %self.name, label = %name, removed, "dropped label");
        Ok(true)
    }
}
