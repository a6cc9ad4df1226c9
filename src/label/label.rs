//! Label - a named, ordered collection of typed elements.

use super::element::{LabelElement, PutOption, StoredElement};
use super::error::{LabelError, LabelResult};
use super::store::{KeyRange, OrderedStore};
use super::version::VersionSource;
use crate::clock::Clock;
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::Arc;

pub const DEFAULT_PAGE_SIZE: usize = 100;

/// Everything a label needs to read and write, shared by all labels of a set.
#[derive(Clone)]
pub(crate) struct LabelContext {
    pub(crate) store: Arc<dyn OrderedStore>,
    pub(crate) versions: Arc<dyn VersionSource>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) writer: String,
}

impl LabelContext {
    fn decode<E: LabelElement>(&self, bytes: &[u8]) -> LabelResult<StoredElement<E>> {
        let stored: StoredElement<E> = serde_json::from_slice(bytes)?;
        self.versions.observe(&stored.version);
        Ok(stored)
    }
}

/// Handle to one label. Cheap to clone.
///
/// Element ids are stored under `key_prefix`, which is empty when the
/// label owns its collection and `"{label}/"` when it shares a shard.
pub struct Label<E> {
    name: String,
    collection: String,
    key_prefix: String,
    ctx: Arc<LabelContext>,
    _marker: PhantomData<fn() -> E>,
}

impl<E> Clone for Label<E> {
    fn clone(&self) -> Self {
        Label {
            name: self.name.clone(),
            collection: self.collection.clone(),
            key_prefix: self.key_prefix.clone(),
            ctx: self.ctx.clone(),
            _marker: PhantomData,
        }
    }
}

impl<E> std::fmt::Debug for Label<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Label")
            .field("name", &self.name)
            .field("collection", &self.collection)
            .finish()
    }
}

impl<E: LabelElement> Label<E> {
    pub(crate) fn new(
        name: String,
        collection: String,
        key_prefix: String,
        ctx: Arc<LabelContext>,
    ) -> Self {
        Label {
            name,
            collection,
            key_prefix,
            ctx,
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Physical collection this label lives in.
    pub fn collection(&self) -> &str {
        &self.collection
    }

    fn key(&self, id: &str) -> String {
        format!("{}{}", self.key_prefix, id)
    }

    pub fn put(&self, element: E, option: PutOption) -> LabelResult<Option<E>> {
        let id = element.id().to_string();
        if id.is_empty() {
            return Err(LabelError::InvalidId);
        }
        let stored = StoredElement {
            version: self.ctx.versions.next_version(),
            modified_ms: self.ctx.clock.now().as_millis(),
            writer: self.ctx.writer.clone(),
            id,
            element,
        };
        let key = self.key(&stored.id);
        let bytes = serde_json::to_vec(&stored)?;

        match option {
            PutOption::Force => {
                self.ctx.store.put(&self.collection, &key, bytes)?;
                Ok(None)
            }
            PutOption::Default => match self.ctx.store.put(&self.collection, &key, bytes)? {
                Some(prev) => Ok(Some(self.ctx.decode::<E>(&prev)?.element)),
                None => Ok(None),
            },
            PutOption::IfAbsent => {
                match self.ctx.store.put_if_absent(&self.collection, &key, bytes)? {
                    Some(existing) => Ok(Some(self.ctx.decode::<E>(&existing)?.element)),
                    None => Ok(None),
                }
            }
        }
    }

    pub fn get(&self, id: &str) -> LabelResult<Option<E>> {
        Ok(self.get_stored(id)?.map(|s| s.element))
    }

    /// Element together with its version and writer.
    pub fn get_stored(&self, id: &str) -> LabelResult<Option<StoredElement<E>>> {
        match self.ctx.store.get(&self.collection, &self.key(id))? {
            Some(bytes) => Ok(Some(self.ctx.decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn remove(&self, id: &str) -> LabelResult<Option<E>> {
        match self.ctx.store.remove(&self.collection, &self.key(id))? {
            Some(bytes) => Ok(Some(self.ctx.decode::<E>(&bytes)?.element)),
            None => Ok(None),
        }
    }

    /// Every element in id order.
    pub fn result_page(&self, page_size: usize) -> LabelPage<E> {
        self.page(KeyRange::All, page_size)
    }

    pub fn starts_with(&self, prefix: &str) -> LabelPage<E> {
        self.page(KeyRange::prefix(prefix), DEFAULT_PAGE_SIZE)
    }

    /// Elements with `first <= id <= last`.
    pub fn search_range(&self, first: &str, last: &str) -> LabelPage<E> {
        self.page(KeyRange::between(first, last), DEFAULT_PAGE_SIZE)
    }

    pub fn scan(&self, range: &KeyRange, page_size: usize) -> LabelPage<E> {
        self.page(range.clone(), page_size)
    }

    fn page(&self, range: KeyRange, page_size: usize) -> LabelPage<E> {
        LabelPage::new(
            self.ctx.clone(),
            self.collection.clone(),
            range.within(&self.key_prefix),
            page_size,
        )
    }

    /// Deletes elements with `first <= id <= last`.
    pub fn remove_range(&self, first: &str, last: &str) -> LabelResult<usize> {
        let range = KeyRange::between(first, last).within(&self.key_prefix);
        Ok(self.ctx.store.remove_range(&self.collection, &range)?)
    }

    /// Deletes every element.
    pub fn clear(&self) -> LabelResult<usize> {
        let range = KeyRange::All.within(&self.key_prefix);
        Ok(self.ctx.store.remove_range(&self.collection, &range)?)
    }

    pub fn len(&self) -> LabelResult<usize> {
        let range = KeyRange::All.within(&self.key_prefix);
        let mut count = 0;
        let mut after: Option<String> = None;
        loop {
            let page = self
                .ctx
                .store
                .scan(&self.collection, &range, after.as_deref(), 1000)?;
            count += page.len();
            match page.into_iter().last() {
                Some((key, _)) => after = Some(key),
                None => return Ok(count),
            }
        }
    }

    pub fn is_empty(&self) -> LabelResult<bool> {
        let range = KeyRange::All.within(&self.key_prefix);
        Ok(self
            .ctx
            .store
            .scan(&self.collection, &range, None, 1)?
            .is_empty())
    }
}

/// Lazy iterator over a label range, fetched `page_size` keys at a time.
///
/// Each page continues strictly after the last key of the previous one, so
/// elements inserted behind the cursor are skipped and ones ahead of it are
/// picked up. A store error is yielded once and ends the iteration.
pub struct LabelPage<E> {
    ctx: Arc<LabelContext>,
    collection: String,
    range: KeyRange,
    page_size: usize,
    buffer: VecDeque<Vec<u8>>,
    last_key: Option<String>,
    exhausted: bool,
    _marker: PhantomData<fn() -> E>,
}

impl<E: LabelElement> LabelPage<E> {
    fn new(ctx: Arc<LabelContext>, collection: String, range: KeyRange, page_size: usize) -> Self {
        LabelPage {
            ctx,
            collection,
            range,
            page_size: page_size.max(1),
            buffer: VecDeque::new(),
            last_key: None,
            exhausted: false,
            _marker: PhantomData,
        }
    }

    /// Starts (or restarts) the iteration strictly after `key`.
    pub fn resume_after(mut self, key: impl Into<String>) -> Self {
        self.buffer.clear();
        self.last_key = Some(key.into());
        self.exhausted = false;
        self
    }

    /// Physical key of the last fetched page's final element.
    pub fn continuation(&self) -> Option<&str> {
        self.last_key.as_deref()
    }

    fn fetch(&mut self) -> LabelResult<()> {
        let page = self.ctx.store.scan(
            &self.collection,
            &self.range,
            self.last_key.as_deref(),
            self.page_size,
        )?;
        if page.len() < self.page_size {
            self.exhausted = true;
        }
        for (key, bytes) in page {
            self.last_key = Some(key);
            self.buffer.push_back(bytes);
        }
        Ok(())
    }
}

impl<E: LabelElement> Iterator for LabelPage<E> {
    type Item = LabelResult<E>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(bytes) = self.buffer.pop_front() {
                return Some(self.ctx.decode::<E>(&bytes).map(|s| s.element));
            }
            if self.exhausted {
                return None;
            }
            if let Err(e) = self.fetch() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }
    }
}
