//! Label Store
//!
//! Typed, ordered element collections ("labels") grouped into namespaces
//! ("label sets") over any [`OrderedStore`].
//!
//! ```text
//! LabelSet<E> ──► registry ({set}:labels)
//!      │
//!      └─► Label<E> ──► OrderedStore collection ──► StoredElement<E> (JSON)
//! ```
//!
//! Writes stamp each element with a [`VersionTag`], the writer id and a
//! last-modified time. Range reads are lazy [`LabelPage`] iterators.

mod element;
mod error;
mod label;
mod set;
mod store;
mod version;


pub use element::{LabelElement, PutOption, StoredElement};
pub use error::{LabelError, LabelResult};
pub use label::{Label, LabelPage, DEFAULT_PAGE_SIZE};
pub use set::{normalize_name, shard_for, LabelInfo, LabelSet, MAX_NAME_LEN};
pub use store::{InMemoryOrderedStore, KeyRange, OrderedStore, StoreError, StoreResult};
pub use version::{LamportVersions, VersionSource, VersionTag};
