use super::version::VersionTag;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// A typed record stored in a [`Label`](super::Label), keyed by its id.
pub trait LabelElement: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    fn id(&self) -> &str;
}

/// Element plus the bookkeeping written alongside it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredElement<E> {
    pub id: String,
    pub version: VersionTag,
    pub modified_ms: u64,
    pub writer: String,
    pub element: E,
}

/// Write mode for [`Label::put`](super::Label::put).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PutOption {
    /// Overwrite and return the previous element.
    #[default]
    Default,
    /// Insert only if the id is missing; otherwise return the existing
    /// element and leave it untouched.
    IfAbsent,
    /// Blind overwrite; the previous element is not read back.
    Force,
}
