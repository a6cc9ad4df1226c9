use super::store::StoreError;

/// Error type for label and label-set operations
#[derive(Debug)]
pub enum LabelError {
    /// `create_label` on a name that is already registered
    LabelExists(String),
    /// Name is empty after normalization
    InvalidName(String),
    /// Element id is empty
    InvalidId,
    /// Underlying ordered store failed
    Store(StoreError),
    /// Element could not be encoded or decoded
    Codec(serde_json::Error),
}

impl std::fmt::Display for LabelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LabelError::LabelExists(name) => write!(f, "Label already exists: {}", name),
            LabelError::InvalidName(name) => write!(f, "Invalid label name: {:?}", name),
            LabelError::InvalidId => write!(f, "Element id must not be empty"),
            LabelError::Store(e) => write!(f, "{}", e),
            LabelError::Codec(e) => write!(f, "Element codec error: {}", e),
        }
    }
}

impl std::error::Error for LabelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LabelError::Store(e) => Some(e),
            LabelError::Codec(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StoreError> for LabelError {
    fn from(e: StoreError) -> Self {
        LabelError::Store(e)
    }
}

impl From<serde_json::Error> for LabelError {
    fn from(e: serde_json::Error) -> Self {
        LabelError::Codec(e)
    }
}

pub type LabelResult<T> = Result<T, LabelError>;
