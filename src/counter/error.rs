use crate::config::ConfigError;
use crate::label::LabelError;

/// Error type for counter backends
#[derive(Debug)]
pub enum BackendError {
    /// Storage cannot be reached
    Unavailable(String),
    /// A bulk write matched fewer rows than it was given
    PartialBatch { expected: usize, matched: usize },
    /// Label store failure
    Label(LabelError),
    Other(String),
}

impl std::fmt::Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendError::Unavailable(msg) => write!(f, "Backend unavailable: {}", msg),
            BackendError::PartialBatch { expected, matched } => {
                write!(f, "Partial batch: matched {} of {}", matched, expected)
            }
            BackendError::Label(e) => write!(f, "Label store error: {}", e),
            BackendError::Other(msg) => write!(f, "Backend error: {}", msg),
        }
    }
}

impl std::error::Error for BackendError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BackendError::Label(e) => Some(e),
            _ => None,
        }
    }
}

impl From<LabelError> for BackendError {
    fn from(e: LabelError) -> Self {
        BackendError::Label(e)
    }
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Error type for counter and factory operations
#[derive(Debug)]
pub enum CounterError {
    /// `create_counter` on a name already registered with the factory
    CounterExists(String),
    Backend(BackendError),
    Config(ConfigError),
}

impl std::fmt::Display for CounterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CounterError::CounterExists(name) => write!(f, "Counter already exists: {}", name),
            CounterError::Backend(e) => write!(f, "{}", e),
            CounterError::Config(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for CounterError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CounterError::Backend(e) => Some(e),
            CounterError::Config(e) => Some(e),
            CounterError::CounterExists(_) => None,
        }
    }
}

impl From<BackendError> for CounterError {
    fn from(e: BackendError) -> Self {
        CounterError::Backend(e)
    }
}

impl From<ConfigError> for CounterError {
    fn from(e: ConfigError) -> Self {
        CounterError::Config(e)
    }
}
