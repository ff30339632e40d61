use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Top level error surfaced by computing a node.
///
/// Every error is surfaced immediately. The only condition that is ever turned
/// into a recomputation is a storage reporting that a key is absent, which is
/// not an error at all (`Ok(None)` from [`Storage::load`](crate::Storage::load)).
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Task '{key}': stored entry is present but unreadable.\n{source}")]
    Decode { key: String, source: DecodeError },

    #[error("Task '{key}': result could not be encoded.\n{source}")]
    Encode { key: String, source: EncodeError },

    #[error(transparent)]
    Dependency(#[from] DependencyResolutionError),

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("Task '{key}':\n{source}")]
    Run { key: String, source: anyhow::Error },

    #[error("Task '{key}' panicked: {message}")]
    Panic { key: String, message: String },
}

/// Backend failure other than "not found".
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error on '{key}'.\n{source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Key '{0}' can't be used with this storage")]
    InvalidKey(String),

    #[error("Storage lock was poisoned by a panicking writer")]
    Poisoned,

    #[error("Operation '{0}' is not supported by this storage")]
    Unsupported(&'static str),

    #[error("Can't write to an empty storage chain")]
    EmptyChain,

    #[error("Unsupported storage location '{0}'")]
    UnsupportedScheme(String),
}

impl StorageError {
    pub(crate) fn io(key: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            key: key.into(),
            source,
        }
    }
}

/// A stage of an encoding pipeline failed on the way in.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("Stage '{stage}' failed to encode.\n{source}")]
    Stage {
        stage: String,
        source: anyhow::Error,
    },

    #[error("Pipeline without a serializer can only store byte values")]
    NotBytes,
}

/// Stored bytes could not be turned back into a value.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Stage '{stage}' failed to decode.\n{source}")]
    Stage {
        stage: String,
        source: anyhow::Error,
    },
}

/// Raised while turning explicit arguments into a frozen bound-argument set.
#[derive(Debug, Error)]
pub enum DependencyResolutionError {
    #[error("Task '{task}': dependency '{name}' failed to resolve.\n{source}")]
    Resolver {
        task: String,
        name: String,
        source: anyhow::Error,
    },

    #[error("Task '{task}': parameter '{name}' has no explicit value, default, or dependency")]
    Missing { task: String, name: String },

    #[error("Task '{task}': unexpected argument '{name}'")]
    UnknownArgument { task: String, name: String },
}

/// A task declaration is inconsistent.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Task '{task}': run expects '{name}', which is not declared")]
    UndeclaredParameter { task: String, name: String },

    #[error("Task '{task}': parameter '{name}' is declared twice")]
    DuplicateParameter { task: String, name: String },

    #[error("Task '{task}': dependency '{name}' is declared twice")]
    DuplicateDependency { task: String, name: String },

    #[error("Task name can't be empty")]
    EmptyName,

    #[error("Task defined by a closure needs an explicit name")]
    UnnamedClosure,
}
