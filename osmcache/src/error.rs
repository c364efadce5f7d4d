use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// A referenced entity is not in the store. Callers decide whether this
    /// is tolerable (dangling references usually are).
    #[error("not found")]
    NotFound,

    /// The store is in the wrong mode for the requested operation, e.g. a
    /// random read while the coord store is still in linear-import mode.
    #[error("mode violation: {0}")]
    Mode(&'static str),

    /// A persisted record failed to decode.
    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Backend(#[from] rocksdb::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
