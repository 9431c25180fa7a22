use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Failure classes, by when they can occur and what they abort.
///
/// `Construction` surfaces at rule registration or collection declaration,
/// never during a tick. `Evaluation` aborts the current tick only; nothing
/// from that tick is persisted or applied. `Store` means the backing store
/// could not acknowledge a tick after bounded retries; continuing would let
/// live state diverge from the audit trail, so it is fatal to the caller.
#[derive(Debug, Error)]
pub enum Error {
    #[error("construction error: {0}")]
    Construction(String),
    #[error("evaluation error: {0}")]
    Evaluation(String),
    #[error("store error: {0}")]
    Store(String),
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Store(e.to_string())
    }
}
