use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Storage write failed: {0}")]
    StorageWrite(String),

    #[error("Storage read failed: {0}")]
    StorageRead(String),

    #[error("Metadata store error: {0}")]
    MetadataStore(String),

    #[error("Video {0} not found")]
    NotFound(Uuid),

    #[error("Probe failed: {0}")]
    Probe(String),

    #[error("Frame extraction failed: {0}")]
    Extraction(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Enrichment queue is closed")]
    QueueClosed,
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<diesel::result::Error> for Error {
    fn from(err: diesel::result::Error) -> Self {
        Error::MetadataStore(err.to_string())
    }
}

impl From<deadpool::managed::PoolError<diesel_async::pooled_connection::PoolError>> for Error {
    fn from(err: deadpool::managed::PoolError<diesel_async::pooled_connection::PoolError>) -> Self {
        Error::MetadataStore(format!("connection pool: {}", err))
    }
}
