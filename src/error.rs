use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("object storage error: {0}")]
    Storage(#[from] object_store::Error),

    #[error("event encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("bad record magic")]
    BadMagic,

    #[error("unknown record kind {0}")]
    UnknownRecordKind(u8),

    #[error("unknown compression tag {0}")]
    UnknownCompression(u8),

    #[error("truncated record payload")]
    TruncatedRecord,

    #[error("malformed url {0:?}")]
    BadUrl(String),

    #[error("bad url scheme in {0:?}")]
    BadUrlScheme(String),

    #[error("detector map asset {0:?} is missing")]
    MissingAsset(String),
}
