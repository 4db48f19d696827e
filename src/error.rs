use thiserror::Error;

#[derive(Debug, Error)]
pub enum DsError {
    #[error("IO error: {0}")]
    IOError(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    SerializationError(#[from] rmp_serde::encode::Error),

    #[error("deserialization error: {0}")]
    DeserializationError(#[from] rmp_serde::decode::Error),

    #[error("value decode error: {0}")]
    ValueDecodeError(#[from] rmpv::decode::Error),

    #[error("{0}")]
    GenericError(String),
}

impl From<&str> for DsError {
    fn from(error: &str) -> Self {
        DsError::GenericError(error.to_owned())
    }
}

impl From<String> for DsError {
    fn from(error: String) -> Self {
        DsError::GenericError(error)
    }
}
