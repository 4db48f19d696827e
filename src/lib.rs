pub mod common;
pub mod comm;
pub mod error;
pub mod protocol;
pub mod trace;
pub mod worker;

pub use error::DsError;

pub type Result<T> = std::result::Result<T, DsError>;
