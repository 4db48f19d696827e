pub mod batched;
mod connection;

pub use connection::{connect_to, ConnectionCache, ConnectionCacheRef, DaskConnection};
