// Adapters layer: concrete implementations of the domain ports (storage, database, locks, metrics).

pub mod local;
pub mod lock;
pub mod metrics;
#[cfg(feature = "s3")]
pub mod s3;
pub mod sqlite;
