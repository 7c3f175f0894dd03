pub mod cache;
pub mod clock;
pub mod config;
pub mod constants;
pub mod coordinator;
pub mod credentials;
pub mod engine;
pub mod error;
pub mod events;
pub mod models;
pub mod scheduler;
pub mod store;

pub use error::{BackupError, Result};

#[cfg(test)]
pub(crate) mod test_support;
