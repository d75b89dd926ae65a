//! Config store backends
//!
//! The `ConfigStore` trait is the single capability every configuration
//! source implements; the long-poll coordinator only sees the trait.
//!
//! ## Backends
//!
//! - **In-Memory** (default without configuration): no persistence
//! - **SQLite** (feature `storage-sqlite`): embedded database file
//!
//! ## Usage
//!
//! ```no_run
//! use poolsync::storage::{ConfigStore, sqlite::SqliteConfigStore};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = SqliteConfigStore::new("./poolsync.db").await?;
//!     store.health_check().await?;
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod error;
pub mod memory;
#[cfg(feature = "storage-sqlite")]
pub mod sqlite;

pub use backend::{ConfigChange, ConfigStore};
pub use error::{StoreError, StoreResult};
pub use memory::MemoryConfigStore;
