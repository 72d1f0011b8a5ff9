//! fleetgrid-state: versioned config store for fleetgrid.
//!
//! Backed by [redb](https://docs.rs/redb). Each [`Config`] is JSON-serialized
//! whole into one row of the `configs` table and carries a version used for
//! compare-and-swap: every write presents the version it read and the store
//! bumps it by exactly one, or rejects the write as dirty.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod retry;
pub mod store;
pub mod tables;
pub mod transition;
pub mod types;

pub use error::{StateError, StateResult};
pub use retry::{RetryConfig, retry_with_backoff};
pub use store::StateStore;
pub use transition::valid_state_transition;
pub use types::*;
