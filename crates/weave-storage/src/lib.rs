//! Filesystem session persistence for Weave.

pub mod error;
pub mod paths;
pub mod session_store;

pub use error::{Result, StorageError};
pub use session_store::SessionStore;
