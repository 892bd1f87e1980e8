//! TarotSync storage routing.
//!
//! This crate decides where the application's data lives:
//! - [`StorageRouter`] delegates to local storage while signed out and to
//!   the remote adapter while signed in
//! - [`migrate_local_data`] pushes the local corpus to the server once, on
//!   the signed-out to signed-in transition

pub mod migration;
pub mod router;
pub mod state;

pub use migration::{migrate_local_data, MigrationReport};
pub use router::StorageRouter;
pub use state::{RouterPhase, RouterStatus};
