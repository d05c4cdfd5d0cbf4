//! Grimoire - a reactive query cache and sync engine for offline-first
//! applications.
//!
//! This crate is a thin re-export over the client runtime, the reference
//! remote fixture, and the shared core types, so an application depending
//! on `grimoire` never has to reach into the individual crates directly.
//!
//! # Example
//!
//! ```ignore
//! use grimoire::GrimoireClient;
//!
//! let client = GrimoireClient::connect(&config, client_id, auth_token).await?;
//! let query_hash = client.query("thread", "SELECT * FROM thread", json!({}), ttl, vec!["thread".into()]).await?;
//! ```

// Re-export client runtime types.
pub use grimoire_client::{deterministic_client_id, GrimoireClient};
pub use grimoire_client::registry::SubscriptionId;

// Re-export the reference remote fixture, for applications standing up a
// local server for integration tests.
pub use grimoire_server::{build_router, AppState as Server};

// Re-export core types external applications need: configuration, error
// taxonomy, query hashing, wire models.
pub use grimoire_core::config::Config;
pub use grimoire_core::errors::{RuntimeError, RuntimeResult};
pub use grimoire_core::hash::QueryHash;
pub use grimoire_core::models::{CacheRecord, Incantation, RecordId, RecordVersionArray};
