//! # Lighthouse
//!
//! Assurance-contract crowdfunding directly on Bitcoin: participants
//! publish signed transaction fragments ("pledges") committing specific
//! coins toward a shared goal. Once pledges summing to the goal are
//! collected, anyone can combine them into a single transaction that
//! delivers the money atomically; until then every participant can reclaim
//! their coins by spending them elsewhere. Nobody ever custodies anyone
//! else's funds.
//!
//! ## Modules
//! - [`wire`]: binary project/pledge/status messages and canonical hashing.
//! - [`project`]: validated project view, local pledge checks, contract
//!   assembly.
//! - [`pledge`]: pledge records, identities and scrubbing.
//! - [`engine`]: the single-threaded cooperative event loop owning all
//!   mutable state.
//! - [`networking`]: the Bitcoin peer group behind the `BitcoinView`
//!   capability.
//! - [`disk`]: app-directory watcher and atomic persistence.
//! - [`mirror`]: observable containers mirrored onto consumer executors.
//! - [`api`]: the HTTP pledge relay.
//! - [`wallet`]: the wallet capability and a keystore-backed reference
//!   implementation.
//! - [`configuration`]: layered CLI/env/file configuration.

pub mod api;
pub mod configuration;
pub mod disk;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod logging;
pub mod mirror;
pub mod networking;
pub mod pledge;
pub mod project;
pub mod wallet;
pub mod wire;

pub use crate::api::AppState;
pub use crate::engine::{Engine, EngineHandle};
