//! # CoValue
//!
//! Local-first, multi-writer replicated data: signed per-session
//! transaction logs, group permissions with key rotation, and known-state
//! sync between nodes.
//!
//! ## Overview
//!
//! A [`LocalNode`] acts for one identity. It creates groups and CoMaps,
//! writes to them (encrypted under the owning group's read key), persists
//! everything through storage, and keeps peers up to date.
//!
//! ## Key Concepts
//!
//! - **CoValue**: a header plus one append-only, hash-chained log per session.
//! - **Group**: a CoValue whose entries are members, roles and revealed keys.
//! - **Known state**: per session, how many transactions a party holds.
//! - **Tombstone**: a deleted CoValue keeps only its header and delete session.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use covalue::{LocalNode, NodeConfig};
//! use covalue::core::AgentSecret;
//! use serde_json::json;
//!
//! async fn example() -> covalue::Result<()> {
//!     let identity = LocalNode::identity_from_secret(AgentSecret::from_seed(&[7; 32]))?;
//!     let node = LocalNode::open(identity, "covalue.db", NodeConfig::default())?;
//!
//!     let group = node.create_group()?;
//!     let map = node.create_map(&group, None)?;
//!     node.set(&map, "title", json!("hello"))?;
//!
//!     assert_eq!(node.read_map(&map)?.get("title"), Some(&json!("hello")));
//!     node.shutdown().await
//! }
//! ```
//!
//! ## Re-exports
//!
//! This crate re-exports the component crates for convenience:
//!
//! - `covalue::core` - ids, headers, session logs, crypto
//! - `covalue::perms` - roles, groups and keys
//! - `covalue::store` - storage API, SQLite and in-memory clients
//! - `covalue::sync` - sync protocol and peers

pub mod comap;
pub mod error;
pub mod node;

// Re-export component crates
pub use covalue_core as core;
pub use covalue_perms as perms;
pub use covalue_store as store;
pub use covalue_sync as sync;

// Re-export main types for convenience
pub use comap::{CoMapView, MapEntry};
pub use error::{NodeError, Result};
pub use node::{Connection, LocalNode, NodeConfig};

// Re-export commonly used types
pub use covalue_core::{AgentId, AgentSecret, CoId, Identity};
pub use covalue_perms::{Member, Role};
