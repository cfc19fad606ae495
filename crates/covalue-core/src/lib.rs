//! # CoValue Core
//!
//! Pure primitives for covalue replication: identifiers, crypto, session
//! logs and the content pieces they are shipped in.
//!
//! This crate contains no I/O, no storage, no networking. It is pure
//! computation over signed, hash-chained transaction logs.
//!
//! ## Key Types
//!
//! - [`CoValueCore`] - Header plus every session of one CoValue
//! - [`SessionLog`] - One append-only, signed transaction sequence
//! - [`KnownState`] - Transaction count per session, the sync currency
//! - [`NewContent`] - A CONTENT piece carrying new transactions
//! - [`CryptoProvider`] - Signing, sealing, encryption and hashing
//!
//! ## Stable Serialization
//!
//! Everything that is hashed or signed is first encoded with sorted object
//! keys. See the [`stable`] module.

#[macro_use]
pub mod ids;

pub mod content;
pub mod covalue;
pub mod crypto;
pub mod error;
pub mod header;
pub mod identity;
pub mod known_state;
pub mod session_log;
pub mod session_map;
pub mod stable;
pub mod transaction;

pub use content::{assemble_pieces, CoValuePriority, NewContent, SessionNewContent};
pub use covalue::{
    content_dependencies, delete_marker, dependencies_of, CoValueCore, LoggedTransaction,
    TransactionConfig,
};
pub use crypto::{
    AgentSecret, CryptoProvider, DefaultCrypto, Encrypted, Hash, KeySecret, Sealed, ShortHash,
    Signature, StreamingHash,
};
pub use error::{CoreError, Result};
pub use header::{CoValueHeader, CoValueType, Ruleset};
pub use identity::Identity;
pub use ids::{AgentId, CoId, KeyId, SealerId, SessionId, SignerId, TransactionId};
pub use known_state::{
    combine_sessions, is_sessions_subset, peer_has_all_content, sessions_to_send, KnownSessions,
    KnownState,
};
pub use session_log::{exceeds_recommended_size, SessionLog, MAX_RECOMMENDED_TX_SIZE};
pub use session_map::SessionMap;
pub use stable::{stable_bytes, stable_stringify};
pub use transaction::{MapOp, Privacy, PrivateTransaction, Transaction, TrustingTransaction};
