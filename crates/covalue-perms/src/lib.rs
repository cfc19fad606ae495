//! # CoValue Permissions
//!
//! Groups, roles, and key revelation.
//!
//! ## Overview
//!
//! A group is itself a CoValue: a map whose keys are member agents, key
//! revelations, and parent/child references. Its state is never stored; it
//! is computed by replaying the group's transactions in `madeAt` order and
//! rejecting every transaction its author was not allowed to make.
//!
//! CoValues owned by a group accept a transaction when its author held a
//! writing role in the group at the time the transaction was made.
//!
//! ## Key Types
//!
//! - [`Role`]: A member's role, including invite roles
//! - [`GroupState`]: The replayed state of one group
//! - [`CoValueArena`]: Where groups look up parents, children and owners
//! - [`Member`]: The target of a role assignment
//!
//! ## Encryption Model
//!
//! Each group has a current read key. Members receive it sealed to their
//! sealer; `everyone` receives it in the clear. Rotating the key encrypts the
//! previous key under the new one, so history stays readable to whoever
//! holds the new key. Parent groups receive child keys encrypted under the
//! parent's own key.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::collections::BTreeMap;
//! use std::sync::Arc;
//! use covalue_core::{AgentSecret, DefaultCrypto, Identity, TransactionConfig};
//! use covalue_perms::{add_member, create_group, Member, Role};
//!
//! let crypto = Arc::new(DefaultCrypto);
//! let admin = Identity::new(crypto.as_ref(), AgentSecret::from_seed(&[1; 32])).unwrap();
//! let mut arena = BTreeMap::new();
//! let group = create_group(&mut arena, &admin, crypto.clone(), &TransactionConfig::default(), 1).unwrap();
//!
//! let friend = Identity::new(crypto.as_ref(), AgentSecret::from_seed(&[2; 32])).unwrap();
//! add_member(&mut arena, &admin, &group, &Member::Agent(friend.agent_id().clone()), Role::Reader, 2).unwrap();
//! ```

pub mod arena;
pub mod error;
pub mod group;
pub mod keys;
pub mod role;
pub mod state;

pub use arena::CoValueArena;
pub use error::{PermsError, Result};
pub use group::{
    accept_invite, add_member, can_delete, create_group, create_invite, extend, get_read_key,
    remove_member, revoke_extend, role_of, rotate_read_key, valid_transactions, Member,
};
pub use keys::{current_read_key, current_write_key, read_key_by_id};
pub use role::{is_higher_role, ParentRole, Role};
pub use state::{check_role_assignment, AssignmentDenial, GroupEntry, GroupState};
