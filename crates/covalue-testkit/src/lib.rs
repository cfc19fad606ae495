//! # CoValue Testkit
//!
//! Testing utilities for CoValue nodes.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Fixtures**: deterministic identities and in-memory nodes
//! - **Generators**: Proptest strategies for CoMap operations and JSON values
//! - **Tracing**: a test-writer subscriber, installed at most once
//!
//! ## Property Testing
//!
//! Use the generators with proptest:
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use covalue_testkit::generators::{fold_map_ops, map_ops};
//!
//! proptest! {
//!     #[test]
//!     fn folding_is_deterministic(ops in map_ops(20)) {
//!         prop_assert_eq!(fold_map_ops(&ops), fold_map_ops(&ops));
//!     }
//! }
//! ```
//!
//! ## Test Fixtures
//!
//! Quickly set up test scenarios:
//!
//! ```rust,no_run
//! use covalue_testkit::fixtures::TestFixture;
//!
//! async fn example() {
//!     let fixture = TestFixture::with_seed([1; 32]);
//!     let group = fixture.node.create_group().unwrap();
//! }
//! ```

pub mod fixtures;
pub mod generators;

pub use fixtures::{identity, init_tracing, multi_party_fixtures, TestFixture};
pub use generators::{fold_map_ops, json_value, map_op, map_ops};
