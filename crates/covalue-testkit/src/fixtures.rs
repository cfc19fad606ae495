//! Test fixtures and helpers.
//!
//! Common setup code for integration tests. Nodes spawn storage tasks, so
//! fixtures must be created inside a tokio runtime.

use covalue::core::{AgentId, AgentSecret, DefaultCrypto, Identity};
use covalue::{LocalNode, Member, NodeConfig};

/// A test fixture with a deterministic identity and an in-memory node.
pub struct TestFixture {
    pub seed: [u8; 32],
    pub node: LocalNode,
}

impl TestFixture {
    /// Create a new test fixture with a random identity.
    pub fn new() -> Self {
        Self::with_seed(rand::random())
    }

    /// Create with a deterministic identity from seed.
    pub fn with_seed(seed: [u8; 32]) -> Self {
        Self::with_config(seed, NodeConfig::default())
    }

    pub fn with_config(seed: [u8; 32], config: NodeConfig) -> Self {
        Self {
            seed,
            node: LocalNode::in_memory(identity(seed), config),
        }
    }

    pub fn agent_id(&self) -> &AgentId {
        self.node.agent_id()
    }

    /// This fixture as a group member.
    pub fn member(&self) -> Member {
        Member::Agent(self.agent_id().clone())
    }
}

impl Default for TestFixture {
    fn default() -> Self {
        Self::new()
    }
}

/// Identity for `seed` with a fresh session.
pub fn identity(seed: [u8; 32]) -> Identity {
    Identity::new(&DefaultCrypto, AgentSecret::from_seed(&seed))
        .expect("seeded agent secret is always valid")
}

/// Create multiple test fixtures for multi-party tests.
pub fn multi_party_fixtures(count: usize) -> Vec<TestFixture> {
    (0..count)
        .map(|i| {
            let mut seed = [0u8; 32];
            seed[0] = i as u8;
            TestFixture::with_seed(seed)
        })
        .collect()
}

/// Install a fmt subscriber writing through the test harness.
///
/// Safe to call from every test; only the first call installs.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fixtures_are_distinct_and_deterministic() {
        let parties = multi_party_fixtures(3);
        assert_ne!(parties[0].agent_id(), parties[1].agent_id());
        assert_ne!(parties[1].agent_id(), parties[2].agent_id());

        let again = TestFixture::with_seed(parties[1].seed);
        assert_eq!(again.agent_id(), parties[1].agent_id());
        // Same agent, new session.
        assert_ne!(again.node.peer_id(), parties[1].node.peer_id());
    }

    #[tokio::test]
    async fn test_init_tracing_is_idempotent() {
        init_tracing();
        init_tracing();
    }
}
