//! The acting principal of a node: agent secret plus its current session.

use crate::crypto::{AgentSecret, CryptoProvider};
use crate::error::Result;
use crate::ids::{AgentId, SessionId};

#[derive(Debug, Clone)]
pub struct Identity {
    secret: AgentSecret,
    agent_id: AgentId,
    session_id: SessionId,
}

impl Identity {
    /// Start a fresh session for `secret`.
    pub fn new(crypto: &dyn CryptoProvider, secret: AgentSecret) -> Result<Self> {
        let agent_id = crypto.agent_id(&secret)?;
        let session_id = crypto.new_session_id(&agent_id);
        Ok(Self {
            secret,
            agent_id,
            session_id,
        })
    }

    /// Resume a known session, e.g. after a restart.
    pub fn with_session(
        crypto: &dyn CryptoProvider,
        secret: AgentSecret,
        session_id: SessionId,
    ) -> Result<Self> {
        let agent_id = crypto.agent_id(&secret)?;
        Ok(Self {
            secret,
            agent_id,
            session_id,
        })
    }

    pub fn secret(&self) -> &AgentSecret {
        &self.secret
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }
}
