//! CONTENT pieces: the unit in which history is shipped between peers.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::crypto::Signature;
use crate::header::CoValueHeader;
use crate::ids::{CoId, SessionId};
use crate::known_state::KnownSessions;
use crate::transaction::Transaction;

/// Delivery priority, derived from the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CoValuePriority {
    High,
    Medium,
    Low,
}

impl CoValuePriority {
    /// Groups and accounts unblock everything they own; binary streams can wait.
    pub fn from_header(header: &CoValueHeader) -> Self {
        if header.is_group() || header.is_account() {
            CoValuePriority::High
        } else if header.is_binary_stream() {
            CoValuePriority::Low
        } else {
            CoValuePriority::Medium
        }
    }
}

/// New transactions of one session, continuing after index `after`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionNewContent {
    pub after: u32,
    pub new_transactions: Vec<Transaction>,
    pub last_signature: Signature,
}

/// One CONTENT piece.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewContent {
    pub id: CoId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<CoValueHeader>,
    pub priority: CoValuePriority,
    pub new: BTreeMap<SessionId, SessionNewContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expect_content_until: Option<KnownSessions>,
}

impl NewContent {
    pub fn new(id: CoId, priority: CoValuePriority) -> Self {
        Self {
            id,
            header: None,
            priority,
            new: BTreeMap::new(),
            expect_content_until: None,
        }
    }

    /// True when the piece carries neither a header nor transactions.
    pub fn is_empty(&self) -> bool {
        self.header.is_none() && self.new.is_empty()
    }

    /// Number of transactions across all sessions.
    pub fn transaction_count(&self) -> usize {
        self.new.values().map(|s| s.new_transactions.len()).sum()
    }
}

/// Assemble ordered pieces from per-session spans.
///
/// `spans[session][k]` is the k-th span of that session. Piece `k` holds the
/// k-th span of every session, so each session stays in order across pieces
/// and checkpoint boundaries decide the piece count.
pub fn assemble_pieces(
    id: &CoId,
    header: Option<&CoValueHeader>,
    priority: CoValuePriority,
    spans: BTreeMap<SessionId, Vec<SessionNewContent>>,
    expect_content_until: Option<KnownSessions>,
    force_expectation: bool,
) -> Vec<NewContent> {
    let mut first = NewContent::new(id.clone(), priority);
    first.header = header.cloned();
    let mut pieces = vec![first];

    for (session_id, session_spans) in spans {
        for (k, span) in session_spans.into_iter().enumerate() {
            while pieces.len() <= k {
                pieces.push(NewContent::new(id.clone(), priority));
            }
            pieces[k].new.insert(session_id.clone(), span);
        }
    }

    pieces.retain(|p| !p.is_empty());

    if pieces.len() > 1 || force_expectation {
        if let (Some(first), Some(until)) = (pieces.first_mut(), expect_content_until) {
            if !until.is_empty() {
                first.expect_content_until = Some(until);
            }
        }
    }

    pieces
}
