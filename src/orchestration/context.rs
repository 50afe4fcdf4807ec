use super::{chain::Chain, leg::LegId};
use crate::{
    broker::SessionKey,
    error::Result,
    routing::{RoutingSnapshot, Ruleset},
    sip::DialogId,
};
use rsip::Request;
use std::{collections::HashSet, fmt, sync::Arc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Initial,
    Chaining,
    WaitingForImScf {
        ack_from_imscf: bool,
        ack_to_imscf: bool,
    },
    SessionOngoing,
    SessionEnding,
    InternalError,
    End,
}

impl SessionState {
    pub fn waiting() -> Self {
        SessionState::WaitingForImScf {
            ack_from_imscf: false,
            ack_to_imscf: false,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Initial => "Initial",
            SessionState::Chaining => "Chaining",
            SessionState::WaitingForImScf { .. } => "WaitingForImScf",
            SessionState::SessionOngoing => "SessionOngoing",
            SessionState::SessionEnding => "SessionEnding",
            SessionState::InternalError => "InternalError",
            SessionState::End => "End",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Mutable state of one orchestrated session. Only touched from the
/// session's mailbox drain routine.
#[derive(Debug)]
pub struct SessionContext {
    pub key: SessionKey,
    pub state: SessionState,
    pub chain: Chain,
    /// Leg most recently invited or acted upon.
    pub current: LegId,
    pub pending_dialogs: HashSet<DialogId>,
    pub reliable_response_processing: bool,
    pub bye_initiated_by_calling_party: bool,
    pub last_incoming_invite: Option<Request>,
    /// (Call-ID, top Via branch) of every INVITE accepted so far.
    pub seen_invites: HashSet<(String, String)>,
    pub ruleset: Arc<Ruleset>,
    pub routing: Arc<RoutingSnapshot>,
    pub finished: bool,
}

impl SessionContext {
    pub fn new(key: SessionKey, ruleset: Arc<Ruleset>, routing: Arc<RoutingSnapshot>) -> Result<Self> {
        let chain = Chain::build(&ruleset, &routing)?;
        let current = chain.a();
        Ok(Self {
            key,
            state: SessionState::Initial,
            chain,
            current,
            pending_dialogs: HashSet::new(),
            reliable_response_processing: false,
            bye_initiated_by_calling_party: false,
            last_incoming_invite: None,
            seen_invites: HashSet::new(),
            ruleset,
            routing,
            finished: false,
        })
    }

    /// Rebuilds the chain after `anchor` from the session's ruleset.
    pub fn rollback(&mut self, anchor: LegId) -> Result<()> {
        self.chain.rollback(anchor, &self.ruleset, &self.routing)
    }
}
