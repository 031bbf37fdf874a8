use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use mio::Token;
use tracing::debug;

use crate::{guard, reactor::Handle, session::Session};

/// Result of a JOIN name claim.
#[derive(Debug, PartialEq, Eq)]
pub enum BindOutcome {
    Bound,
    Collision,
}

/// The authoritative map of live sessions. One lock guards the map; policy
/// decisions (name uniqueness, broadcast eligibility) are made inside the
/// critical section, while enqueueing to recipients happens outside it on a
/// snapshot.
#[derive(Default)]
pub struct Registry {
    sessions: Mutex<HashMap<Token, Arc<Session>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, session: Arc<Session>) {
        guard(&self.sessions).insert(session.token(), session);
    }

    pub fn lookup(&self, token: Token) -> Option<Arc<Session>> {
        guard(&self.sessions).get(&token).cloned()
    }

    /// Removes and deregisters in one critical section, so a racing event
    /// dispatch cannot observe the token half-dead. Returning `None` makes
    /// this the once-guard for the whole disconnect sequence.
    pub fn remove(&self, token: Token, handle: &Handle) -> Option<Arc<Session>> {
        let mut map = guard(&self.sessions);
        let session = map.remove(&token)?;
        session.deregister(handle);
        debug!(token = token.0, remaining = map.len(), "registry: removed");
        Some(session)
    }

    /// Claims `name` for `session` if no live session holds it. Atomic with
    /// respect to concurrent claims: the scan and the bind share the lock.
    pub fn try_bind_name(&self, session: &Session, name: &str) -> BindOutcome {
        let map = guard(&self.sessions);
        if map.values().any(|s| s.name() == Some(name)) {
            return BindOutcome::Collision;
        }
        session.bind_name(name);
        BindOutcome::Bound
    }

    /// Sorted roster snapshot for the INITIAL reply.
    pub fn online_names_excluding(&self, token: Token) -> Vec<String> {
        let map = guard(&self.sessions);
        let mut names: Vec<String> = map
            .values()
            .filter(|s| s.token() != token)
            .filter_map(|s| s.name_owned())
            .collect();
        names.sort_unstable();
        names
    }

    /// Broadcast snapshot: every named session except `exclude`. Anonymous
    /// sessions never observe room traffic.
    pub fn named_peers(&self, exclude: Option<Token>) -> Vec<Arc<Session>> {
        guard(&self.sessions)
            .values()
            .filter(|s| s.name().is_some() && Some(s.token()) != exclude)
            .cloned()
            .collect()
    }

    /// Empties the registry for shutdown, deregistering every stream.
    pub fn drain(&self, handle: &Handle) -> Vec<Arc<Session>> {
        let mut map = guard(&self.sessions);
        let sessions: Vec<_> = map.drain().map(|(_, s)| s).collect();
        for session in &sessions {
            session.deregister(handle);
        }
        sessions
    }

    pub fn len(&self) -> usize {
        guard(&self.sessions).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
