//! Replica access table (RAT): tokens that let several agents share one
//! in-flight write session on a replica.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::model::{DataId, ReplicaNumber};
use crate::utils::{ErrorKind, StrataError};

/// Identifier of an agent (one per client connection).
pub type AgentId = u64;

/// Opaque replica access token.
#[derive(Debug, PartialEq, Eq, Clone, Hash, Serialize, Deserialize)]
pub struct ReplicaToken(String);

impl ReplicaToken {
    fn mint() -> Self {
        let value: u128 = rand::thread_rng().gen();
        ReplicaToken(format!("{:032x}", value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ReplicaToken {
    fn from(s: &str) -> Self {
        ReplicaToken(s.to_string())
    }
}

impl fmt::Display for ReplicaToken {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug)]
struct RatEntry {
    data_id: DataId,
    replica_number: ReplicaNumber,

    /// Agents attached; may repeat if one agent opens twice.
    agents: Vec<AgentId>,
}

/// Process-wide token table.
#[derive(Debug, Default)]
pub struct ReplicaAccessTable {
    entries: Mutex<HashMap<ReplicaToken, RatEntry>>,
}

fn invalid_token(token: &ReplicaToken) -> StrataError {
    StrataError::new(
        ErrorKind::AccessTokenInvalid,
        format!("replica access token {} not valid here", token),
    )
}

// ReplicaAccessTable public API implementation
impl ReplicaAccessTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(
        &self,
    ) -> Result<MutexGuard<'_, HashMap<ReplicaToken, RatEntry>>, StrataError>
    {
        self.entries
            .lock()
            .map_err(|_| StrataError::msg("RAT mutex poisoned"))
    }

    /// Mints a token for a new writer session on a replica. Fails if the
    /// replica already has one.
    pub fn create_new_entry(
        &self,
        data_id: DataId,
        replica_number: ReplicaNumber,
        agent: AgentId,
    ) -> Result<ReplicaToken, StrataError> {
        let mut entries = self.entries()?;
        if entries.values().any(|e| {
            e.data_id == data_id && e.replica_number == replica_number
        }) {
            return Err(StrataError::new(
                ErrorKind::AccessTokenInvalid,
                format!(
                    "replica {} of {} already has an access token",
                    replica_number, data_id
                ),
            ));
        }

        let token = ReplicaToken::mint();
        entries.insert(
            token.clone(),
            RatEntry {
                data_id,
                replica_number,
                agents: vec![agent],
            },
        );
        pf_debug!("RAT new token for {}:{}", data_id, replica_number);
        Ok(token)
    }

    /// Attaches another agent to an existing token.
    pub fn append_pid(
        &self,
        token: &ReplicaToken,
        data_id: DataId,
        replica_number: ReplicaNumber,
        agent: AgentId,
    ) -> Result<(), StrataError> {
        let mut entries = self.entries()?;
        match entries.get_mut(token) {
            Some(entry)
                if entry.data_id == data_id
                    && entry.replica_number == replica_number =>
            {
                entry.agents.push(agent);
                Ok(())
            }
            _ => Err(invalid_token(token)),
        }
    }

    /// Returns true if the token authorizes access to this replica.
    pub fn contains_token(
        &self,
        token: &ReplicaToken,
        data_id: DataId,
        replica_number: ReplicaNumber,
    ) -> bool {
        self.entries()
            .map(|entries| {
                entries.get(token).is_some_and(|e| {
                    e.data_id == data_id && e.replica_number == replica_number
                })
            })
            .unwrap_or(false)
    }

    /// Returns true if any token exists for this replica.
    pub fn contains(
        &self,
        data_id: DataId,
        replica_number: ReplicaNumber,
    ) -> bool {
        self.token_of(data_id, replica_number).is_some()
    }

    pub fn token_of(
        &self,
        data_id: DataId,
        replica_number: ReplicaNumber,
    ) -> Option<ReplicaToken> {
        self.entries().ok().and_then(|entries| {
            entries
                .iter()
                .find(|(_, e)| {
                    e.data_id == data_id && e.replica_number == replica_number
                })
                .map(|(t, _)| t.clone())
        })
    }

    /// Detaches one occurrence of an agent; the token goes away with its
    /// last agent. Returns the number of agents still attached.
    pub fn erase_pid(
        &self,
        token: &ReplicaToken,
        agent: AgentId,
    ) -> Result<usize, StrataError> {
        let mut entries = self.entries()?;
        let entry = entries.get_mut(token).ok_or_else(|| invalid_token(token))?;
        let pos = entry
            .agents
            .iter()
            .position(|a| *a == agent)
            .ok_or_else(|| invalid_token(token))?;
        entry.agents.remove(pos);

        let remaining = entry.agents.len();
        if remaining == 0 {
            entries.remove(token);
            pf_debug!("RAT token {} removed", token);
        }
        Ok(remaining)
    }

    /// Removes a token regardless of attached agents; no-op if absent.
    pub fn erase(&self, token: &ReplicaToken) {
        if let Ok(mut entries) = self.entries() {
            entries.remove(token);
        }
    }
}
