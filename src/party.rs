//! Protocol parties, their roles, and where to reach them

use crate::config::Config;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A named protocol participant.
///
/// The set is closed: one protocol hub and two data-holding parties. The
/// derived ordering (`Ph < Db1 < Db2`) is the stable total order used for
/// port assignment and progress-slot layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Party {
    Ph,
    Db1,
    Db2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Client-facing transport; connections are accepted, never dialed.
    Front,
    Hub,
    Db,
}

impl Party {
    pub fn index(&self) -> usize {
        match self {
            Party::Ph => 0,
            Party::Db1 => 1,
            Party::Db2 => 2,
        }
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Party::all().get(index).copied()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Party::Ph => "ph",
            Party::Db1 => "db1",
            Party::Db2 => "db2",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ph" => Some(Party::Ph),
            "db1" => Some(Party::Db1),
            "db2" => Some(Party::Db2),
            _ => None,
        }
    }

    pub fn all() -> [Party; 3] {
        [Party::Ph, Party::Db1, Party::Db2]
    }

    pub fn dbs() -> [Party; 2] {
        [Party::Db1, Party::Db2]
    }

    pub fn role(&self) -> Role {
        match self {
            Party::Ph => Role::Hub,
            Party::Db1 | Party::Db2 => Role::Db,
        }
    }

    pub fn is_db(&self) -> bool {
        self.role() == Role::Db
    }

    /// Position of this party in a progress slot's row-count pair.
    pub fn db_slot(&self) -> Option<usize> {
        match self {
            Party::Ph => None,
            Party::Db1 => Some(0),
            Party::Db2 => Some(1),
        }
    }
}

impl std::fmt::Display for Party {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Front => "front",
            Role::Hub => "hub",
            Role::Db => "db",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outbound transport settings for one party.
#[derive(Debug, Clone, PartialEq)]
pub struct Endpoint {
    pub party: Party,
    pub host: String,
    pub port: u16,
    /// Outstanding-byte budget for frames queued toward this party.
    pub output_buffer_limit: usize,
}

impl Endpoint {
    pub fn role(&self) -> Role {
        self.party.role()
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Immutable, process-lifetime table of every party's endpoint.
#[derive(Debug, Clone)]
pub struct PartyRegistry {
    local: Party,
    endpoints: BTreeMap<Party, Endpoint>,
}

impl PartyRegistry {
    pub fn from_config(config: &Config) -> Self {
        let endpoints = Party::all()
            .into_iter()
            .map(|party| {
                let connect = config.connect_address(party);
                let endpoint = Endpoint {
                    party,
                    host: connect.host.clone(),
                    port: connect.port,
                    output_buffer_limit: config.output_buffer_limits.get(party),
                };
                (party, endpoint)
            })
            .collect();

        Self {
            local: config.local_party,
            endpoints,
        }
    }

    pub fn local(&self) -> Party {
        self.local
    }

    pub fn endpoint(&self, party: Party) -> Option<&Endpoint> {
        self.endpoints.get(&party)
    }

    pub fn endpoints(&self) -> impl Iterator<Item = &Endpoint> {
        self.endpoints.values()
    }

    /// Parties that receive a "start query" event: the hub and every DB.
    pub fn dispatch_targets(&self) -> Vec<Party> {
        self.endpoints
            .keys()
            .copied()
            .filter(|party| matches!(party.role(), Role::Hub | Role::Db))
            .collect()
    }
}
