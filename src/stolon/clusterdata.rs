//! Model of the cluster snapshot stolon maintains in etcd
//!
//! Only the fields the failover cares about are modelled; the snapshot
//! carries many sibling fields that are tolerated and ignored so newer
//! stolon versions keep deserialising.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The JSON document stored under the clusterdata key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Clusterdata {
    #[serde(default)]
    pub cluster: Cluster,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Cluster {
    #[serde(default)]
    pub master: Db,
    #[serde(default)]
    pub synchronous_standbys: Vec<Db>,
}

/// One database under stolon management.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Db {
    #[serde(default)]
    pub keeper_uid: String,
    #[serde(default)]
    pub status: DbStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbStatus {
    #[serde(default)]
    pub healthy: bool,
}

impl Clusterdata {
    pub fn parse(value: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(value)?)
    }

    /// The current primary, or `None` when the snapshot does not yet name
    /// one. A master with an empty keeper UID means the cluster is corrupt
    /// or not yet initialised.
    pub fn master(&self) -> Option<&Db> {
        if self.cluster.master.keeper_uid.is_empty() {
            return None;
        }

        Some(&self.cluster.master)
    }

    /// Replicas the manager currently treats as synchronous.
    pub fn synchronous_standbys(&self) -> &[Db] {
        &self.cluster.synchronous_standbys
    }
}

impl Db {
    pub fn healthy(&self) -> bool {
        self.status.healthy
    }
}

impl fmt::Display for Db {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (healthy={})", self.keeper_uid, self.status.healthy)
    }
}
