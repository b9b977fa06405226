use std::collections::BTreeMap;

use serde::Serialize;

use mnemo_core::error::{Error, Result};

use crate::wal::WalCheckpoint;

/// A named point in a table's history.
///
/// Virtual checkpoints mark the boundaries of retained history (the oldest
/// revision and the current one). They are computed on demand and can not
/// be deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Checkpoint {
    pub revision: u64,
    pub timestamp_ms: i64,
    pub row_count: u64,
    pub user_data: Option<String>,
    #[serde(rename = "virtual")]
    pub is_virtual: bool,
}

impl Checkpoint {
    pub fn to_wal(&self) -> WalCheckpoint {
        WalCheckpoint {
            revision: self.revision,
            timestamp_ms: self.timestamp_ms,
            row_count: self.row_count,
            user_data: self.user_data.clone(),
        }
    }

    pub fn from_wal(checkpoint: &WalCheckpoint) -> Self {
        Self {
            revision: checkpoint.revision,
            timestamp_ms: checkpoint.timestamp_ms,
            row_count: checkpoint.row_count,
            user_data: checkpoint.user_data.clone(),
            is_virtual: false,
        }
    }
}

/// User checkpoints of one table, keyed by revision.
#[derive(Debug, Clone, Default)]
pub struct CheckpointSet {
    user: BTreeMap<u64, Checkpoint>,
}

impl CheckpointSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.user.len()
    }

    pub fn is_empty(&self) -> bool {
        self.user.is_empty()
    }

    pub fn get(&self, revision: u64) -> Option<&Checkpoint> {
        self.user.get(&revision)
    }

    /// Fails if a user checkpoint already exists at that revision.
    pub fn check_create(&self, revision: u64) -> Result<()> {
        if self.user.contains_key(&revision) {
            return Err(Error::Checkpoint {
                message: format!("a checkpoint already exists at revision {}", revision),
            });
        }
        Ok(())
    }

    /// The user checkpoint at `revision`. Virtual checkpoints are never
    /// found here.
    pub fn check_delete(&self, revision: u64) -> Result<&Checkpoint> {
        self.user.get(&revision).ok_or_else(|| Error::Checkpoint {
            message: format!("no user checkpoint at revision {}", revision),
        })
    }

    pub fn insert(&mut self, checkpoint: Checkpoint) -> Result<()> {
        self.check_create(checkpoint.revision)?;
        self.user.insert(checkpoint.revision, checkpoint);
        Ok(())
    }

    pub fn remove(&mut self, revision: u64) -> Result<Checkpoint> {
        self.user.remove(&revision).ok_or_else(|| Error::Checkpoint {
            message: format!("no user checkpoint at revision {}", revision),
        })
    }

    /// Every checkpoint in revision order, framed by the two virtual
    /// boundary checkpoints.
    pub fn list(&self, oldest: Checkpoint, current: Checkpoint) -> Vec<Checkpoint> {
        let mut all = Vec::with_capacity(self.user.len() + 2);
        all.push(Checkpoint {
            is_virtual: true,
            ..oldest
        });
        all.extend(self.user.values().cloned());
        all.push(Checkpoint {
            is_virtual: true,
            ..current
        });
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checkpoint(revision: u64) -> Checkpoint {
        Checkpoint {
            revision,
            timestamp_ms: 1_000 + revision as i64,
            row_count: revision * 2,
            user_data: Some(format!("cp-{}", revision)),
            is_virtual: false,
        }
    }

    #[test]
    fn test_list_is_framed_by_virtual_checkpoints() {
        let mut set = CheckpointSet::new();
        set.insert(checkpoint(7)).unwrap();
        set.insert(checkpoint(3)).unwrap();

        let list = set.list(checkpoint(0), checkpoint(9));
        let revisions: Vec<u64> = list.iter().map(|c| c.revision).collect();
        assert_eq!(revisions, vec![0, 3, 7, 9]);
        assert!(list[0].is_virtual);
        assert!(!list[1].is_virtual);
        assert!(list[3].is_virtual);
    }

    #[test]
    fn test_duplicate_and_missing_checkpoints() {
        let mut set = CheckpointSet::new();
        set.insert(checkpoint(2)).unwrap();
        assert!(matches!(set.insert(checkpoint(2)), Err(Error::Checkpoint { .. })));
        assert!(matches!(set.remove(5), Err(Error::Checkpoint { .. })));

        let removed = set.remove(2).unwrap();
        assert_eq!(removed.user_data.as_deref(), Some("cp-2"));
        assert!(set.is_empty());
    }

    #[test]
    fn test_serializes_virtual_flag() {
        let json = serde_json::to_value(Checkpoint {
            is_virtual: true,
            ..checkpoint(1)
        })
        .unwrap();
        assert_eq!(json["virtual"], serde_json::json!(true));
        assert_eq!(json["row_count"], serde_json::json!(2));
    }
}
