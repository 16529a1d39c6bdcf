use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::config::DocumentPaths;
use crate::core::mirror::Mirror;
use crate::core::task::TaskId;

use super::remote::RemoteWrite;

/// Remote writes skipped while the breaker was open, replayed on recovery.
///
/// Only ids are recorded; the replay reads current values from the mirror, so
/// repeated edits of one task collapse into a single write.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Backlog {
    #[serde(default)]
    upserts: BTreeSet<TaskId>,
    #[serde(default)]
    deletes: BTreeSet<TaskId>,
    #[serde(default)]
    stats: bool,
}

impl Backlog {
    pub fn record_upsert(&mut self, id: &TaskId) {
        self.deletes.remove(id);
        self.upserts.insert(id.clone());
    }

    pub fn record_delete(&mut self, id: &TaskId) {
        let was_offline_only = id.is_local() && self.upserts.contains(id);
        self.upserts.remove(id);
        if !was_offline_only {
            self.deletes.insert(id.clone());
        }
    }

    pub fn record_stats(&mut self) {
        self.stats = true;
    }

    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.deletes.is_empty() && !self.stats
    }

    pub fn len(&self) -> usize {
        self.upserts.len() + self.deletes.len() + usize::from(self.stats)
    }

    /// Fold entries from an earlier backlog back in, keeping newer decisions.
    pub fn absorb(&mut self, earlier: Backlog) {
        for id in earlier.upserts {
            if !self.deletes.contains(&id) {
                self.upserts.insert(id);
            }
        }
        for id in earlier.deletes {
            if !self.upserts.contains(&id) {
                self.deletes.insert(id);
            }
        }
        self.stats |= earlier.stats;
    }

    /// Writes that bring the remote store in line with the mirror.
    pub fn plan(&self, mirror: &Mirror, paths: &DocumentPaths) -> Vec<RemoteWrite> {
        let mut writes = Vec::new();
        for id in &self.deletes {
            writes.push(RemoteWrite::Delete {
                path: paths.task_doc(id.as_str()),
            });
        }
        for id in &self.upserts {
            if let Some(task) = mirror.get_by_id(id) {
                writes.push(RemoteWrite::Set {
                    path: paths.task_doc(id.as_str()),
                    fields: task.to_fields(),
                    merge: true,
                });
            }
        }
        if self.stats {
            writes.push(RemoteWrite::Set {
                path: paths.stats_doc(),
                fields: mirror.stats().to_fields(),
                merge: true,
            });
        }
        writes
    }
}
