// resolver.rs - the conflict resolver
//
// Five named strategies over a skew-tolerance boundary and a
// field-wise merge policy.

use crate::error::{Error, Result};
use crate::model::Task;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictStrategy {
    ServerWinsNewer,
    LocalWinsNewer,
    AuthoritativeTruth,
    Merge,
    /// Fallback for inputs the strategies above can't classify (
    /// "missing timestamps, etc."). The typed `Task` model always
    /// carries `updated_at`, so this never fires in practice; kept for
    /// parity with the five named strategies and as a safe
    /// default if that invariant is ever relaxed.
    #[allow(dead_code)]
    ServerWins,
}

pub struct ConflictResolver {
    skew_tolerance: Duration,
}

impl ConflictResolver {
    pub fn new(skew_tolerance: Duration) -> Self {
        Self { skew_tolerance }
    }

    /// Resolve `(local, server, authoritative?)` into a single merged
    /// task plus the strategy that was used. Deterministic: identical
    /// inputs always produce identical outputs (P6), no wall-clock
    /// reads.
    pub fn resolve(&self, local: &Task, server: &Task, authoritative: Option<&Task>) -> Result<(Task, ConflictStrategy)> {
        if local.id != server.id {
            return Err(Error::Invariant(format!(
                "resolver called with mismatched ids: local={} server={}",
                local.id, server.id
            )));
        }
        if let Some(auth) = authoritative {
            if auth.id != local.id {
                return Err(Error::Invariant(format!(
                    "resolver called with mismatched authoritative id: {}",
                    auth.id
                )));
            }
        }

        let delta = chrono::Duration::from_std(self.skew_tolerance).unwrap_or(chrono::Duration::zero());

        if server.updated_at > local.updated_at + delta {
            return Ok((server.clone(), ConflictStrategy::ServerWinsNewer));
        }
        if local.updated_at > server.updated_at + delta {
            return Ok((local.clone(), ConflictStrategy::LocalWinsNewer));
        }

        // Within the skew window: "same time".
        if let Some(auth) = authoritative {
            return Ok((auth.clone(), ConflictStrategy::AuthoritativeTruth));
        }

        Ok((self.merge(local, server), ConflictStrategy::Merge))
    }

    /// Field-wise merge for the `merge` strategy. Fields the
    /// policy doesn't name (id, project, created_at, parent_id) carry
    /// from the local snapshot, which is the record being replaced
    /// in-place by the Local Store.
    fn merge(&self, local: &Task, server: &Task) -> Task {
        let mut merged = local.clone();
        merged.content = server.content.clone();
        merged.status = server.status;
        merged.priority = server.priority;
        // completed_at tracks whichever status won (I3).
        merged.completed_at = server.completed_at;

        merged.tags = local.tags.clone();
        for tag in &server.tags {
            if !merged.tags.contains(tag) {
                merged.tags.push(tag.clone());
            }
        }

        merged.metadata = local.metadata.clone();
        for (key, value) in &server.metadata {
            merged.metadata.insert(key.clone(), value.clone());
        }

        merged.updated_at = local.updated_at.max(server.updated_at);
        merged
    }
}
