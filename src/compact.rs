use serde::Serialize;
use tracing::{info, warn};

use crate::error::EtlError;
use crate::store::ZarrStore;

pub const TIME_DIMENSION: &str = "time";

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CompactionReport {
    pub dimension: String,
    pub length: u64,
    pub removed: Vec<String>,
}

/// Outcome recorded in a run summary; compaction never fails a run.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum CompactionOutcome {
    Skipped,
    Completed(CompactionReport),
    Failed { error: String },
}

/// Rewrites the time coordinate of `store` as one chunk and removes the
/// fragments the old layout left behind. Safe to run again after a failure.
pub fn compact(store: &ZarrStore) -> Result<CompactionReport, EtlError> {
    info!("compacting {TIME_DIMENSION} in {}", store.location());
    let length = store.rewrite_dimension_as_single_chunk(TIME_DIMENSION)?;
    let keep = store.single_chunk_fragments(TIME_DIMENSION)?;
    let removed = store.remove_stale_fragments(TIME_DIMENSION, &keep)?;
    for key in &removed {
        info!("removed stale fragment {key}");
    }
    Ok(CompactionReport {
        dimension: TIME_DIMENSION.to_string(),
        length,
        removed,
    })
}

/// Runs [`compact`] and downgrades a failure to a warning.
pub fn compact_advisory(store: &ZarrStore) -> CompactionOutcome {
    match compact(store) {
        Ok(report) => CompactionOutcome::Completed(report),
        Err(err) => {
            warn!("compaction of {} failed, appended data is unaffected: {err}", store.location());
            CompactionOutcome::Failed {
                error: err.to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::storage::{Protocol, StorageOptions};

    #[test]
    fn missing_store_is_reported_not_raised() {
        let store = ZarrStore::open(Protocol::Memory, "", &StorageOptions::default()).unwrap();
        assert_matches!(compact(&store), Err(EtlError::StoreNotFound(_)));
        assert_matches!(compact_advisory(&store), CompactionOutcome::Failed { .. });
    }
}
