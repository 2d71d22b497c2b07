//! Size budget enforcement.
//!
//! Once the stored payloads exceed the budget, the least recently accessed clips are deleted
//! until the total drops to [`EVICTION_TARGET_RATIO`] of the budget. Evicting below the budget
//! leaves headroom, so a cache sitting right at its limit does not evict on every write.

use tokio::sync::Mutex;

use super::store::{Store, StoreError};

/// The fraction of the budget an eviction pass shrinks the cache to.
pub const EVICTION_TARGET_RATIO: f64 = 0.9;

/// What a single eviction pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictionOutcome {
    pub evicted_clips: usize,
    pub evicted_bytes: u64,
}

/// The keys one pass is going to delete.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct EvictionPlan {
    pub keys: Vec<String>,
    pub bytes: u64,
}

/// Picks the clips to evict from a scan ordered by ascending last access.
///
/// Every clip whose cumulative size, counted from the least recently accessed one and
/// including itself, does not exceed `total - target` is selected.
pub fn plan_eviction(scan: &[(String, u64)], total: u64, budget: u64) -> EvictionPlan {
    if total <= budget {
        return EvictionPlan::default();
    }

    let target = (budget as f64 * EVICTION_TARGET_RATIO) as u64;
    let to_evict = total.saturating_sub(target);

    let mut plan = EvictionPlan::default();
    for (key, size) in scan {
        let cumulative = plan.bytes + size;
        if cumulative > to_evict {
            break;
        }
        plan.keys.push(key.clone());
        plan.bytes = cumulative;
    }
    plan
}

/// Runs eviction passes against a [`Store`].
///
/// Passes are serialized, a second pass requested while one is running waits for it and then
/// reevaluates the current total.
#[derive(Debug)]
pub struct EvictionManager {
    store: Store,
    budget: u64,
    pass: Mutex<()>,
}

impl EvictionManager {
    pub fn new(store: Store, budget: u64) -> Self {
        Self {
            store,
            budget,
            pass: Mutex::new(()),
        }
    }

    /// The size budget in bytes.
    pub fn budget(&self) -> u64 {
        self.budget
    }

    /// Brings the store back under its budget, if it is over.
    pub async fn enforce(&self) -> Result<EvictionOutcome, StoreError> {
        let _pass = self.pass.lock().await;
        let budget = self.budget;

        let outcome = self
            .store
            .run(move |store| {
                let total = store.total_size()?;
                if total <= budget {
                    return Ok(EvictionOutcome::default());
                }

                let scan = store.scan_by_last_access()?;
                let plan = plan_eviction(&scan, total, budget);
                tracing::debug!(
                    total,
                    budget,
                    candidates = plan.keys.len(),
                    "Clip store exceeds its budget"
                );

                let evicted_clips = store.delete_many(&plan.keys)?;
                Ok(EvictionOutcome {
                    evicted_clips,
                    evicted_bytes: plan.bytes,
                })
            })
            .await?;

        if outcome.evicted_clips > 0 {
            tracing::info!(
                clips = outcome.evicted_clips,
                bytes = outcome.evicted_bytes,
                "Evicted least recently used clips"
            );
            metric!(counter("clips.evict.clips") += outcome.evicted_clips as i64);
            metric!(counter("clips.evict.bytes") += outcome.evicted_bytes as i64);
        }

        Ok(outcome)
    }
}
