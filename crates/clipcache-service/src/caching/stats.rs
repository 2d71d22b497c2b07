use std::collections::BTreeMap;

use serde::Serialize;

use super::store::{LanguageUsage, Store, StoreError, StoreSummary};

const MIB: f64 = 1024.0 * 1024.0;

/// Clip count and size of one language.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LanguageStats {
    pub clips: u64,
    pub bytes: u64,
}

/// A snapshot of what the cache currently holds.
///
/// Sizes are the stored (possibly compressed) sizes, the same numbers the size budget is
/// enforced against.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub total_clips: u64,
    pub total_size: u64,
    pub size_mb: f64,
    /// The size budget, only present when one is configured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_size_mb: Option<f64>,
    /// `total_size` relative to the budget, only present when one is configured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage_percent: Option<f64>,
    pub compressed_clips: u64,
    pub languages: BTreeMap<String, LanguageStats>,
}

impl CacheStats {
    /// Aggregates the contents of `store`.
    pub fn collect(store: &Store, budget: Option<u64>) -> Result<Self, StoreError> {
        let summary = store.summary()?;
        let languages = store.language_breakdown()?;
        Ok(Self::from_parts(summary, languages, budget))
    }

    fn from_parts(summary: StoreSummary, languages: Vec<LanguageUsage>, budget: Option<u64>) -> Self {
        let budget = budget.filter(|b| *b > 0);
        let languages = languages
            .into_iter()
            .map(|usage| {
                let stats = LanguageStats {
                    clips: usage.clips,
                    bytes: usage.bytes,
                };
                (usage.language_code, stats)
            })
            .collect();

        Self {
            total_clips: summary.clips,
            total_size: summary.bytes,
            size_mb: summary.bytes as f64 / MIB,
            max_size_mb: budget.map(|b| b as f64 / MIB),
            usage_percent: budget.map(|b| summary.bytes as f64 / b as f64 * 100.0),
            compressed_clips: summary.compressed_clips,
            languages,
        }
    }

    /// Reports the snapshot as gauges.
    pub fn emit_metrics(&self) {
        metric!(gauge("clips.size.bytes") = self.total_size);
        metric!(gauge("clips.size.count") = self.total_clips);
        for (language, stats) in &self.languages {
            metric!(gauge("clips.size.bytes") = stats.bytes, "language" => language);
            metric!(gauge("clips.size.count") = stats.clips, "language" => language);
        }
    }
}
