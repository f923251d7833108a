use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use tracing::info;

use quarry_core::{JobId, TaskStore};

use crate::error::TaskError;

/// Rulesets this agent has already compiled, keyed by job.
const RULE_CACHE_SIZE: usize = 32;

/// Per-agent memoization of compiled rulesets.
///
/// Every scan batch of a job needs the same ruleset, so compilation is paid
/// once per job per agent. The cache is not shared across agents and is not
/// invalidated on cancellation; cancelled jobs are simply never re-scanned.
pub(crate) struct RuleCache {
    cache: LruCache<JobId, Arc<yara_x::Rules>>,
}

impl RuleCache {
    pub(crate) fn new() -> Self {
        Self {
            cache: LruCache::new(NonZeroUsize::new(RULE_CACHE_SIZE).expect("nonzero capacity")),
        }
    }

    /// Compiled rules for the job, fetching and compiling on a miss.
    ///
    /// Compile errors propagate: a ruleset that does not compile fails the
    /// task, and with it the job.
    pub(crate) async fn get_or_compile(
        &mut self,
        store: &dyn TaskStore,
        job: &JobId,
    ) -> Result<Arc<yara_x::Rules>, TaskError> {
        if let Some(rules) = self.cache.get(job) {
            return Ok(rules.clone());
        }

        let source = store.get_yara_by_job(job).await?;
        info!(%job, "compiling ruleset");
        let rules = yara_x::compile(source.as_str())
            .map_err(|e| TaskError::RuleCompile(e.to_string()))?;
        let rules = Arc::new(rules);
        self.cache.put(job.clone(), rules.clone());
        Ok(rules)
    }
}

impl Default for RuleCache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RuleCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RuleCache {{ entries: {} }}", self.cache.len())
    }
}
