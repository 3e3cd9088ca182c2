use parking_lot::RwLock;
use std::sync::Arc;
use tracing::warn;

use crate::record::{CostAggregate, CostFilter, CostRecord};
use crate::store::CostStore;

/// Append-only in-memory recorder of provider calls.
///
/// `track` is fast and never blocks the originating request: persistence to
/// the attached store happens in a background task, and a failed insert is
/// logged and dropped.
pub struct CostTracker {
    records: Arc<RwLock<Vec<CostRecord>>>,
    store: Option<Arc<dyn CostStore>>,
}

impl CostTracker {
    pub fn new() -> Self {
        Self {
            records: Arc::new(RwLock::new(Vec::new())),
            store: None,
        }
    }

    pub fn with_store(store: Arc<dyn CostStore>) -> Self {
        Self {
            records: Arc::new(RwLock::new(Vec::new())),
            store: Some(store),
        }
    }

    /// Record one provider call. The usage total is re-derived so the
    /// `total == prompt + completion` invariant holds no matter what the
    /// caller assembled.
    pub fn track(&self, mut record: CostRecord) {
        record.usage = record.usage.normalized();
        self.records.write().push(record.clone());

        if let Some(ref store) = self.store {
            let store = Arc::clone(store);
            tokio::spawn(async move {
                if let Err(e) = store.insert(&record).await {
                    warn!(record_id = %record.id, error = %e, "cost record persistence failed");
                }
            });
        }
    }

    /// All records matching the filter, in append order.
    pub fn records(&self, filter: &CostFilter) -> Vec<CostRecord> {
        self.records
            .read()
            .iter()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Fold the matching records into one aggregate.
    pub fn aggregate(&self, filter: &CostFilter) -> CostAggregate {
        CostAggregate::from_records(self.records.read().iter().filter(|r| filter.matches(r)))
    }
}

impl Default for CostTracker {
    fn default() -> Self {
        Self::new()
    }
}
