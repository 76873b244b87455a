use flowcore::{ExecutionId, ExecutionStatus, WorkflowExecution, WorkflowId};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;

pub const DEFAULT_LEDGER_CAPACITY: usize = 1000;

/// Aggregate counters over the retained records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    /// Records currently retained.
    pub total: usize,
    pub by_status: BTreeMap<ExecutionStatus, usize>,
    /// Records ever accepted, including evicted ones.
    pub recorded: u64,
    pub evicted: u64,
}

/// Capacity-bounded ledger of terminal execution records.
///
/// Records are immutable once stored and handed out as `Arc`s, so readers
/// hold a consistent snapshot without keeping the lock.
pub struct ExecutionStore {
    ledger: RwLock<Ledger>,
}

struct Ledger {
    capacity: usize,
    /// Oldest first.
    records: VecDeque<Arc<WorkflowExecution>>,
    by_id: HashMap<ExecutionId, Arc<WorkflowExecution>>,
    /// Per workflow, oldest first. Eviction always removes the front entry.
    by_workflow: HashMap<WorkflowId, VecDeque<ExecutionId>>,
    by_status: BTreeMap<ExecutionStatus, usize>,
    recorded: u64,
    evicted: u64,
}

impl ExecutionStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            ledger: RwLock::new(Ledger {
                capacity: capacity.max(1),
                records: VecDeque::new(),
                by_id: HashMap::new(),
                by_workflow: HashMap::new(),
                by_status: BTreeMap::new(),
                recorded: 0,
                evicted: 0,
            }),
        }
    }

    /// Store a finished execution, evicting the oldest record when full.
    ///
    /// Records are write-once: an id that is already stored keeps its first
    /// record, which is returned.
    pub async fn record(&self, execution: WorkflowExecution) -> Arc<WorkflowExecution> {
        if !execution.is_terminal() {
            tracing::warn!(
                execution_id = %execution.id,
                "Recording execution in non-terminal status {}",
                execution.status
            );
        }

        let mut ledger = self.ledger.write().await;
        if let Some(existing) = ledger.by_id.get(&execution.id) {
            tracing::warn!(execution_id = %execution.id, "Execution already recorded");
            return Arc::clone(existing);
        }
        let record = Arc::new(execution);

        while ledger.records.len() >= ledger.capacity {
            ledger.evict_oldest();
        }

        *ledger.by_status.entry(record.status).or_insert(0) += 1;
        ledger
            .by_workflow
            .entry(record.workflow_id.clone())
            .or_default()
            .push_back(record.id);
        ledger.by_id.insert(record.id, Arc::clone(&record));
        ledger.records.push_back(Arc::clone(&record));
        ledger.recorded += 1;

        record
    }

    pub async fn get(&self, id: &ExecutionId) -> Option<Arc<WorkflowExecution>> {
        self.ledger.read().await.by_id.get(id).cloned()
    }

    /// Most recent first.
    pub async fn list_recent(&self, limit: usize) -> Vec<Arc<WorkflowExecution>> {
        let ledger = self.ledger.read().await;
        ledger.records.iter().rev().take(limit).cloned().collect()
    }

    /// Most recent first, restricted to one workflow.
    pub async fn list_by_workflow(
        &self,
        workflow_id: &str,
        limit: usize,
    ) -> Vec<Arc<WorkflowExecution>> {
        let ledger = self.ledger.read().await;
        ledger
            .by_workflow
            .get(workflow_id)
            .map(|ids| {
                ids.iter()
                    .rev()
                    .filter_map(|id| ledger.by_id.get(id).cloned())
                    .take(limit)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn stats(&self) -> StoreStats {
        let ledger = self.ledger.read().await;
        StoreStats {
            total: ledger.records.len(),
            by_status: ledger.by_status.clone(),
            recorded: ledger.recorded,
            evicted: ledger.evicted,
        }
    }

    pub async fn len(&self) -> usize {
        self.ledger.read().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for ExecutionStore {
    fn default() -> Self {
        Self::new(DEFAULT_LEDGER_CAPACITY)
    }
}

impl Ledger {
    fn evict_oldest(&mut self) {
        let Some(oldest) = self.records.pop_front() else {
            return;
        };
        self.by_id.remove(&oldest.id);

        if let Some(count) = self.by_status.get_mut(&oldest.status) {
            *count -= 1;
            if *count == 0 {
                self.by_status.remove(&oldest.status);
            }
        }

        if let Some(ids) = self.by_workflow.get_mut(&oldest.workflow_id) {
            ids.pop_front();
            if ids.is_empty() {
                self.by_workflow.remove(&oldest.workflow_id);
            }
        }

        self.evicted += 1;
        tracing::debug!(execution_id = %oldest.id, "Evicted execution record");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finished(workflow_id: &str, status: ExecutionStatus) -> WorkflowExecution {
        let mut execution = WorkflowExecution::new(workflow_id);
        execution.start();
        execution.finish(status);
        execution
    }

    #[tokio::test]
    async fn evicts_oldest_beyond_capacity() {
        let store = ExecutionStore::new(3);
        let first = store.record(finished("wf", ExecutionStatus::Completed)).await;
        for _ in 0..3 {
            store.record(finished("wf", ExecutionStatus::Completed)).await;
        }

        let stats = store.stats().await;
        assert_eq!(stats.total, 3);
        assert_eq!(stats.recorded, 4);
        assert_eq!(stats.evicted, 1);
        assert_eq!(stats.by_status[&ExecutionStatus::Completed], 3);
        assert!(store.get(&first.id).await.is_none());
        assert_eq!(store.list_by_workflow("wf", 10).await.len(), 3);
    }

    #[tokio::test]
    async fn eviction_updates_status_counters() {
        let store = ExecutionStore::new(2);
        store.record(finished("a", ExecutionStatus::Failed)).await;
        store.record(finished("b", ExecutionStatus::Completed)).await;
        store.record(finished("b", ExecutionStatus::Completed)).await;

        let stats = store.stats().await;
        assert_eq!(stats.total, 2);
        assert!(!stats.by_status.contains_key(&ExecutionStatus::Failed));
        assert!(store.list_by_workflow("a", 10).await.is_empty());
    }

    #[tokio::test]
    async fn duplicate_ids_keep_indices_consistent() {
        let store = ExecutionStore::new(2);
        let execution = finished("wf", ExecutionStatus::Completed);
        let first = store.record(execution.clone()).await;

        let mut changed = execution;
        changed.status = ExecutionStatus::Failed;
        let again = store.record(changed).await;

        assert_eq!(again.status, ExecutionStatus::Completed);
        assert_eq!(store.len().await, 1);
        assert_eq!(store.stats().await.recorded, 1);

        let second = store.record(finished("wf", ExecutionStatus::Completed)).await;
        let third = store.record(finished("wf", ExecutionStatus::Completed)).await;

        assert!(store.get(&first.id).await.is_none());
        let ids: Vec<_> = store
            .list_by_workflow("wf", 10)
            .await
            .iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec![third.id, second.id]);
    }

    #[tokio::test]
    async fn lists_most_recent_first() {
        let store = ExecutionStore::new(10);
        let a = store.record(finished("x", ExecutionStatus::Completed)).await;
        let b = store.record(finished("y", ExecutionStatus::Failed)).await;
        let c = store.record(finished("x", ExecutionStatus::Completed)).await;

        let recent: Vec<_> = store.list_recent(2).await.iter().map(|e| e.id).collect();
        assert_eq!(recent, vec![c.id, b.id]);

        let for_x: Vec<_> = store
            .list_by_workflow("x", 10)
            .await
            .iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(for_x, vec![c.id, a.id]);
        assert_eq!(store.get(&b.id).await.map(|e| e.status), Some(ExecutionStatus::Failed));
    }
}
