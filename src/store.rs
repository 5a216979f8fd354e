//! Persistence seams used by the allocator.
//!
//! A batch goes through a small unit of work: [`BatchStore::insert`] stages it,
//! [`NumberStore::bulk_insert`] attaches device numbers to the staged batch, and
//! [`BatchStore::commit`] publishes both at once. Staged rows are never visible
//! to reads, so an abandoned allocation cannot move a factory's watermark.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;

use crate::model::{
    BatchId, DeviceNumber, Factory, FactoryId, NewBatch, NewDeviceNumber, ProductionBatch,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("stored record is unreadable: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("batch {0} is not staged")]
    NotStaged(BatchId),

    #[error("serial range overlaps a committed batch; current maximum is {watermark}")]
    WatermarkConflict { watermark: u64 },

    #[error("batch {batch_id} has {staged} staged device numbers, expected {expected}")]
    Incomplete {
        batch_id: BatchId,
        staged: u64,
        expected: u64,
    },

    #[error("store lock poisoned")]
    Poisoned,
}

impl StoreError {
    /// Infrastructure faults a caller may retry as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Backend(_) | StoreError::Poisoned)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NumberFilter {
    pub batch_id: Option<BatchId>,
    /// Substring match on the encoded device number.
    pub contains: Option<String>,
}

impl NumberFilter {
    pub fn batch(batch_id: BatchId) -> Self {
        NumberFilter {
            batch_id: Some(batch_id),
            contains: None,
        }
    }

    pub fn matches(&self, number: &DeviceNumber) -> bool {
        self.batch_id.map_or(true, |id| number.batch_id == id)
            && self
                .contains
                .as_deref()
                .map_or(true, |needle| number.device_number.contains(needle))
    }
}

/// 1-based page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: u32,
    pub limit: u32,
}

impl PageRequest {
    pub fn new(page: u32, limit: u32) -> Self {
        PageRequest {
            page: page.max(1),
            limit: limit.max(1),
        }
    }

    pub fn offset(&self) -> usize {
        (self.page.max(1) as usize - 1) * self.limit as usize
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        PageRequest { page: 1, limit: 10 }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
}

impl<T> Page<T> {
    pub(crate) fn slice(all: Vec<T>, page: PageRequest) -> Self {
        let total = all.len() as u64;
        let items = all
            .into_iter()
            .skip(page.offset())
            .take(page.limit as usize)
            .collect();
        Page { items, total }
    }
}

#[async_trait]
pub trait FactoryDirectory: Send + Sync {
    async fn get(&self, factory_id: FactoryId) -> Result<Option<Factory>, StoreError>;
}

#[async_trait]
pub trait BatchStore: Send + Sync {
    /// Highest end serial among the factory's committed batches, 0 if none.
    async fn max_end_serial(&self, factory_id: FactoryId) -> Result<u64, StoreError>;

    /// Stages a batch and assigns its identity.
    async fn insert(&self, batch: NewBatch) -> Result<ProductionBatch, StoreError>;

    /// Atomically publishes a staged batch and its device numbers, provided
    /// every serial has a number and the range still starts above the
    /// factory's committed watermark.
    async fn commit(&self, batch_id: BatchId) -> Result<ProductionBatch, StoreError>;

    /// Drops a staged batch and its numbers. Committed batches are untouched.
    async fn discard(&self, batch_id: BatchId) -> Result<(), StoreError>;

    async fn get_batch(&self, batch_id: BatchId) -> Result<Option<ProductionBatch>, StoreError>;

    /// Committed batches of a factory, lowest serials first.
    async fn list_by_factory(&self, factory_id: FactoryId)
        -> Result<Vec<ProductionBatch>, StoreError>;
}

#[async_trait]
pub trait NumberStore: Send + Sync {
    /// Attaches numbers to their staged batch and returns how many were stored.
    async fn bulk_insert(&self, numbers: Vec<NewDeviceNumber>) -> Result<usize, StoreError>;

    async fn query(
        &self,
        filter: &NumberFilter,
        page: PageRequest,
    ) -> Result<Page<DeviceNumber>, StoreError>;
}

/// Everything the allocator needs from storage.
pub trait AllocationStore: FactoryDirectory + BatchStore + NumberStore {}

impl<T: FactoryDirectory + BatchStore + NumberStore> AllocationStore for T {}

#[derive(Debug)]
struct Staged {
    batch: ProductionBatch,
    numbers: Vec<DeviceNumber>,
}

#[derive(Debug, Default)]
struct State {
    factories: HashMap<FactoryId, Factory>,
    batches: BTreeMap<BatchId, ProductionBatch>,
    numbers: BTreeMap<BatchId, Vec<DeviceNumber>>,
    staged: HashMap<BatchId, Staged>,
    watermarks: HashMap<FactoryId, u64>,
    next_batch_id: BatchId,
    next_number_id: u64,
}

/// Process-local store. Every mutation happens under one write lock, which
/// makes `commit` a single atomic step.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: RwLock<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        InMemoryStore::default()
    }

    pub fn put_factory(&self, factory: Factory) -> Result<(), StoreError> {
        let mut state = self.state.write().map_err(|_| StoreError::Poisoned)?;
        state.factories.insert(factory.id, factory);
        Ok(())
    }

    /// Batches currently staged and not yet committed or discarded.
    pub fn staged_count(&self) -> Result<usize, StoreError> {
        let state = self.state.read().map_err(|_| StoreError::Poisoned)?;
        Ok(state.staged.len())
    }
}

#[async_trait]
impl FactoryDirectory for InMemoryStore {
    async fn get(&self, factory_id: FactoryId) -> Result<Option<Factory>, StoreError> {
        let state = self.state.read().map_err(|_| StoreError::Poisoned)?;
        Ok(state.factories.get(&factory_id).cloned())
    }
}

#[async_trait]
impl BatchStore for InMemoryStore {
    async fn max_end_serial(&self, factory_id: FactoryId) -> Result<u64, StoreError> {
        let state = self.state.read().map_err(|_| StoreError::Poisoned)?;
        Ok(state.watermarks.get(&factory_id).copied().unwrap_or(0))
    }

    async fn insert(&self, batch: NewBatch) -> Result<ProductionBatch, StoreError> {
        let mut state = self.state.write().map_err(|_| StoreError::Poisoned)?;
        state.next_batch_id += 1;
        let batch = ProductionBatch::from_new(state.next_batch_id, batch, Utc::now());
        state.staged.insert(
            batch.id,
            Staged {
                batch: batch.clone(),
                numbers: Vec::new(),
            },
        );
        Ok(batch)
    }

    async fn commit(&self, batch_id: BatchId) -> Result<ProductionBatch, StoreError> {
        let mut state = self.state.write().map_err(|_| StoreError::Poisoned)?;
        let (batch, staged_count) = match state.staged.get(&batch_id) {
            Some(staged) => (staged.batch.clone(), staged.numbers.len() as u64),
            None => return Err(StoreError::NotStaged(batch_id)),
        };
        if staged_count != batch.len() {
            return Err(StoreError::Incomplete {
                batch_id,
                staged: staged_count,
                expected: batch.len(),
            });
        }

        let watermark = state.watermarks.get(&batch.factory_id).copied().unwrap_or(0);
        if batch.start_serial <= watermark {
            return Err(StoreError::WatermarkConflict { watermark });
        }

        let numbers = state
            .staged
            .remove(&batch_id)
            .map(|staged| staged.numbers)
            .unwrap_or_default();
        state.watermarks.insert(batch.factory_id, batch.end_serial);
        state.numbers.insert(batch_id, numbers);
        state.batches.insert(batch_id, batch.clone());
        Ok(batch)
    }

    async fn discard(&self, batch_id: BatchId) -> Result<(), StoreError> {
        let mut state = self.state.write().map_err(|_| StoreError::Poisoned)?;
        state.staged.remove(&batch_id);
        Ok(())
    }

    async fn get_batch(&self, batch_id: BatchId) -> Result<Option<ProductionBatch>, StoreError> {
        let state = self.state.read().map_err(|_| StoreError::Poisoned)?;
        Ok(state.batches.get(&batch_id).cloned())
    }

    async fn list_by_factory(
        &self,
        factory_id: FactoryId,
    ) -> Result<Vec<ProductionBatch>, StoreError> {
        let state = self.state.read().map_err(|_| StoreError::Poisoned)?;
        let mut batches: Vec<ProductionBatch> = state
            .batches
            .values()
            .filter(|b| b.factory_id == factory_id)
            .cloned()
            .collect();
        batches.sort_by_key(|b| b.start_serial);
        Ok(batches)
    }
}

#[async_trait]
impl NumberStore for InMemoryStore {
    async fn bulk_insert(&self, numbers: Vec<NewDeviceNumber>) -> Result<usize, StoreError> {
        let mut state = self.state.write().map_err(|_| StoreError::Poisoned)?;
        if let Some(missing) = numbers.iter().find(|n| !state.staged.contains_key(&n.batch_id)) {
            return Err(StoreError::NotStaged(missing.batch_id));
        }

        let now = Utc::now();
        let count = numbers.len();
        for number in numbers {
            state.next_number_id += 1;
            let id = state.next_number_id;
            if let Some(staged) = state.staged.get_mut(&number.batch_id) {
                staged.numbers.push(DeviceNumber::from_new(id, number, now));
            }
        }
        Ok(count)
    }

    async fn query(
        &self,
        filter: &NumberFilter,
        page: PageRequest,
    ) -> Result<Page<DeviceNumber>, StoreError> {
        let state = self.state.read().map_err(|_| StoreError::Poisoned)?;
        let mut matched: Vec<DeviceNumber> = state
            .numbers
            .iter()
            .filter(|(batch_id, _)| filter.batch_id.map_or(true, |id| id == **batch_id))
            .flat_map(|(_, numbers)| numbers.iter())
            .filter(|n| filter.matches(n))
            .cloned()
            .collect();
        matched.sort_by_key(|n| n.id);
        Ok(Page::slice(matched, page))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BatchAttributes, BatchStatus, DeviceNumberStatus, FactoryStatus};
    use chrono::NaiveDate;

    fn factory(id: FactoryId) -> Factory {
        Factory {
            id,
            name: format!("factory-{id}"),
            code: format!("F{id:03}"),
            country: "86".to_string(),
            status: FactoryStatus::Enabled,
        }
    }

    fn new_batch(factory_id: FactoryId, start: u64, end: u64) -> NewBatch {
        NewBatch {
            factory_id,
            attributes: BatchAttributes {
                model_type: "04".to_string(),
                hardware_version: "11".to_string(),
                agent_code: "028".to_string(),
                production_date: NaiveDate::from_ymd_opt(2025, 10, 5).unwrap(),
            },
            start_serial: start,
            end_serial: end,
            status: BatchStatus::Pending,
        }
    }

    fn numbers_for(batch: &ProductionBatch) -> Vec<NewDeviceNumber> {
        (batch.start_serial..=batch.end_serial)
            .map(|serial| NewDeviceNumber {
                batch_id: batch.id,
                serial,
                device_number: format!("8600602825100411{serial:07}"),
                status: DeviceNumberStatus::Generated,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_put_and_get_factory() {
        let store = InMemoryStore::new();
        store.put_factory(factory(6)).unwrap();

        assert_eq!(store.get(6).await.unwrap(), Some(factory(6)));
        assert_eq!(store.get(7).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_staged_batch_is_invisible_until_commit() {
        let store = InMemoryStore::new();
        let batch = store.insert(new_batch(6, 1, 3)).await.unwrap();
        store.bulk_insert(numbers_for(&batch)).await.unwrap();

        assert_eq!(store.max_end_serial(6).await.unwrap(), 0);
        assert_eq!(store.get_batch(batch.id).await.unwrap(), None);
        let page = store.query(&NumberFilter::batch(batch.id), PageRequest::default()).await.unwrap();
        assert_eq!(page.total, 0);

        store.commit(batch.id).await.unwrap();
        assert_eq!(store.max_end_serial(6).await.unwrap(), 3);
        assert_eq!(store.get_batch(batch.id).await.unwrap().unwrap().id, batch.id);
        assert_eq!(store.staged_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_commit_rejects_incomplete_batch() {
        let store = InMemoryStore::new();
        let batch = store.insert(new_batch(6, 1, 3)).await.unwrap();
        let mut numbers = numbers_for(&batch);
        numbers.pop();
        store.bulk_insert(numbers).await.unwrap();

        let err = store.commit(batch.id).await.unwrap_err();
        assert!(matches!(err, StoreError::Incomplete { staged: 2, expected: 3, .. }));
        assert_eq!(store.max_end_serial(6).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_commit_rejects_range_below_watermark() {
        let store = InMemoryStore::new();
        let first = store.insert(new_batch(6, 1, 10)).await.unwrap();
        let second = store.insert(new_batch(6, 5, 12)).await.unwrap();
        store.bulk_insert(numbers_for(&first)).await.unwrap();
        store.bulk_insert(numbers_for(&second)).await.unwrap();

        store.commit(first.id).await.unwrap();
        let err = store.commit(second.id).await.unwrap_err();
        assert!(matches!(err, StoreError::WatermarkConflict { watermark: 10 }));
        assert_eq!(store.list_by_factory(6).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_watermarks_are_per_factory() {
        let store = InMemoryStore::new();
        let a = store.insert(new_batch(1, 1, 50)).await.unwrap();
        let b = store.insert(new_batch(2, 1, 5)).await.unwrap();
        store.bulk_insert(numbers_for(&a)).await.unwrap();
        store.bulk_insert(numbers_for(&b)).await.unwrap();
        store.commit(a.id).await.unwrap();
        store.commit(b.id).await.unwrap();

        assert_eq!(store.max_end_serial(1).await.unwrap(), 50);
        assert_eq!(store.max_end_serial(2).await.unwrap(), 5);
        assert_eq!(store.max_end_serial(3).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_bulk_insert_requires_staged_batch() {
        let store = InMemoryStore::new();
        let batch = store.insert(new_batch(6, 1, 2)).await.unwrap();
        store.bulk_insert(numbers_for(&batch)).await.unwrap();
        store.commit(batch.id).await.unwrap();

        let err = store.bulk_insert(numbers_for(&batch)).await.unwrap_err();
        assert!(matches!(err, StoreError::NotStaged(id) if id == batch.id));
    }

    #[tokio::test]
    async fn test_discard_drops_staged_rows_only() {
        let store = InMemoryStore::new();
        let kept = store.insert(new_batch(6, 1, 2)).await.unwrap();
        store.bulk_insert(numbers_for(&kept)).await.unwrap();
        store.commit(kept.id).await.unwrap();

        let dropped = store.insert(new_batch(6, 3, 4)).await.unwrap();
        store.bulk_insert(numbers_for(&dropped)).await.unwrap();
        store.discard(dropped.id).await.unwrap();
        store.discard(kept.id).await.unwrap();

        assert_eq!(store.staged_count().unwrap(), 0);
        assert!(store.get_batch(kept.id).await.unwrap().is_some());
        assert!(matches!(store.commit(dropped.id).await, Err(StoreError::NotStaged(_))));
        assert_eq!(store.max_end_serial(6).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_query_filters_and_paginates() {
        let store = InMemoryStore::new();
        let batch = store.insert(new_batch(6, 1, 25)).await.unwrap();
        store.bulk_insert(numbers_for(&batch)).await.unwrap();
        store.commit(batch.id).await.unwrap();

        let page = store
            .query(&NumberFilter::batch(batch.id), PageRequest::new(3, 10))
            .await
            .unwrap();
        assert_eq!(page.total, 25);
        assert_eq!(page.items.len(), 5);
        assert_eq!(page.items[0].serial, 21);

        let filter = NumberFilter {
            batch_id: None,
            contains: Some("0000012".to_string()),
        };
        let page = store.query(&filter, PageRequest::default()).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].device_number, "86006028251004110000012");
    }
}
