use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::device_number_encoder::{DevicePrefix, EncodeError};
use crate::metrics::Metrics;
use crate::model::{
    BatchId, BatchStatus, CreateBatchRequest, DeviceNumberStatus, FactoryId, NewBatch,
    NewDeviceNumber, ProductionBatch,
};
use crate::serial_range_validator::{self, RangeError, SerialRange};
use crate::store::{AllocationStore, StoreError};

#[derive(Debug, Clone)]
pub struct AllocatorConfig {
    /// Largest number of serials a single batch may reserve.
    pub max_batch_size: u64,
    /// Device numbers generated and written per `bulk_insert` call.
    pub chunk_size: u64,
    /// Upper bound on one allocation, staging through commit.
    pub timeout: Duration,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        AllocatorConfig {
            max_batch_size: 100_000,
            chunk_size: 1_000,
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Reference,
    Encoding,
    Storage,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Reference => "reference",
            ErrorKind::Encoding => "encoding",
            ErrorKind::Storage => "storage",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AllocateError {
    #[error("factory {0} not found")]
    FactoryNotFound(FactoryId),

    #[error(transparent)]
    Range(#[from] RangeError),

    #[error("batch of {requested} serials exceeds the limit of {limit}")]
    RangeTooLarge { requested: u64, limit: u64 },

    #[error("cannot encode device numbers: {0}")]
    Encoding(#[from] EncodeError),

    #[error(transparent)]
    Storage(#[from] StoreError),

    #[error("batch allocation did not finish within {0:?}")]
    Timeout(Duration),
}

impl AllocateError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AllocateError::FactoryNotFound(_) => ErrorKind::Reference,
            AllocateError::Range(_) | AllocateError::RangeTooLarge { .. } => ErrorKind::Validation,
            AllocateError::Encoding(_) => ErrorKind::Encoding,
            AllocateError::Storage(_) | AllocateError::Timeout(_) => ErrorKind::Storage,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            AllocateError::Storage(err) => err.is_retryable(),
            AllocateError::Timeout(_) => true,
            _ => false,
        }
    }
}

/// Creates production batches and the device numbers they own.
pub struct BatchAllocator {
    store: Arc<dyn AllocationStore>,
    config: AllocatorConfig,
    metrics: Arc<Metrics>,
}

impl BatchAllocator {
    pub fn new(store: Arc<dyn AllocationStore>, config: AllocatorConfig, metrics: Arc<Metrics>) -> Self {
        BatchAllocator {
            store,
            config,
            metrics,
        }
    }

    /// Reserves `[start, end]` for the factory and persists one device number
    /// per serial. Either the batch and all of its numbers become visible, or
    /// nothing does.
    #[tracing::instrument(
        name = "create_batch",
        skip_all,
        fields(
            allocation_id = %Uuid::new_v4(),
            factory_id = request.factory_id,
            start = ?request.start_serial,
            end = ?request.end_serial
        )
    )]
    pub async fn create_batch(
        &self,
        request: CreateBatchRequest,
    ) -> Result<ProductionBatch, AllocateError> {
        let timer = self.metrics.allocation_seconds.start_timer();
        let result = self.allocate(request).await;
        timer.observe_duration();

        match &result {
            Ok(batch) => {
                self.metrics.batches_created.inc();
                self.metrics.device_numbers_generated.inc_by(batch.len());
                info!(batch_id = batch.id, count = batch.len(), "batch created");
            }
            Err(err) => {
                self.metrics.record_rejection(err.kind().as_str());
                warn!(kind = err.kind().as_str(), error = %err, "batch rejected");
            }
        }
        result
    }

    async fn allocate(&self, request: CreateBatchRequest) -> Result<ProductionBatch, AllocateError> {
        // The deadline covers everything up to a fully staged batch. The
        // commit runs outside it: once the store may have applied the commit,
        // abandoning the call would report a failure for a visible batch.
        let staging = tokio::time::timeout(self.config.timeout, self.stage(&request));
        let (staged, guard) = match staging.await {
            Ok(staged) => staged?,
            Err(_) => return Err(AllocateError::Timeout(self.config.timeout)),
        };

        match self.commit(&staged, &request).await {
            Ok(batch) => {
                guard.disarm();
                Ok(batch)
            }
            Err(err) => {
                guard.discard().await;
                Err(err)
            }
        }
    }

    /// Validates the request, stages the batch and writes every device number
    /// into staging. A dropped future leaves cleanup to the returned guard's
    /// `Drop`.
    async fn stage(
        &self,
        request: &CreateBatchRequest,
    ) -> Result<(ProductionBatch, StagingGuard), AllocateError> {
        let factory = self
            .store
            .get(request.factory_id)
            .await?
            .ok_or(AllocateError::FactoryNotFound(request.factory_id))?;

        let watermark = self.store.max_end_serial(factory.id).await?;
        let range =
            serial_range_validator::validate(request.start_serial, request.end_serial, watermark)?;

        if range.len() > self.config.max_batch_size {
            return Err(AllocateError::RangeTooLarge {
                requested: range.len(),
                limit: self.config.max_batch_size,
            });
        }

        // The prefix and the widest serial are checked before anything is
        // written; every other serial in range is narrower.
        let prefix = DevicePrefix::new(&factory, &request.attributes)?;
        prefix.encode(range.end())?;
        debug!(prefix = prefix.as_str(), watermark, "range accepted");

        let staged = self
            .store
            .insert(NewBatch {
                factory_id: factory.id,
                attributes: request.attributes.clone(),
                start_serial: range.start(),
                end_serial: range.end(),
                status: BatchStatus::Pending,
            })
            .await?;
        let guard = StagingGuard::new(Arc::clone(&self.store), staged.id);

        match self.fill(&staged, &prefix, range).await {
            Ok(()) => Ok((staged, guard)),
            Err(err) => {
                guard.discard().await;
                Err(err)
            }
        }
    }

    async fn fill(
        &self,
        staged: &ProductionBatch,
        prefix: &DevicePrefix,
        range: SerialRange,
    ) -> Result<(), AllocateError> {
        for chunk in range.chunks(self.config.chunk_size) {
            let numbers = chunk
                .map(|serial| -> Result<NewDeviceNumber, EncodeError> {
                    Ok(NewDeviceNumber {
                        batch_id: staged.id,
                        serial,
                        device_number: prefix.encode(serial)?,
                        status: DeviceNumberStatus::Generated,
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            let written = self.store.bulk_insert(numbers).await?;
            debug!(batch_id = staged.id, written, "staged device numbers");
        }
        Ok(())
    }

    async fn commit(
        &self,
        staged: &ProductionBatch,
        request: &CreateBatchRequest,
    ) -> Result<ProductionBatch, AllocateError> {
        // Concurrency Control Strategy:
        // Allocation is optimistic. The watermark read during staging is not
        // locked; instead the store's commit re-checks `start > watermark`
        // and publishes the batch in the same atomic step. If another batch
        // of this factory committed in between, the range is re-validated
        // against the watermark that won, which reports the usual rejection.
        match self.store.commit(staged.id).await {
            Ok(batch) => Ok(batch),
            Err(StoreError::WatermarkConflict { watermark }) => {
                warn!(
                    factory_id = staged.factory_id,
                    watermark, "serial range claimed by a concurrent batch"
                );
                serial_range_validator::validate(
                    request.start_serial,
                    request.end_serial,
                    watermark,
                )?;
                Err(StoreError::WatermarkConflict { watermark }.into())
            }
            Err(err) => Err(err.into()),
        }
    }
}

/// Drops a staged batch unless the allocation committed it. Covers early
/// returns as well as a future cancelled by timeout or disconnect.
struct StagingGuard {
    store: Option<Arc<dyn AllocationStore>>,
    batch_id: BatchId,
}

impl StagingGuard {
    fn new(store: Arc<dyn AllocationStore>, batch_id: BatchId) -> Self {
        StagingGuard {
            store: Some(store),
            batch_id,
        }
    }

    fn disarm(mut self) {
        self.store = None;
    }

    async fn discard(mut self) {
        if let Some(store) = self.store.take() {
            if let Err(err) = store.discard(self.batch_id).await {
                warn!(batch_id = self.batch_id, error = %err, "failed to discard staged batch");
            }
        }
    }
}

impl Drop for StagingGuard {
    fn drop(&mut self) {
        let Some(store) = self.store.take() else {
            return;
        };
        let batch_id = self.batch_id;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = store.discard(batch_id).await {
                        warn!(batch_id, error = %err, "failed to discard abandoned batch");
                    }
                });
            }
            Err(_) => warn!(batch_id, "no runtime to discard abandoned batch"),
        }
    }
}
