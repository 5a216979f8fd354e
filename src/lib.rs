pub mod batch_allocator;
pub mod config;
pub mod device_number_encoder;
pub mod http;
pub mod metrics;
pub mod model;
pub mod redis_store;
pub mod serial_range_validator;
pub mod store;

pub use batch_allocator::{AllocateError, AllocatorConfig, BatchAllocator, ErrorKind};
pub use device_number_encoder::{encode_device_number, DevicePrefix, EncodeError};
pub use model::{
    BatchAttributes, BatchStatus, CreateBatchRequest, DeviceNumber, Factory, ProductionBatch,
};
pub use serial_range_validator::{validate, RangeError, SerialRange};
pub use store::{
    AllocationStore, BatchStore, FactoryDirectory, InMemoryStore, NumberStore, StoreError,
};
