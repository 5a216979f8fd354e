use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub type FactoryId = u64;
pub type BatchId = u64;
pub type DeviceNumberId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("unknown status code {0}")]
pub struct UnknownStatusCode(pub u8);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum FactoryStatus {
    Disabled,
    Enabled,
}

impl FactoryStatus {
    pub fn code(self) -> u8 {
        match self {
            FactoryStatus::Disabled => 0,
            FactoryStatus::Enabled => 1,
        }
    }
}

impl From<FactoryStatus> for u8 {
    fn from(status: FactoryStatus) -> u8 {
        status.code()
    }
}

impl TryFrom<u8> for FactoryStatus {
    type Error = UnknownStatusCode;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(FactoryStatus::Disabled),
            1 => Ok(FactoryStatus::Enabled),
            other => Err(UnknownStatusCode(other)),
        }
    }
}

impl Default for FactoryStatus {
    fn default() -> Self {
        Self::Enabled
    }
}

/// A factory as seen by the allocator. `country` is kept as the stored string
/// and only parsed when a device number is encoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Factory {
    pub id: FactoryId,
    pub name: String,
    pub code: String,
    pub country: String,
    #[serde(default)]
    pub status: FactoryStatus,
}

/// Batch lifecycle. Serialized as the numeric code of the persisted
/// `tinyint` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum BatchStatus {
    Pending,
    InProduction,
    Produced,
    Voided,
}

impl BatchStatus {
    pub fn code(self) -> u8 {
        match self {
            BatchStatus::Pending => 0,
            BatchStatus::InProduction => 1,
            BatchStatus::Produced => 2,
            BatchStatus::Voided => 3,
        }
    }
}

impl From<BatchStatus> for u8 {
    fn from(status: BatchStatus) -> u8 {
        status.code()
    }
}

impl TryFrom<u8> for BatchStatus {
    type Error = UnknownStatusCode;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(BatchStatus::Pending),
            1 => Ok(BatchStatus::InProduction),
            2 => Ok(BatchStatus::Produced),
            3 => Ok(BatchStatus::Voided),
            other => Err(UnknownStatusCode(other)),
        }
    }
}

impl Default for BatchStatus {
    fn default() -> Self {
        Self::Pending
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum DeviceNumberStatus {
    Generated,
}

impl DeviceNumberStatus {
    pub fn code(self) -> u8 {
        match self {
            DeviceNumberStatus::Generated => 1,
        }
    }
}

impl From<DeviceNumberStatus> for u8 {
    fn from(status: DeviceNumberStatus) -> u8 {
        status.code()
    }
}

impl TryFrom<u8> for DeviceNumberStatus {
    type Error = UnknownStatusCode;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(DeviceNumberStatus::Generated),
            other => Err(UnknownStatusCode(other)),
        }
    }
}

impl Default for DeviceNumberStatus {
    fn default() -> Self {
        Self::Generated
    }
}

/// Batch fields that feed into the device number. The codes are stored as
/// strings and must parse as plain decimal integers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchAttributes {
    pub model_type: String,
    pub hardware_version: String,
    pub agent_code: String,
    pub production_date: NaiveDate,
}

/// Input of `createBatch`. Bounds are optional because a missing bound is a
/// reportable validation failure, not a deserialization error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateBatchRequest {
    pub factory_id: FactoryId,
    #[serde(flatten)]
    pub attributes: BatchAttributes,
    #[serde(default, rename = "startSerialNumber")]
    pub start_serial: Option<i64>,
    #[serde(default, rename = "endSerialNumber")]
    pub end_serial: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewBatch {
    pub factory_id: FactoryId,
    pub attributes: BatchAttributes,
    pub start_serial: u64,
    pub end_serial: u64,
    pub status: BatchStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductionBatch {
    pub id: BatchId,
    pub factory_id: FactoryId,
    #[serde(flatten)]
    pub attributes: BatchAttributes,
    #[serde(rename = "startSerialNumber")]
    pub start_serial: u64,
    #[serde(rename = "endSerialNumber")]
    pub end_serial: u64,
    pub status: BatchStatus,
    pub created_at: DateTime<Utc>,
}

impl ProductionBatch {
    pub fn from_new(id: BatchId, batch: NewBatch, created_at: DateTime<Utc>) -> Self {
        ProductionBatch {
            id,
            factory_id: batch.factory_id,
            attributes: batch.attributes,
            start_serial: batch.start_serial,
            end_serial: batch.end_serial,
            status: batch.status,
            created_at,
        }
    }

    /// Number of serials owned by the batch.
    pub fn len(&self) -> u64 {
        self.end_serial - self.start_serial + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewDeviceNumber {
    pub batch_id: BatchId,
    pub serial: u64,
    pub device_number: String,
    pub status: DeviceNumberStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceNumber {
    pub id: DeviceNumberId,
    pub batch_id: BatchId,
    pub serial: u64,
    pub device_number: String,
    pub status: DeviceNumberStatus,
    pub created_at: DateTime<Utc>,
}

impl DeviceNumber {
    pub fn from_new(id: DeviceNumberId, number: NewDeviceNumber, created_at: DateTime<Utc>) -> Self {
        DeviceNumber {
            id,
            batch_id: number.batch_id,
            serial: number.serial,
            device_number: number.device_number,
            status: number.status,
            created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_status_codes_match_storage() {
        for status in [
            BatchStatus::Pending,
            BatchStatus::InProduction,
            BatchStatus::Produced,
            BatchStatus::Voided,
        ] {
            assert_eq!(BatchStatus::try_from(status.code()), Ok(status));
        }
        assert_eq!(BatchStatus::try_from(9), Err(UnknownStatusCode(9)));
        assert_eq!(DeviceNumberStatus::Generated.code(), 1);
        assert_eq!(DeviceNumberStatus::try_from(0), Err(UnknownStatusCode(0)));
    }

    #[test]
    fn test_statuses_serialize_as_numeric_codes() {
        assert_eq!(serde_json::to_string(&BatchStatus::Pending).unwrap(), "0");
        assert_eq!(serde_json::to_string(&BatchStatus::Voided).unwrap(), "3");
        assert_eq!(serde_json::to_string(&DeviceNumberStatus::Generated).unwrap(), "1");
        assert_eq!(serde_json::to_string(&FactoryStatus::Disabled).unwrap(), "0");

        let status: BatchStatus = serde_json::from_str("2").unwrap();
        assert_eq!(status, BatchStatus::Produced);
        assert!(serde_json::from_str::<BatchStatus>("7").is_err());
        assert!(serde_json::from_str::<BatchStatus>("\"PENDING\"").is_err());
    }

    #[test]
    fn test_create_request_uses_camel_case_serial_names() {
        let request: CreateBatchRequest = serde_json::from_str(
            r#"{
                "factoryId": 6,
                "modelType": "04",
                "hardwareVersion": "11",
                "agentCode": "028",
                "productionDate": "2025-10-05",
                "startSerialNumber": 1,
                "endSerialNumber": 3
            }"#,
        )
        .unwrap();

        assert_eq!(request.factory_id, 6);
        assert_eq!(request.attributes.agent_code, "028");
        assert_eq!(
            request.attributes.production_date,
            NaiveDate::from_ymd_opt(2025, 10, 5).unwrap()
        );
        assert_eq!(request.start_serial, Some(1));
        assert_eq!(request.end_serial, Some(3));
    }

    #[test]
    fn test_create_request_bounds_are_optional() {
        let request: CreateBatchRequest = serde_json::from_str(
            r#"{
                "factoryId": 6,
                "modelType": "04",
                "hardwareVersion": "11",
                "agentCode": "028",
                "productionDate": "2025-10-05"
            }"#,
        )
        .unwrap();

        assert_eq!(request.start_serial, None);
        assert_eq!(request.end_serial, None);
    }

    #[test]
    fn test_batch_len_is_inclusive() {
        let batch = ProductionBatch::from_new(
            1,
            NewBatch {
                factory_id: 6,
                attributes: BatchAttributes {
                    model_type: "04".into(),
                    hardware_version: "11".into(),
                    agent_code: "028".into(),
                    production_date: NaiveDate::from_ymd_opt(2025, 10, 5).unwrap(),
                },
                start_serial: 4,
                end_serial: 10,
                status: BatchStatus::Pending,
            },
            Utc::now(),
        );
        assert_eq!(batch.len(), 7);

        let json = serde_json::to_value(&batch).unwrap();
        assert_eq!(json["status"], 0);
        assert_eq!(json["startSerialNumber"], 4);
        let back: ProductionBatch = serde_json::from_value(json).unwrap();
        assert_eq!(back, batch);
    }
}
