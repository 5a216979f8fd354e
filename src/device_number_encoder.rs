//! Fixed-width device number encoding.
//!
//! A device number is 23 decimal digits: country (2), factory id (3),
//! agent code (3), production year (2), production month (2), model type (2),
//! hardware version (2) and serial (7). Every field is left-padded with zeros
//! and a value that does not fit its width is rejected instead of widening
//! the number.

use std::sync::OnceLock;

use chrono::Datelike;
use regex::Regex;

use crate::model::{BatchAttributes, Factory};

pub const DEVICE_NUMBER_LEN: usize = 23;
pub const PREFIX_LEN: usize = DEVICE_NUMBER_LEN - SERIAL_WIDTH;
pub const SERIAL_WIDTH: usize = 7;
pub const SERIAL_MAX: u64 = 9_999_999;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Country,
    FactoryId,
    AgentCode,
    Year,
    Month,
    ModelType,
    HardwareVersion,
    Serial,
}

impl Field {
    pub fn width(self) -> usize {
        match self {
            Field::Country => 2,
            Field::FactoryId => 3,
            Field::AgentCode => 3,
            Field::Year => 2,
            Field::Month => 2,
            Field::ModelType => 2,
            Field::HardwareVersion => 2,
            Field::Serial => SERIAL_WIDTH,
        }
    }

    fn max(self) -> u64 {
        10u64.pow(self.width() as u32) - 1
    }
}

impl std::fmt::Display for Field {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Field::Country => "country",
            Field::FactoryId => "factory id",
            Field::AgentCode => "agent code",
            Field::Year => "year",
            Field::Month => "month",
            Field::ModelType => "model type",
            Field::HardwareVersion => "hardware version",
            Field::Serial => "serial",
        };
        f.write_str(name)
    }
}

/// Stored data that cannot be encoded. These point at corrupt upstream
/// records, not at a bad request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    #[error("{field} value {value:?} is not a decimal number")]
    NonNumeric { field: Field, value: String },

    #[error("{field} value {value} does not fit in {width} digits")]
    FieldOverflow {
        field: Field,
        value: String,
        width: usize,
    },
}

fn digits() -> &'static Regex {
    static DIGITS: OnceLock<Regex> = OnceLock::new();
    DIGITS.get_or_init(|| Regex::new(r"^[0-9]+$").expect("digit pattern is valid"))
}

fn parse_field(field: Field, raw: &str) -> Result<u64, EncodeError> {
    if !digits().is_match(raw) {
        return Err(EncodeError::NonNumeric {
            field,
            value: raw.to_string(),
        });
    }
    // All digits, so the only possible parse failure is a value wider than u64.
    raw.parse::<u64>().map_err(|_| EncodeError::FieldOverflow {
        field,
        value: raw.to_string(),
        width: field.width(),
    })
}

fn push_field(out: &mut String, field: Field, value: u64) -> Result<(), EncodeError> {
    if value > field.max() {
        return Err(EncodeError::FieldOverflow {
            field,
            value: value.to_string(),
            width: field.width(),
        });
    }
    out.push_str(&format!("{:0width$}", value, width = field.width()));
    Ok(())
}

/// The 16 leading digits shared by every device number of one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevicePrefix {
    digits: String,
}

impl DevicePrefix {
    pub fn new(factory: &Factory, attributes: &BatchAttributes) -> Result<Self, EncodeError> {
        let date = attributes.production_date;
        let mut digits = String::with_capacity(DEVICE_NUMBER_LEN);

        push_field(&mut digits, Field::Country, parse_field(Field::Country, &factory.country)?)?;
        push_field(&mut digits, Field::FactoryId, factory.id)?;
        push_field(
            &mut digits,
            Field::AgentCode,
            parse_field(Field::AgentCode, &attributes.agent_code)?,
        )?;
        push_field(&mut digits, Field::Year, date.year().rem_euclid(100) as u64)?;
        push_field(&mut digits, Field::Month, date.month() as u64)?;
        push_field(
            &mut digits,
            Field::ModelType,
            parse_field(Field::ModelType, &attributes.model_type)?,
        )?;
        push_field(
            &mut digits,
            Field::HardwareVersion,
            parse_field(Field::HardwareVersion, &attributes.hardware_version)?,
        )?;

        debug_assert_eq!(digits.len(), PREFIX_LEN);
        Ok(DevicePrefix { digits })
    }

    pub fn as_str(&self) -> &str {
        &self.digits
    }

    /// Appends the zero-padded serial. Strictly increasing in `serial`.
    pub fn encode(&self, serial: u64) -> Result<String, EncodeError> {
        let mut number = self.digits.clone();
        push_field(&mut number, Field::Serial, serial)?;
        Ok(number)
    }
}

/// Encodes a single device number from factory and batch attributes.
pub fn encode_device_number(
    factory: &Factory,
    attributes: &BatchAttributes,
    serial: u64,
) -> Result<String, EncodeError> {
    DevicePrefix::new(factory, attributes)?.encode(serial)
}
