//! Smart Box Protocol
//!
//! This module contains the protocol definitions for communicating with
//! the ESP32 smart box

use crate::domain::slots::{Slot, SlotTable};
use anyhow::Result;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use thiserror::Error;
use uuid::Uuid;

/// Name the smart box firmware advertises
pub const DEVICE_NAME: &str = "ESP32SB";

/// Smart box GATT service (16-bit short form)
pub const SERVICE_UUID: &str = "1111";

/// Slot table notifications from the box
pub const SLOT_NOTIFY_CHAR_UUID: &str = "2222";

/// Slot write / clear commands to the box
pub const SLOT_COMMAND_CHAR_UUID: &str = "3333";

/// Scalar ("heart-rate") writes. Deprecated: only early firmware listens here.
pub const SCALAR_CHAR_UUID: &str = "4444";

/// Per-slot LED commands
pub const LIGHT_CHAR_UUID: &str = "6666";

/// MTU requested after connecting
pub const DEFAULT_MTU: u16 = 500;

/// Second field of a slot segment marking a free cell
pub const EMPTY_SENTINEL: &str = "Empty";

pub const FIELD_SEPARATOR: char = '|';
pub const SLOT_SEPARATOR: char = '#';

/// Bluetooth Base UUID, used to expand 16/32-bit short ids
const BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5f9b_34fb;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("Malformed slot segment: {0:?}")]
    MalformedSlot(String),

    #[error("Duplicate slot id {0:?}")]
    DuplicateId(String),

    #[error("Characteristic value is not valid base64: {0}")]
    InvalidBase64(String),

    #[error("Characteristic value is not valid UTF-8")]
    InvalidUtf8,
}

/// Slot fields the box could not parse back as written
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("Slot id must not be empty")]
    MissingId,

    #[error("{field} {value:?} must not contain '|' or '#'")]
    Separator { field: &'static str, value: String },

    #[error("\"Empty\" is reserved and cannot be used as a brand")]
    ReservedBrand,
}

fn check_field(field: &'static str, value: &str) -> Result<(), EncodeError> {
    if value.contains(FIELD_SEPARATOR) || value.contains(SLOT_SEPARATOR) {
        return Err(EncodeError::Separator {
            field,
            value: value.to_string(),
        });
    }
    Ok(())
}

/// Check a slot id before it goes on the wire
pub fn validate_id(id: &str) -> Result<(), EncodeError> {
    if id.is_empty() {
        return Err(EncodeError::MissingId);
    }
    check_field("id", id)
}

/// Check a slot record so that it decodes back to the same slot.
///
/// A brand equal to the empty sentinel would read back as a free cell.
pub fn validate_slot(
    id: &str,
    brand: &str,
    model: &str,
    color: &str,
    year: &str,
) -> Result<(), EncodeError> {
    validate_id(id)?;
    check_field("brand", brand)?;
    check_field("model", model)?;
    check_field("color", color)?;
    check_field("year", year)?;
    if brand == EMPTY_SENTINEL {
        return Err(EncodeError::ReservedBrand);
    }
    Ok(())
}

/// Which command characteristic a [`SlotCommand`] is written to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandTarget {
    Slot,
    Light,
}

/// Commands the box understands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotCommand {
    /// Store a car description in a slot
    Write {
        id: String,
        brand: String,
        model: String,
        color: String,
        year: String,
    },
    /// Mark a slot as free
    Clear { id: String },
    /// Switch the LED of a slot
    Light { id: String, on: bool },
}

impl SlotCommand {
    /// Validated slot write. All-blank fields become a clear.
    pub fn slot(
        id: &str,
        brand: &str,
        model: &str,
        color: &str,
        year: &str,
    ) -> Result<Self, EncodeError> {
        validate_slot(id, brand, model, color, year)?;
        if [brand, model, color, year].iter().all(|f| f.is_empty()) {
            return Ok(Self::Clear { id: id.to_string() });
        }
        Ok(Self::Write {
            id: id.to_string(),
            brand: brand.to_string(),
            model: model.to_string(),
            color: color.to_string(),
            year: year.to_string(),
        })
    }

    pub fn encode(&self) -> Result<String, EncodeError> {
        match self {
            Self::Write {
                id,
                brand,
                model,
                color,
                year,
            } => encode_slot(id, brand, model, color, year),
            Self::Clear { id } => encode_slot(id, "", "", "", ""),
            Self::Light { id, on } => encode_light(id, *on),
        }
    }

    pub fn target(&self) -> CommandTarget {
        match self {
            Self::Write { .. } | Self::Clear { .. } => CommandTarget::Slot,
            Self::Light { .. } => CommandTarget::Light,
        }
    }

    pub fn slot_id(&self) -> &str {
        match self {
            Self::Write { id, .. } | Self::Clear { id } | Self::Light { id, .. } => id,
        }
    }
}

/// Encode a slot write: `id|brand|model|color|year`, or `id|Empty` when every
/// descriptive field is blank.
pub fn encode_slot(
    id: &str,
    brand: &str,
    model: &str,
    color: &str,
    year: &str,
) -> Result<String, EncodeError> {
    validate_slot(id, brand, model, color, year)?;
    if [brand, model, color, year].iter().all(|f| f.is_empty()) {
        return Ok(format!("{}{}{}", id, FIELD_SEPARATOR, EMPTY_SENTINEL));
    }
    Ok([id, brand, model, color, year].join(&FIELD_SEPARATOR.to_string()))
}

/// Encode an LED command: `id|light|true` / `id|light|false`
pub fn encode_light(id: &str, on: bool) -> Result<String, EncodeError> {
    validate_id(id)?;
    Ok(format!("{id}{sep}light{sep}{on}", sep = FIELD_SEPARATOR))
}

/// Result of decoding one slot-table notification.
///
/// Bad segments do not abort the table: they are collected in `errors` and
/// the remaining segments still decode.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodedTable {
    pub table: SlotTable,
    pub errors: Vec<DecodeError>,
}

impl DecodedTable {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Decode a slot table
///
/// # Wire Format
///
/// ```text
/// <slot>#<slot>#...
///
/// slot := id|brand|model|color|year
///       | id|Empty[|ignored...]
/// ```
///
/// Empty segments (e.g. a trailing `#`) are skipped. Missing trailing fields
/// of an occupied slot decode as blank.
pub fn decode_table(raw: &str) -> DecodedTable {
    let mut decoded = DecodedTable::default();

    for segment in raw.split(SLOT_SEPARATOR).filter(|s| !s.is_empty()) {
        match decode_slot(segment) {
            Ok(slot) => {
                let id = slot.id.clone();
                if !decoded.table.push(slot) {
                    decoded.errors.push(DecodeError::DuplicateId(id));
                }
            }
            Err(e) => decoded.errors.push(e),
        }
    }

    decoded
}

fn decode_slot(segment: &str) -> Result<Slot, DecodeError> {
    let fields: Vec<&str> = segment.split(FIELD_SEPARATOR).collect();
    if fields.len() < 2 {
        return Err(DecodeError::MalformedSlot(segment.to_string()));
    }

    let id = fields[0];
    if fields[1] == EMPTY_SENTINEL {
        return Ok(Slot::empty(id));
    }

    let field = |i: usize| fields.get(i).copied().unwrap_or_default();
    Ok(Slot::occupied(id, field(1), field(2), field(3), field(4)))
}

/// Encode a text payload into a characteristic value
pub fn encode_value(payload: &str) -> String {
    BASE64.encode(payload.as_bytes())
}

/// Decode a characteristic value back into text. Trailing NUL padding from
/// the firmware's fixed buffers is stripped.
pub fn decode_value(value: &str) -> Result<String, DecodeError> {
    let bytes = BASE64
        .decode(value.trim())
        .map_err(|e| DecodeError::InvalidBase64(e.to_string()))?;
    let text = String::from_utf8(bytes).map_err(|_| DecodeError::InvalidUtf8)?;
    Ok(text.trim_end_matches('\0').to_string())
}

/// Parse a UUID string: 16-bit ("1111") or 32-bit short ids expand over the
/// Bluetooth base UUID, anything else must be a full 128-bit UUID.
pub fn parse_uuid(uuid_str: &str) -> Result<Uuid> {
    let s = uuid_str.trim();
    let s = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);

    if s.len() == 4 || s.len() == 8 {
        let short = u32::from_str_radix(s, 16)
            .map_err(|_| anyhow::anyhow!("Invalid short UUID: {}", uuid_str))?;
        return Ok(Uuid::from_u128(BASE_UUID | ((short as u128) << 96)));
    }

    Uuid::parse_str(s).map_err(|e| anyhow::anyhow!("Invalid UUID format {:?}: {}", uuid_str, e))
}
