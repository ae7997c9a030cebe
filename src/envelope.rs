//! Canonical envelope encoding.
//!
//! The `DataRowRecord` is the only object exchanged with other
//! implementations, so its JSON form is fixed field by field:
//!
//! ```text
//! {"Key":{"Created":<i64>,"Key":"<b64>","ParentKeyMeta":{"KeyId":"..","Created":<i64>}},"Data":"<b64>"}
//! ```
//!
//! - Compact JSON, fields in declaration order.
//! - `Revoked` is emitted only when `true`; `ParentKeyMeta` only when present.
//! - Binary fields are standard-alphabet base64 with canonical padding.
//! - `Version` is never emitted. On decode, `1` is accepted and any other
//!   value is rejected. Unknown fields are ignored.
//!
//! Metastore records use the same `EnvelopeKeyRecord` encoding.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::KeystrataError;
use crate::keys::KeyMeta;

/// The only envelope version this crate reads.
pub const ENVELOPE_VERSION: u64 = 1;

/// A wrapped key plus the metadata needed to unwrap it.
///
/// In a `DataRowRecord` this is the DRK wrapped under an IK. In the metastore
/// it is an IK wrapped under an SK, or an SK wrapped by the KMS (no parent).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeKeyRecord {
    #[serde(
        rename = "Revoked",
        default,
        skip_serializing_if = "is_false",
        deserialize_with = "nullable_bool"
    )]
    pub revoked: bool,
    #[serde(rename = "Created")]
    pub created: i64,
    #[serde(rename = "Key", with = "base64_bytes")]
    pub encrypted_key: Vec<u8>,
    #[serde(
        rename = "ParentKeyMeta",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub parent_key_meta: Option<KeyMeta>,
}

/// The wire-visible encrypted artifact: payload plus its wrapped DRK.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DataRowRecord {
    #[serde(rename = "Key")]
    pub key: EnvelopeKeyRecord,
    #[serde(rename = "Data", with = "base64_bytes")]
    pub data: Vec<u8>,
}

impl DataRowRecord {
    /// The IK that wrapped this record's DRK.
    pub fn parent_key_meta(&self) -> Result<&KeyMeta, KeystrataError> {
        self.key
            .parent_key_meta
            .as_ref()
            .ok_or_else(|| malformed("Key.ParentKeyMeta is missing"))
    }
}

// ---------------------------------------------------------------------------
// Decode-side shape
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct WireDataRowRecord {
    #[serde(rename = "Version", default)]
    version: Option<u64>,
    #[serde(rename = "Key", default)]
    key: Option<EnvelopeKeyRecord>,
    #[serde(rename = "Data", default)]
    data: Option<String>,
}

impl TryFrom<WireDataRowRecord> for DataRowRecord {
    type Error = KeystrataError;

    fn try_from(wire: WireDataRowRecord) -> Result<Self, Self::Error> {
        if let Some(version) = wire.version {
            if version != ENVELOPE_VERSION {
                return Err(malformed(format!("unsupported version {version}")));
            }
        }
        let key = wire.key.ok_or_else(|| malformed("Key is missing"))?;
        if key.parent_key_meta.is_none() {
            return Err(malformed("Key.ParentKeyMeta is missing"));
        }
        let data = wire.data.ok_or_else(|| malformed("Data is missing"))?;
        let data = STANDARD
            .decode(data.as_bytes())
            .map_err(|e| malformed(format!("Data: {e}")))?;
        Ok(Self { key, data })
    }
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

/// Canonical bytes of a data row record.
pub fn encode(record: &DataRowRecord) -> Result<Vec<u8>, KeystrataError> {
    serde_json::to_vec(record).map_err(|e| malformed(e.to_string()))
}

/// Canonical string form of a data row record.
pub fn encode_to_string(record: &DataRowRecord) -> Result<String, KeystrataError> {
    serde_json::to_string(record).map_err(|e| malformed(e.to_string()))
}

/// Parse a data row record. Every failure is `MalformedEnvelope`.
pub fn decode(bytes: &[u8]) -> Result<DataRowRecord, KeystrataError> {
    let wire: WireDataRowRecord =
        serde_json::from_slice(bytes).map_err(|e| malformed(e.to_string()))?;
    DataRowRecord::try_from(wire)
}

/// Metastore form of a key record.
pub fn encode_key_record(record: &EnvelopeKeyRecord) -> Result<String, KeystrataError> {
    serde_json::to_string(record).map_err(|e| malformed(e.to_string()))
}

pub fn decode_key_record(text: &str) -> Result<EnvelopeKeyRecord, KeystrataError> {
    serde_json::from_str(text).map_err(|e| malformed(e.to_string()))
}

fn malformed(reason: impl Into<String>) -> KeystrataError {
    KeystrataError::MalformedEnvelope(reason.into())
}

fn is_false(value: &bool) -> bool {
    !*value
}

fn nullable_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<bool>::deserialize(deserializer)?.unwrap_or(false))
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text.as_bytes()).map_err(Error::custom)
    }
}
