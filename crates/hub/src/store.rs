//! Device property value store: append-only history of typed values keyed
//! by device property, with "latest value" and "last time value matched"
//! lookups.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::query::Query;
use sqlx::sqlite::SqliteArguments;
use sqlx::{Row, Sqlite};
use std::fmt;
use tracing::error;

use crate::db::Db;

// ---------------------------------------------------------------------------
// Identities
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceId {
    pub id: String,
    pub device_type: String,
}

/// One property of one device, e.g. the `relay` of power sensor `washer`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DevicePropertyId {
    pub device: DeviceId,
    pub property: String,
}

impl DevicePropertyId {
    pub fn new(device: DeviceId, property: &str) -> Self {
        Self {
            device,
            property: property.to_string(),
        }
    }
}

impl fmt::Display for DevicePropertyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.device.device_type, self.device.id, self.property
        )
    }
}

/// Kind of value a property series holds. Doubles as the measurement name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Power,
    RelayState,
}

impl ValueType {
    pub fn type_name(&self) -> &'static str {
        match self {
            ValueType::Power => "power",
            ValueType::RelayState => "relayState",
        }
    }

    pub fn unit(&self) -> &'static str {
        match self {
            ValueType::Power => "W",
            ValueType::RelayState => "",
        }
    }
}

// ---------------------------------------------------------------------------
// Stored values
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum StoredValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl StoredValue {
    pub fn kind(&self) -> &'static str {
        match self {
            StoredValue::Bool(_) => "bool",
            StoredValue::Int(_) => "int",
            StoredValue::Float(_) => "float",
            StoredValue::Text(_) => "text",
        }
    }

    /// Canonical text encoding, the inverse of [`StoredValue::decode`].
    pub fn encode(&self) -> String {
        match self {
            StoredValue::Bool(b) => b.to_string(),
            StoredValue::Int(i) => i.to_string(),
            StoredValue::Float(f) => f.to_string(),
            StoredValue::Text(s) => s.clone(),
        }
    }

    pub fn decode(kind: &str, raw: &str) -> Result<Self, CastError> {
        let corrupt = || CastError::Corrupt {
            kind: kind.to_string(),
            raw: raw.to_string(),
        };
        match kind {
            "bool" => raw.parse().map(StoredValue::Bool).map_err(|_| corrupt()),
            "int" => raw.parse().map(StoredValue::Int).map_err(|_| corrupt()),
            "float" => raw.parse().map(StoredValue::Float).map_err(|_| corrupt()),
            "text" => Ok(StoredValue::Text(raw.to_string())),
            _ => Err(corrupt()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CastError {
    #[error("cast from {from} to {to} is not supported")]
    Unsupported {
        from: &'static str,
        to: &'static str,
    },
    #[error("{value} does not fit into {to}")]
    OutOfRange { value: i64, to: &'static str },
    #[error("'{value}' is not a member of {to}")]
    UnknownMember { value: String, to: &'static str },
    #[error("stored {kind} value '{raw}' could not be decoded")]
    Corrupt { kind: String, raw: String },
}

/// Conversion from a stored value into a concrete Rust type.
pub trait FromStoredValue: Sized {
    const TYPE_NAME: &'static str;

    fn from_stored(value: &StoredValue) -> Result<Self, CastError>;
}

fn unsupported<T: FromStoredValue>(value: &StoredValue) -> CastError {
    CastError::Unsupported {
        from: value.kind(),
        to: T::TYPE_NAME,
    }
}

impl FromStoredValue for bool {
    const TYPE_NAME: &'static str = "bool";

    fn from_stored(value: &StoredValue) -> Result<Self, CastError> {
        match value {
            StoredValue::Bool(b) => Ok(*b),
            StoredValue::Int(i) => Ok(*i > 0),
            StoredValue::Float(f) => Ok(*f > 0.0),
            StoredValue::Text(s) if s.eq_ignore_ascii_case("true") => Ok(true),
            StoredValue::Text(s) if s.eq_ignore_ascii_case("false") => Ok(false),
            StoredValue::Text(_) => Err(unsupported::<Self>(value)),
        }
    }
}

impl FromStoredValue for i64 {
    const TYPE_NAME: &'static str = "i64";

    fn from_stored(value: &StoredValue) -> Result<Self, CastError> {
        match value {
            StoredValue::Int(i) => Ok(*i),
            // Truncates toward zero, saturating at the i64 bounds.
            StoredValue::Float(f) => Ok(*f as i64),
            StoredValue::Bool(_) | StoredValue::Text(_) => Err(unsupported::<Self>(value)),
        }
    }
}

impl FromStoredValue for i32 {
    const TYPE_NAME: &'static str = "i32";

    fn from_stored(value: &StoredValue) -> Result<Self, CastError> {
        let wide = i64::from_stored(value).map_err(|_| unsupported::<Self>(value))?;
        i32::try_from(wide).map_err(|_| CastError::OutOfRange {
            value: wide,
            to: Self::TYPE_NAME,
        })
    }
}

impl FromStoredValue for f64 {
    const TYPE_NAME: &'static str = "f64";

    fn from_stored(value: &StoredValue) -> Result<Self, CastError> {
        match value {
            StoredValue::Float(f) => Ok(*f),
            StoredValue::Int(i) => Ok(*i as f64),
            StoredValue::Bool(_) | StoredValue::Text(_) => Err(unsupported::<Self>(value)),
        }
    }
}

impl FromStoredValue for f32 {
    const TYPE_NAME: &'static str = "f32";

    fn from_stored(value: &StoredValue) -> Result<Self, CastError> {
        f64::from_stored(value)
            .map(|f| f as f32)
            .map_err(|_| unsupported::<Self>(value))
    }
}

impl FromStoredValue for String {
    const TYPE_NAME: &'static str = "String";

    fn from_stored(value: &StoredValue) -> Result<Self, CastError> {
        Ok(value.encode())
    }
}

/// Resolve a stored text value against an enum's declared members.
///
/// Matching is exact (case-sensitive) on the member name.
pub fn enum_from_stored<T: Copy>(
    value: &StoredValue,
    to: &'static str,
    members: &[(&str, T)],
) -> Result<T, CastError> {
    let StoredValue::Text(name) = value else {
        return Err(CastError::Unsupported {
            from: value.kind(),
            to,
        });
    };
    members
        .iter()
        .find(|(member, _)| *member == name.as_str())
        .map(|(_, v)| *v)
        .ok_or_else(|| CastError::UnknownMember {
            value: name.clone(),
            to,
        })
}

#[derive(Debug, Clone, PartialEq)]
pub struct Timestamped<T> {
    pub value: T,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Store contract
// ---------------------------------------------------------------------------

/// One value to append, for batched writes.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyWrite {
    pub property: DevicePropertyId,
    pub value_type: ValueType,
    pub display_name: String,
    pub value: StoredValue,
    pub time: DateTime<Utc>,
}

#[async_trait]
pub trait PropertyValueStore: Send + Sync {
    /// Append a value. Never modifies earlier records.
    async fn insert(
        &self,
        property: &DevicePropertyId,
        value_type: ValueType,
        display_name: &str,
        value: StoredValue,
        time: DateTime<Utc>,
    ) -> Result<()>;

    /// Append several values. Stores that support it write all of them or
    /// none; the default writes them one by one.
    async fn insert_all(&self, writes: Vec<PropertyWrite>) -> Result<()> {
        for w in writes {
            self.insert(&w.property, w.value_type, &w.display_name, w.value, w.time)
                .await?;
        }
        Ok(())
    }

    async fn find_latest(
        &self,
        property: &DevicePropertyId,
        value_type: ValueType,
    ) -> Result<Option<Timestamped<StoredValue>>>;

    async fn last_time_value_matched(
        &self,
        property: &DevicePropertyId,
        value_type: ValueType,
        value: &StoredValue,
    ) -> Result<Option<DateTime<Utc>>>;
}

/// Latest value converted to `T`. A value that cannot be converted is
/// logged and reported as absent.
pub async fn find_latest_as<T: FromStoredValue>(
    store: &dyn PropertyValueStore,
    property: &DevicePropertyId,
    value_type: ValueType,
) -> Result<Option<Timestamped<T>>> {
    let Some(latest) = store.find_latest(property, value_type).await? else {
        return Ok(None);
    };
    match T::from_stored(&latest.value) {
        Ok(value) => Ok(Some(Timestamped {
            value,
            timestamp: latest.timestamp,
        })),
        Err(e) => {
            error!(property = %property, measurement = value_type.type_name(), "{e}");
            Ok(None)
        }
    }
}

pub(crate) fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .with_context(|| format!("timestamp out of range: {ms}"))
}

// ---------------------------------------------------------------------------
// SQLite implementation
// ---------------------------------------------------------------------------

fn insert_query<'q>(
    property: &'q DevicePropertyId,
    value_type: ValueType,
    display_name: &'q str,
    value: &StoredValue,
    time: DateTime<Utc>,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    sqlx::query(
        r#"
        INSERT INTO property_values (
          measurement, device_property_id, device_id, device_type,
          unit, display_name, value_kind, value, ts_ms
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(value_type.type_name())
    .bind(property.property.as_str())
    .bind(property.device.id.as_str())
    .bind(property.device.device_type.as_str())
    .bind(value_type.unit())
    .bind(display_name)
    .bind(value.kind())
    .bind(value.encode())
    .bind(time.timestamp_millis())
}

#[async_trait]
impl PropertyValueStore for Db {
    async fn insert(
        &self,
        property: &DevicePropertyId,
        value_type: ValueType,
        display_name: &str,
        value: StoredValue,
        time: DateTime<Utc>,
    ) -> Result<()> {
        insert_query(property, value_type, display_name, &value, time)
            .execute(self.pool())
            .await
            .with_context(|| format!("insert property value failed: {property}"))?;
        Ok(())
    }

    async fn insert_all(&self, writes: Vec<PropertyWrite>) -> Result<()> {
        let mut tx = self
            .pool()
            .begin()
            .await
            .context("begin property write failed")?;
        for w in &writes {
            insert_query(&w.property, w.value_type, &w.display_name, &w.value, w.time)
                .execute(&mut *tx)
                .await
                .with_context(|| format!("insert property value failed: {}", w.property))?;
        }
        tx.commit().await.context("commit property write failed")?;
        Ok(())
    }

    async fn find_latest(
        &self,
        property: &DevicePropertyId,
        value_type: ValueType,
    ) -> Result<Option<Timestamped<StoredValue>>> {
        let row = sqlx::query(
            r#"
            SELECT value_kind, value, ts_ms
            FROM property_values
            WHERE device_type = ? AND device_id = ? AND device_property_id = ?
              AND measurement = ?
            ORDER BY ts_ms DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(property.device.device_type.as_str())
        .bind(property.device.id.as_str())
        .bind(property.property.as_str())
        .bind(value_type.type_name())
        .fetch_optional(self.pool())
        .await
        .with_context(|| format!("find_latest failed: {property}"))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let kind: String = row.try_get("value_kind")?;
        let raw: String = row.try_get("value")?;
        let ts_ms: i64 = row.try_get("ts_ms")?;

        let value = StoredValue::decode(&kind, &raw)
            .with_context(|| format!("find_latest failed: {property}"))?;
        Ok(Some(Timestamped {
            value,
            timestamp: from_millis(ts_ms)?,
        }))
    }

    async fn last_time_value_matched(
        &self,
        property: &DevicePropertyId,
        value_type: ValueType,
        value: &StoredValue,
    ) -> Result<Option<DateTime<Utc>>> {
        let ts_ms: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT ts_ms
            FROM property_values
            WHERE device_type = ? AND device_id = ? AND device_property_id = ?
              AND measurement = ? AND value_kind = ? AND value = ?
            ORDER BY ts_ms DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(property.device.device_type.as_str())
        .bind(property.device.id.as_str())
        .bind(property.property.as_str())
        .bind(value_type.type_name())
        .bind(value.kind())
        .bind(value.encode())
        .fetch_optional(self.pool())
        .await
        .with_context(|| format!("last_time_value_matched failed: {property}"))?;

        ts_ms.map(from_millis).transpose()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
