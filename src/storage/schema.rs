//! Table schema, column types and the row value model.

use std::fmt;

use serde::{Deserialize, Serialize};
use time::macros::format_description;
use time::{Date, Duration, Month, OffsetDateTime, PrimitiveDateTime};

use crate::types::{Result, StoreError, Timestamp};

/// Fixed-width column types.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    /// One byte, 0 or 1.
    Boolean,
    /// Signed 8-bit integer.
    Byte,
    /// Signed 16-bit integer.
    Short,
    /// Signed 32-bit integer.
    Int,
    /// Signed 64-bit integer.
    Long,
    /// IEEE 754 double.
    Double,
    /// Microseconds since the Unix epoch.
    Timestamp,
}

impl ColumnType {
    /// log2 of the value width in bytes.
    pub fn size_shift(self) -> u32 {
        match self {
            ColumnType::Boolean | ColumnType::Byte => 0,
            ColumnType::Short => 1,
            ColumnType::Int => 2,
            ColumnType::Long | ColumnType::Double | ColumnType::Timestamp => 3,
        }
    }

    /// Value width in bytes.
    pub fn size(self) -> usize {
        1 << self.size_shift()
    }

    /// Parses the lowercase type name used in `_meta` and on the command line.
    pub fn parse(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "boolean" | "bool" => Ok(ColumnType::Boolean),
            "byte" => Ok(ColumnType::Byte),
            "short" => Ok(ColumnType::Short),
            "int" => Ok(ColumnType::Int),
            "long" => Ok(ColumnType::Long),
            "double" => Ok(ColumnType::Double),
            "timestamp" => Ok(ColumnType::Timestamp),
            other => Err(StoreError::Invalid(format!("unknown column type {other}"))),
        }
    }

    /// Appends the little-endian encoding of `value` to `dst`.
    ///
    /// Integers widen into larger integer and double columns; `Null` is stored
    /// as the type's sentinel.
    pub fn encode(self, value: &Value, dst: &mut Vec<u8>) -> Result<()> {
        let mismatch = || {
            StoreError::Invalid(format!("value {value:?} does not fit a {self:?} column"))
        };
        match self {
            ColumnType::Boolean => match value {
                Value::Null => dst.push(0),
                Value::Bool(v) => dst.push(u8::from(*v)),
                _ => return Err(mismatch()),
            },
            ColumnType::Byte => match value {
                Value::Null => dst.push(0),
                Value::Byte(v) => dst.push(*v as u8),
                _ => return Err(mismatch()),
            },
            ColumnType::Short => {
                let v = match value {
                    Value::Null => 0,
                    Value::Byte(v) => i16::from(*v),
                    Value::Short(v) => *v,
                    _ => return Err(mismatch()),
                };
                dst.extend_from_slice(&v.to_le_bytes());
            }
            ColumnType::Int => {
                let v = match value {
                    Value::Null => INT_NULL,
                    Value::Byte(v) => i32::from(*v),
                    Value::Short(v) => i32::from(*v),
                    Value::Int(v) => *v,
                    _ => return Err(mismatch()),
                };
                dst.extend_from_slice(&v.to_le_bytes());
            }
            ColumnType::Long | ColumnType::Timestamp => {
                let v = match value {
                    Value::Null => LONG_NULL,
                    Value::Byte(v) => i64::from(*v),
                    Value::Short(v) => i64::from(*v),
                    Value::Int(v) => i64::from(*v),
                    Value::Long(v) | Value::Timestamp(v) => *v,
                    _ => return Err(mismatch()),
                };
                dst.extend_from_slice(&v.to_le_bytes());
            }
            ColumnType::Double => {
                let v = match value {
                    Value::Null => f64::NAN,
                    Value::Byte(v) => f64::from(*v),
                    Value::Short(v) => f64::from(*v),
                    Value::Int(v) => f64::from(*v),
                    Value::Double(v) => *v,
                    _ => return Err(mismatch()),
                };
                dst.extend_from_slice(&v.to_le_bytes());
            }
        }
        Ok(())
    }

    /// Decodes one value; sentinels come back as `Null`.
    pub fn decode(self, src: &[u8]) -> Value {
        match self {
            ColumnType::Boolean => Value::Bool(src[0] != 0),
            ColumnType::Byte => Value::Byte(src[0] as i8),
            ColumnType::Short => Value::Short(i16::from_le_bytes([src[0], src[1]])),
            ColumnType::Int => match i32::from_le_bytes([src[0], src[1], src[2], src[3]]) {
                INT_NULL => Value::Null,
                v => Value::Int(v),
            },
            ColumnType::Long => match read_i64(src) {
                LONG_NULL => Value::Null,
                v => Value::Long(v),
            },
            ColumnType::Timestamp => match read_i64(src) {
                LONG_NULL => Value::Null,
                v => Value::Timestamp(v),
            },
            ColumnType::Double => {
                let v = f64::from_bits(read_i64(src) as u64);
                if v.is_nan() {
                    Value::Null
                } else {
                    Value::Double(v)
                }
            }
        }
    }

    /// Parses the text form of a value; blank text is `Null`.
    pub fn parse_value(self, text: &str) -> Result<Value> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(Value::Null);
        }
        let bad = |err: &dyn fmt::Display| {
            StoreError::Invalid(format!("cannot read {text:?} as {self:?}: {err}"))
        };
        match self {
            ColumnType::Boolean => text.parse().map(Value::Bool).map_err(|e| bad(&e)),
            ColumnType::Byte => text.parse().map(Value::Byte).map_err(|e| bad(&e)),
            ColumnType::Short => text.parse().map(Value::Short).map_err(|e| bad(&e)),
            ColumnType::Int => text.parse().map(Value::Int).map_err(|e| bad(&e)),
            ColumnType::Long => text.parse().map(Value::Long).map_err(|e| bad(&e)),
            ColumnType::Double => text.parse().map(Value::Double).map_err(|e| bad(&e)),
            ColumnType::Timestamp => text.parse().map(Value::Timestamp).map_err(|e| bad(&e)),
        }
    }
}

const INT_NULL: i32 = i32::MIN;
const LONG_NULL: i64 = i64::MIN;

/// Reads a little-endian `i64` from the first eight bytes of `src`.
pub fn read_i64(src: &[u8]) -> i64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&src[..8]);
    i64::from_le_bytes(buf)
}

/// A single cell value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// Missing value.
    Null,
    /// Boolean.
    Bool(bool),
    /// 8-bit integer.
    Byte(i8),
    /// 16-bit integer.
    Short(i16),
    /// 32-bit integer.
    Int(i32),
    /// 64-bit integer.
    Long(i64),
    /// Double.
    Double(f64),
    /// Timestamp in microseconds.
    Timestamp(Timestamp),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Byte(v) => write!(f, "{v}"),
            Value::Short(v) => write!(f, "{v}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Long(v) => write!(f, "{v}"),
            Value::Double(v) => write!(f, "{v}"),
            Value::Timestamp(v) => write!(f, "{v}"),
        }
    }
}

/// One ingested row: the designated timestamp plus every other column in schema order.
#[derive(Clone, Debug, PartialEq)]
pub struct Row {
    /// Designated timestamp.
    pub timestamp: Timestamp,
    /// Values of the non-timestamp columns, in schema order.
    pub values: Vec<Value>,
}

impl Row {
    /// Starts a row at `timestamp`.
    pub fn new(timestamp: Timestamp) -> Self {
        Self {
            timestamp,
            values: Vec::new(),
        }
    }

    /// Appends the next column value.
    pub fn with(mut self, value: Value) -> Self {
        self.values.push(value);
        self
    }
}

/// Column definition.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    /// Column name, also the file stem of its `.d` file.
    pub name: String,
    /// Value type.
    #[serde(rename = "type")]
    pub ty: ColumnType,
}

impl ColumnDef {
    /// Builds a column definition.
    pub fn new(name: impl Into<String>, ty: ColumnType) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }
}

/// Time bucket that decides which partition a row lands in.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionBy {
    /// Single partition holding everything.
    None,
    /// One partition per hour.
    Hour,
    /// One partition per day.
    Day,
    /// One partition per calendar month.
    Month,
    /// One partition per calendar year.
    Year,
}

impl PartitionBy {
    /// Parses `none`, `hour`, `day`, `month` or `year`.
    pub fn parse(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "none" => Ok(PartitionBy::None),
            "hour" => Ok(PartitionBy::Hour),
            "day" => Ok(PartitionBy::Day),
            "month" => Ok(PartitionBy::Month),
            "year" => Ok(PartitionBy::Year),
            other => Err(StoreError::Invalid(format!("unknown partitioning {other}"))),
        }
    }

    /// Start of the bucket holding `ts`.
    pub fn floor(self, ts: Timestamp) -> Result<Timestamp> {
        let dt = match self {
            PartitionBy::None => return Ok(Timestamp::MIN),
            _ => to_datetime(ts)?,
        };
        let date = dt.date();
        let floored = match self {
            PartitionBy::None => Ok(PrimitiveDateTime::MIN),
            PartitionBy::Hour => date.with_hms(dt.hour(), 0, 0),
            PartitionBy::Day => Ok(date.midnight()),
            PartitionBy::Month => {
                Date::from_calendar_date(date.year(), date.month(), 1).map(Date::midnight)
            }
            PartitionBy::Year => {
                Date::from_calendar_date(date.year(), Month::January, 1).map(Date::midnight)
            }
        }
        .map_err(|err| StoreError::Invalid(format!("cannot floor timestamp {ts}: {err}")))?;
        Ok(from_datetime(floored))
    }

    /// Start of the bucket following the one starting at `lo`.
    pub fn next(self, lo: Timestamp) -> Result<Timestamp> {
        let dt = match self {
            PartitionBy::None => return Ok(Timestamp::MAX),
            _ => to_datetime(lo)?,
        };
        let next = match self {
            PartitionBy::Hour => Some(dt + Duration::hours(1)),
            PartitionBy::Day => Some(dt + Duration::days(1)),
            PartitionBy::Month => {
                let (year, month) = match dt.month() {
                    Month::December => (dt.year() + 1, Month::January),
                    m => (dt.year(), m.next()),
                };
                Date::from_calendar_date(year, month, 1).ok().map(Date::midnight)
            }
            PartitionBy::Year => Date::from_calendar_date(dt.year() + 1, Month::January, 1)
                .ok()
                .map(Date::midnight),
            PartitionBy::None => None,
        };
        next.map(from_datetime)
            .ok_or_else(|| StoreError::Invalid(format!("no partition follows {lo}")))
    }

    /// Directory name of the base partition starting at `lo`.
    pub fn partition_name(self, lo: Timestamp) -> Result<String> {
        let dt = match self {
            PartitionBy::None => return Ok("default".to_string()),
            _ => to_datetime(lo)?,
        };
        let formatted = match self {
            PartitionBy::None => Ok("default".to_string()),
            PartitionBy::Hour => dt.format(format_description!("[year]-[month]-[day]T[hour]")),
            PartitionBy::Day => dt.format(format_description!("[year]-[month]-[day]")),
            PartitionBy::Month => dt.format(format_description!("[year]-[month]")),
            PartitionBy::Year => dt.format(format_description!("[year]")),
        };
        formatted.map_err(|err| StoreError::Invalid(format!("cannot name partition {lo}: {err}")))
    }
}

/// Directory name of a split partition starting at `lo`, precise to the microsecond.
pub fn split_partition_name(lo: Timestamp) -> Result<String> {
    to_datetime(lo)?
        .format(format_description!(
            "[year]-[month]-[day]T[hour][minute][second]-[subsecond digits:6]"
        ))
        .map_err(|err| StoreError::Invalid(format!("cannot name split partition {lo}: {err}")))
}

fn to_datetime(ts: Timestamp) -> Result<PrimitiveDateTime> {
    let dt = OffsetDateTime::from_unix_timestamp_nanos(i128::from(ts) * 1_000)
        .map_err(|err| StoreError::Invalid(format!("timestamp {ts} out of range: {err}")))?;
    Ok(PrimitiveDateTime::new(dt.date(), dt.time()))
}

fn from_datetime(dt: PrimitiveDateTime) -> Timestamp {
    let nanos = dt.assume_utc().unix_timestamp_nanos();
    (nanos / 1_000) as Timestamp
}

/// Table definition persisted in `_meta`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    /// Table name, also its directory name.
    pub name: String,
    /// All columns including the designated timestamp.
    pub columns: Vec<ColumnDef>,
    /// Index of the designated timestamp column.
    pub timestamp_index: usize,
    /// Partitioning.
    pub partition_by: PartitionBy,
}

impl TableSchema {
    /// Builds a schema whose first column is the designated timestamp `ts_name`.
    pub fn new(
        name: impl Into<String>,
        ts_name: impl Into<String>,
        partition_by: PartitionBy,
    ) -> Self {
        Self {
            name: name.into(),
            columns: vec![ColumnDef::new(ts_name, ColumnType::Timestamp)],
            timestamp_index: 0,
            partition_by,
        }
    }

    /// Adds a non-timestamp column.
    pub fn column(mut self, name: impl Into<String>, ty: ColumnType) -> Self {
        self.columns.push(ColumnDef::new(name, ty));
        self
    }

    /// Checks names, uniqueness and the designated timestamp.
    pub fn validate(&self) -> Result<()> {
        check_name("table", &self.name)?;
        let ts = self.columns.get(self.timestamp_index).ok_or_else(|| {
            StoreError::Invalid(format!(
                "timestamp index {} outside {} columns",
                self.timestamp_index,
                self.columns.len()
            ))
        })?;
        if ts.ty != ColumnType::Timestamp {
            return Err(StoreError::Invalid(format!(
                "designated column {} must be a timestamp",
                ts.name
            )));
        }
        for (i, col) in self.columns.iter().enumerate() {
            check_name("column", &col.name)?;
            if self.columns[..i].iter().any(|c| c.name == col.name) {
                return Err(StoreError::Invalid(format!("duplicate column {}", col.name)));
            }
        }
        Ok(())
    }

    /// Index of the column called `name`.
    pub fn column_index(&self, name: &str) -> Result<usize> {
        self.columns
            .iter()
            .position(|c| c.name == name)
            .ok_or_else(|| StoreError::NotFound(format!("column {name}")))
    }
}

fn check_name(what: &str, name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && !name.starts_with('_')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if ok {
        Ok(())
    } else {
        Err(StoreError::Invalid(format!("invalid {what} name {name:?}")))
    }
}
