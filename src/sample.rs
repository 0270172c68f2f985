use std::collections::BTreeMap;

use jiff::Timestamp;
use serde::{Deserialize, Serialize};

/// Declared data shape of a PV, fixed per partition by its header.
/// The discriminant is the on-disk type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum PayloadType {
    ScalarString = 0,
    ScalarShort = 1,
    ScalarFloat = 2,
    ScalarEnum = 3,
    ScalarByte = 4,
    ScalarInt = 5,
    ScalarDouble = 6,
    WaveformString = 7,
    WaveformShort = 8,
    WaveformFloat = 9,
    WaveformEnum = 10,
    WaveformByte = 11,
    WaveformInt = 12,
    WaveformDouble = 13,
}

impl PayloadType {
    pub const ALL: [PayloadType; 14] = [
        Self::ScalarString,
        Self::ScalarShort,
        Self::ScalarFloat,
        Self::ScalarEnum,
        Self::ScalarByte,
        Self::ScalarInt,
        Self::ScalarDouble,
        Self::WaveformString,
        Self::WaveformShort,
        Self::WaveformFloat,
        Self::WaveformEnum,
        Self::WaveformByte,
        Self::WaveformInt,
        Self::WaveformDouble,
    ];

    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        Self::ALL.get(tag as usize).copied()
    }

    pub fn is_waveform(self) -> bool {
        self.tag() >= Self::WaveformString.tag()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SampleValue {
    String(String),
    Short(i16),
    Float(f32),
    Enum(i16),
    Byte(u8),
    Int(i32),
    Double(f64),
    StringVec(Vec<String>),
    ShortVec(Vec<i16>),
    FloatVec(Vec<f32>),
    EnumVec(Vec<i16>),
    ByteVec(Vec<u8>),
    IntVec(Vec<i32>),
    DoubleVec(Vec<f64>),
}

impl SampleValue {
    pub fn payload_type(&self) -> PayloadType {
        match self {
            Self::String(_) => PayloadType::ScalarString,
            Self::Short(_) => PayloadType::ScalarShort,
            Self::Float(_) => PayloadType::ScalarFloat,
            Self::Enum(_) => PayloadType::ScalarEnum,
            Self::Byte(_) => PayloadType::ScalarByte,
            Self::Int(_) => PayloadType::ScalarInt,
            Self::Double(_) => PayloadType::ScalarDouble,
            Self::StringVec(_) => PayloadType::WaveformString,
            Self::ShortVec(_) => PayloadType::WaveformShort,
            Self::FloatVec(_) => PayloadType::WaveformFloat,
            Self::EnumVec(_) => PayloadType::WaveformEnum,
            Self::ByteVec(_) => PayloadType::WaveformByte,
            Self::IntVec(_) => PayloadType::WaveformInt,
            Self::DoubleVec(_) => PayloadType::WaveformDouble,
        }
    }

    pub fn element_count(&self) -> usize {
        match self {
            Self::StringVec(v) => v.len(),
            Self::ShortVec(v) | Self::EnumVec(v) => v.len(),
            Self::FloatVec(v) => v.len(),
            Self::ByteVec(v) => v.len(),
            Self::IntVec(v) => v.len(),
            Self::DoubleVec(v) => v.len(),
            _ => 1,
        }
    }

    /// Numeric view used by statistical post processors.
    /// Vectors contribute their first element; strings have no numeric view.
    pub fn as_f64(&self) -> Option<f64> {
        Some(match self {
            Self::Short(v) | Self::Enum(v) => *v as f64,
            Self::Float(v) => *v as f64,
            Self::Byte(v) => *v as f64,
            Self::Int(v) => *v as f64,
            Self::Double(v) => *v,
            Self::ShortVec(v) | Self::EnumVec(v) => *v.first()? as f64,
            Self::FloatVec(v) => *v.first()? as f64,
            Self::ByteVec(v) => *v.first()? as f64,
            Self::IntVec(v) => *v.first()? as f64,
            Self::DoubleVec(v) => *v.first()?,
            Self::String(_) | Self::StringVec(_) => return None,
        })
    }
}

impl std::fmt::Display for SampleValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fn list<T: std::fmt::Display>(f: &mut std::fmt::Formatter<'_>, v: &[T]) -> std::fmt::Result {
            write!(f, "[")?;
            for (i, item) in v.iter().enumerate() {
                if i > 0 {
                    write!(f, ",")?;
                }
                write!(f, "{item}")?;
            }
            write!(f, "]")
        }

        match self {
            Self::String(v) => write!(f, "{v}"),
            Self::Short(v) | Self::Enum(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Byte(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Double(v) => write!(f, "{v}"),
            Self::StringVec(v) => list(f, v),
            Self::ShortVec(v) | Self::EnumVec(v) => list(f, v),
            Self::FloatVec(v) => list(f, v),
            Self::ByteVec(v) => list(f, v),
            Self::IntVec(v) => list(f, v),
            Self::DoubleVec(v) => list(f, v),
        }
    }
}

/// Extra field recorded alongside a sample (ie. `HIHI` changed at this instant)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldValue {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub timestamp: Timestamp,
    pub status: i32,
    pub severity: i32,
    pub value: SampleValue,
    pub fields: Vec<FieldValue>,
}

impl Sample {
    pub fn new(timestamp: Timestamp, value: SampleValue) -> Self {
        Self {
            timestamp,
            status: 0,
            severity: 0,
            value,
            fields: Vec::new(),
        }
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|f| f.name == name)
            .map(|f| f.value.as_str())
    }
}

/// First frame of every partition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionHeader {
    pub version: u16,
    pub pv_name: String,
    pub year: i16,
    pub payload_type: PayloadType,
    pub element_count: u32,
    pub headers: BTreeMap<String, String>,
}

/// What a sink is told about the samples that follow
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamDescriptor {
    pub pv_name: String,
    pub payload_type: PayloadType,
    pub element_count: u32,
    pub year: i16,
    pub source: String,
    pub headers: BTreeMap<String, String>,
}

impl StreamDescriptor {
    pub fn from_header(header: &PartitionHeader, source: impl Into<String>) -> Self {
        Self {
            pv_name: header.pv_name.clone(),
            payload_type: header.payload_type,
            element_count: header.element_count,
            year: header.year,
            source: source.into(),
            headers: header.headers.clone(),
        }
    }

    /// Layer registry and live engine metadata over what the partition recorded.
    /// Later layers win.
    pub fn merge_metadata<'a>(
        &mut self,
        layers: impl IntoIterator<Item = &'a BTreeMap<String, String>>,
    ) {
        for layer in layers {
            for (k, v) in layer {
                self.headers.insert(k.clone(), v.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags_round_trip() {
        for ty in PayloadType::ALL {
            assert_eq!(PayloadType::from_tag(ty.tag()), Some(ty));
        }
        assert_eq!(PayloadType::from_tag(14), None);
        assert!(PayloadType::WaveformDouble.is_waveform());
        assert!(!PayloadType::ScalarDouble.is_waveform());
    }

    #[test]
    fn test_numeric_view() {
        assert_eq!(SampleValue::Int(7).as_f64(), Some(7.0));
        assert_eq!(SampleValue::DoubleVec(vec![2.5, 1.0]).as_f64(), Some(2.5));
        assert_eq!(SampleValue::DoubleVec(vec![]).as_f64(), None);
        assert_eq!(SampleValue::String("x".into()).as_f64(), None);
        assert_eq!(SampleValue::IntVec(vec![1, 2, 3]).element_count(), 3);
        assert_eq!(SampleValue::DoubleVec(vec![1.0, 2.0]).to_string(), "[1,2]");
    }
}
