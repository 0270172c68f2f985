use tracing::debug;

use super::{Capabilities, PostProcessor, PostProcessorError};
use crate::sample::{PayloadType, Sample, SampleValue, StreamDescriptor};

/// Serves a PV field (ie. `ROOM:TEMP.HIHI`) out of the extra fields recorded with the
/// main value. Each main value timestamp gets the most recent field value; samples
/// before the field first shows up are dropped.
///
/// The first value fixes the output type: a number makes the field double valued and
/// later non-numeric values keep the previous value, anything else makes it a string.
#[derive(Debug)]
pub struct ExtraFields {
    field: String,
    current: Option<SampleValue>,
    output: Option<PayloadType>,
}

impl ExtraFields {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            current: None,
            output: None,
        }
    }

    fn observe(&mut self, raw: &str) {
        match self.output {
            None => {
                let value = parse_field_value(raw);
                self.output = Some(value.payload_type());
                self.current = Some(value);
            }
            Some(PayloadType::ScalarString) => self.current = Some(SampleValue::String(raw.to_string())),
            Some(_) => match parse_field_value(raw) {
                value @ SampleValue::Double(_) => self.current = Some(value),
                _ => debug!("{}: '{raw}' is not a number, keeping the previous value", self.field),
            },
        }
    }

    pub fn field(&self) -> &str {
        &self.field
    }
}

fn parse_field_value(raw: &str) -> SampleValue {
    match raw.trim().parse::<f64>() {
        Ok(v) => SampleValue::Double(v),
        Err(_) => SampleValue::String(raw.to_string()),
    }
}

impl PostProcessor for ExtraFields {
    fn identity(&self) -> String {
        format!("extraFields_{}", self.field)
    }

    fn initialize(&mut self, _identifier: &str, _pv_name: &str) -> Result<(), PostProcessorError> {
        Ok(())
    }

    fn transform(&mut self, sample: Sample) -> Option<Sample> {
        if let Some(raw) = sample.field(&self.field) {
            self.observe(raw);
        }
        let value = self.current.clone()?;
        Some(Sample {
            timestamp: sample.timestamp,
            status: sample.status,
            severity: sample.severity,
            value,
            fields: Vec::new(),
        })
    }

    fn describe(&self, source: &StreamDescriptor) -> StreamDescriptor {
        let mut out = StreamDescriptor {
            pv_name: format!("{}.{}", source.pv_name, self.field),
            payload_type: self.output.unwrap_or(PayloadType::ScalarDouble),
            element_count: 1,
            ..source.clone()
        };
        out.headers.insert("field".to_string(), self.field.clone());
        out
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            extra_field: true,
            ..Default::default()
        }
    }
}
