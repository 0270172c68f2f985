use std::{collections::HashMap, fs, path::Path};

use ron::{Options, extensions::Extensions};
use serde::{Deserialize, Serialize};

use crate::{config::ConfigError, partition::Tier, sample::PayloadType};

/// What the archiver knows about a PV: its declared type and where it is stored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeInfo {
    pub pv_name: String,
    pub payload_type: PayloadType,
    #[serde(default = "default_element_count")]
    pub element_count: u32,
    #[serde(default = "default_sampling_period")]
    pub sampling_period_secs: f64,
    /// Consulted in this order; tiers holding older data come first
    pub tiers: Vec<Tier>,
    /// Static metadata layered into every descriptor of this PV
    #[serde(default)]
    pub metadata: std::collections::BTreeMap<String, String>,
}

fn default_element_count() -> u32 {
    1
}

fn default_sampling_period() -> f64 {
    1.0
}

impl TypeInfo {
    /// Same storage under another name, ie. for a retired PV served from a template
    pub fn renamed(&self, pv_name: &str) -> Self {
        Self {
            pv_name: pv_name.to_string(),
            ..self.clone()
        }
    }
}

pub trait TypeRegistry: Send + Sync {
    fn type_info(&self, pv_name: &str) -> Option<TypeInfo>;
}

/// Registry loaded once from a RON file:
///
/// ```ron
/// (
///     pvs: [
///         (
///             pv_name: "ROOM:TEMP",
///             payload_type: ScalarDouble,
///             sampling_period_secs: 1.0,
///             tiers: [
///                 (name: "lts", root: "/data/lts", granularity: Year),
///                 (name: "sts", root: "/data/sts", granularity: Hour),
///             ],
///         ),
///     ],
/// )
/// ```
#[derive(Debug, Default, Clone)]
pub struct StaticTypeRegistry {
    pvs: HashMap<String, TypeInfo>,
}

#[derive(Debug, Deserialize)]
struct RegistryFile {
    pvs: Vec<TypeInfo>,
}

impl StaticTypeRegistry {
    pub fn new(infos: impl IntoIterator<Item = TypeInfo>) -> Self {
        Self {
            pvs: infos
                .into_iter()
                .map(|info| (info.pv_name.clone(), info))
                .collect(),
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::parse(&fs::read_to_string(path)?)
    }

    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let options = Options::default()
            .with_default_extension(Extensions::IMPLICIT_SOME)
            .with_default_extension(Extensions::UNWRAP_NEWTYPES)
            .with_default_extension(Extensions::UNWRAP_VARIANT_NEWTYPES);
        let file: RegistryFile = options.from_str(s)?;
        Ok(Self::new(file.pvs))
    }

    pub fn len(&self) -> usize {
        self.pvs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pvs.is_empty()
    }
}

impl TypeRegistry for StaticTypeRegistry {
    fn type_info(&self, pv_name: &str) -> Option<TypeInfo> {
        self.pvs.get(pv_name).cloned()
    }
}
