use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::HarvestError;

/// Qualified layer name as the portal knows it, e.g. `geonode:gen_sin_20250131`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LayerId(String);

impl LayerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Escaped form used in portal URL paths (`:` becomes `%3A`).
    pub fn escaped(&self) -> String {
        self.0.replace(':', "%3A")
    }

    /// Filesystem-safe stem for output file names.
    pub fn file_stem(&self) -> String {
        self.0.replace([':', '/'], "_")
    }
}

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for LayerId {
    type Err = HarvestError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_string();
        let Some((workspace, name)) = normalized.split_once(':') else {
            return Err(HarvestError::InvalidLayerId(value.to_string()));
        };
        let is_valid = !workspace.is_empty()
            && !name.is_empty()
            && !normalized.chars().any(|ch| ch.is_whitespace() || ch.is_control());
        if !is_valid {
            return Err(HarvestError::InvalidLayerId(value.to_string()));
        }
        Ok(Self(normalized))
    }
}

/// Which retrieval method ultimately produced a layer's features.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FetchSource {
    WfsPaginated,
    WfsSingleShot,
    LayerExport,
}

impl fmt::Display for FetchSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchSource::WfsPaginated => write!(f, "WFS 2.0.0 paginated"),
            FetchSource::WfsSingleShot => write!(f, "WFS 1.0.0 one-shot"),
            FetchSource::LayerExport => write!(f, "layer export"),
        }
    }
}

/// One feature as the portal returns it. The attribute schema varies per
/// layer, so properties stay untyped JSON values.
#[derive(Debug, Clone, Deserialize)]
pub struct RawFeature {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub properties: Option<Map<String, Value>>,
    #[serde(default)]
    pub geometry: Option<Geometry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Geometry {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub coordinates: Value,
}
