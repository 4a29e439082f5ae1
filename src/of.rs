//! Device node properties and compatible-string matching.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::Value;

/// Describes one device: its compatible string plus free-form properties,
/// e.g. `{"compatible": "gp7101-backlight", "max-brightness-levels": 200}`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DeviceNode {
    pub compatible: String,
    #[serde(flatten)]
    properties: BTreeMap<String, Value>,
}

impl DeviceNode {
    pub fn new(compatible: &str) -> Self {
        Self {
            compatible: compatible.to_string(),
            properties: BTreeMap::new(),
        }
    }

    pub fn with_property(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.properties.insert(name.to_string(), value.into());
        self
    }

    /// Returns `None` when the property is missing or does not fit a `u32`.
    pub fn read_u32(&self, name: &str) -> Option<u32> {
        self.properties
            .get(name)?
            .as_u64()
            .and_then(|v| u32::try_from(v).ok())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceId {
    pub compatible: &'static str,
}

impl DeviceId {
    pub const fn new(compatible: &'static str) -> Self {
        Self { compatible }
    }
}

pub fn match_device<'a>(table: &'a [DeviceId], node: &DeviceNode) -> Option<&'a DeviceId> {
    table.iter().find(|id| id.compatible == node.compatible)
}
