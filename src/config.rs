use std::{
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::of::DeviceNode;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/gp7101-bl.json";

/// Where the controller sits and how it is described.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// I2C adapter device, e.g. `/dev/i2c-1`.
    pub bus: PathBuf,
    pub address: u16,
    #[serde(default = "default_name")]
    pub name: String,
    pub node: DeviceNode,
}

fn default_name() -> String {
    "backlight".to_string()
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
        serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_config() {
        let config = Config::from_json(
            r#"{
                "bus": "/dev/i2c-1",
                "address": 88,
                "name": "lcd-backlight",
                "node": {
                    "compatible": "gp7101-backlight",
                    "max-brightness-levels": 200,
                    "default-brightness-level": 50
                }
            }"#,
        )
        .unwrap();

        assert_eq!(config.bus, PathBuf::from("/dev/i2c-1"));
        assert_eq!(config.address, 88);
        assert_eq!(config.name, "lcd-backlight");
        assert_eq!(config.node.compatible, "gp7101-backlight");
        assert_eq!(config.node.read_u32("max-brightness-levels"), Some(200));
        assert_eq!(config.node.read_u32("default-brightness-level"), Some(50));
    }

    #[test]
    fn name_defaults_to_backlight() {
        let config = Config::from_json(
            r#"{"bus": "/dev/i2c-0", "address": 44, "node": {"compatible": "gp7101-backlight"}}"#,
        )
        .unwrap();

        assert_eq!(config.name, "backlight");
        assert_eq!(config.node.read_u32("max-brightness-levels"), None);
    }

    #[test]
    fn missing_address_is_an_error() {
        let err = Config::from_json(r#"{"bus": "/dev/i2c-0", "node": {"compatible": "x"}}"#);
        assert!(err.is_err());
    }

    #[test]
    fn load_reports_the_path() {
        let err = Config::load("/nonexistent/gp7101-bl.json").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/gp7101-bl.json"));
    }
}
