use std::path::Path;
use std::str::FromStr;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::transform::{RuntimeNames, TransformOptions};

/// A transformation config file. Namely Resumable.toml
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub transform: TransformOptions,
    /// Names of the fiber runtime functions and of the fiber type.
    #[serde(default)]
    pub runtime: RuntimeNames,
}

impl FromStr for Config {
    type Err = toml::de::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        toml::from_str(s)
    }
}

impl Config {
    pub fn from_path(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        contents
            .parse()
            .with_context(|| format!("failed to parse config {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config: Config = "".parse().unwrap();
        assert_eq!(config, Config::default());
        assert!(config.transform.verify);
    }

    #[test]
    fn runtime_names_can_be_overridden() {
        let config: Config = r#"
            [transform]
            verify = false

            [runtime]
            fiber_type = "Coroutine"
            pop_int = "co.popI32"
        "#
        .parse()
        .unwrap();
        assert!(!config.transform.verify);
        assert_eq!(config.runtime.fiber_type, "Coroutine");
        assert_eq!(config.runtime.pop_int, "co.popI32");
        assert_eq!(config.runtime.push_int, RuntimeNames::default().push_int);
    }

    #[test]
    fn wrong_value_types_are_rejected() {
        assert!("[transform]\nverify = 3".parse::<Config>().is_err());
    }
}
