//! Host configuration.
//!
//! Loaded from TOML. Every field has a default so partial files are valid.

use crate::error::VmError;
use crate::gas_schedule::GasSchedule;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Protocol feature switches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureFlags {
    /// Count the initial code cost in the gas used by a contract
    pub vm_v2_enabled: bool,
    /// Price code preparation as ahead-of-time compiled
    pub aot_compile_enabled: bool,
    /// Only lock callback gas when the caller exports a callback
    pub dynamic_gas_locking_enabled: bool,
    /// Route DCDT transfer-and-execute through the dedicated path
    pub dcdt_functions_enabled: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            vm_v2_enabled: true,
            aot_compile_enabled: false,
            dynamic_gas_locking_enabled: true,
            dcdt_functions_enabled: true,
        }
    }
}

/// Configuration of a [`crate::VmHost`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// VM type embedded in contract addresses
    pub vm_type: [u8; 2],
    /// Gas given to protocol-level operations such as transfer reverts
    pub block_gas_limit: u64,
    /// Maximum number of live contract instances in one call tree
    pub max_instances: usize,
    pub num_shards: u32,
    /// Verify newly deployed code before instantiating it
    pub verify_code: bool,
    /// Whether a failed synchronous call aborts the caller
    pub sync_exec_error_fails_execution: bool,
    /// Storage keys starting with this prefix cannot be written by contracts
    pub protected_key_prefix: String,
    pub code_cache_capacity: usize,
    pub features: FeatureFlags,
    /// Gas schedule file; the built-in schedule is used when unset
    pub gas_schedule_path: Option<PathBuf>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            vm_type: [5, 0],
            block_gas_limit: 1_500_000_000,
            max_instances: 100,
            num_shards: 1,
            verify_code: true,
            sync_exec_error_fails_execution: true,
            protected_key_prefix: "KCHAIN".to_string(),
            code_cache_capacity: 1_000,
            features: FeatureFlags::default(),
            gas_schedule_path: None,
        }
    }
}

impl HostConfig {
    /// Load configuration from file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file '{}': {}", path.display(), e))?;
        let config = Self::from_toml_str(&contents)
            .map_err(|e| anyhow::anyhow!("Failed to parse config file '{}': {}", path.display(), e))?;
        Ok(config)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, VmError> {
        let config: HostConfig = toml::from_str(contents).map_err(|e| VmError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), VmError> {
        if self.max_instances == 0 {
            return Err(VmError::Config("max_instances must be positive".into()));
        }
        if self.num_shards == 0 {
            return Err(VmError::Config("num_shards must be positive".into()));
        }
        if self.block_gas_limit == 0 {
            return Err(VmError::Config("block_gas_limit must be positive".into()));
        }
        if self.protected_key_prefix.is_empty() {
            return Err(VmError::Config("protected_key_prefix cannot be empty".into()));
        }
        if self.code_cache_capacity == 0 {
            return Err(VmError::Config("code_cache_capacity must be positive".into()));
        }
        Ok(())
    }

    /// Gas schedule named by the configuration, or the built-in one.
    pub fn load_gas_schedule(&self) -> anyhow::Result<GasSchedule> {
        match &self.gas_schedule_path {
            Some(path) => GasSchedule::from_file(path),
            None => Ok(GasSchedule::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = HostConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.features.vm_v2_enabled);
        assert!(config.sync_exec_error_fails_execution);
        assert_eq!(config.protected_key_prefix, "KCHAIN");
    }

    #[test]
    fn test_partial_toml() {
        let config = HostConfig::from_toml_str(
            r#"
            num_shards = 3
            max_instances = 8

            [features]
            aot_compile_enabled = true
            "#,
        )
        .unwrap();

        assert_eq!(config.num_shards, 3);
        assert_eq!(config.max_instances, 8);
        assert!(config.features.aot_compile_enabled);
        assert!(config.features.vm_v2_enabled);
        assert_eq!(config.vm_type, [5, 0]);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            HostConfig::from_toml_str("max_instances = 0"),
            Err(VmError::Config(_))
        ));
        assert!(matches!(
            HostConfig::from_toml_str("protected_key_prefix = \"\""),
            Err(VmError::Config(_))
        ));
        assert!(HostConfig::from_toml_str("num_shards = \"two\"").is_err());
    }

    #[test]
    fn test_from_file_with_schedule() {
        let dir = tempfile::tempdir().unwrap();
        let schedule_path = dir.path().join("gas.toml");
        let schedule = GasSchedule::uniform(7).unwrap();
        std::fs::write(&schedule_path, toml::to_string(&schedule.to_map().unwrap()).unwrap()).unwrap();

        let config_path = dir.path().join("host.toml");
        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(file, "gas_schedule_path = {:?}", schedule_path.to_string_lossy()).unwrap();

        let config = HostConfig::from_file(&config_path).unwrap();
        assert_eq!(config.load_gas_schedule().unwrap(), schedule);
        assert_eq!(HostConfig::default().load_gas_schedule().unwrap(), GasSchedule::default());
    }
}
