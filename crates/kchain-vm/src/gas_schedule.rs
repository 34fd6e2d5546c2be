//! Gas schedule: the cost of every base operation and host API.
//!
//! Schedules come from configuration as a two-level map of named costs
//! (`section -> name -> cost`). Every known cost must be present; a missing
//! key is a load error rather than a silent zero.

use crate::error::VmError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Raw schedule as found in configuration.
pub type GasScheduleMap = BTreeMap<String, BTreeMap<String, u64>>;

/// Costs of the operations performed by the host itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BaseOperationCost {
    pub store_per_byte: u64,
    pub release_per_byte: u64,
    pub data_copy_per_byte: u64,
    pub persist_per_byte: u64,
    pub compile_per_byte: u64,
    #[serde(rename = "AoTPreparePerByte")]
    pub aot_prepare_per_byte: u64,
    pub get_code: u64,
}

/// Costs of the host functions exposed to contracts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BaseOpsApiCost {
    #[serde(rename = "GetSCAddress")]
    pub get_sc_address: u64,
    pub get_owner_address: u64,
    pub is_smart_contract: u64,
    pub get_shard_of_address: u64,
    pub get_external_balance: u64,
    pub get_block_hash: u64,
    pub transfer_value: u64,
    pub get_argument: u64,
    pub get_function: u64,
    pub get_num_arguments: u64,
    pub storage_store: u64,
    pub storage_load: u64,
    pub get_caller: u64,
    pub get_call_value: u64,
    pub log: u64,
    pub finish: u64,
    pub signal_error: u64,
    pub get_block_time_stamp: u64,
    pub get_gas_left: u64,
    pub get_block_nonce: u64,
    pub get_block_round: u64,
    pub get_block_epoch: u64,
    pub get_state_root_hash: u64,
    pub execute_on_same_context: u64,
    pub execute_on_dest_context: u64,
    pub execute_read_only: u64,
    pub async_call_step: u64,
    pub async_callback_gas_lock: u64,
    pub create_async_call: u64,
    pub create_contract: u64,
    pub get_return_data: u64,
    pub get_num_return_data: u64,
}

/// Costs of the big integer host functions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BigIntApiCost {
    pub big_int_new: u64,
    pub big_int_add: u64,
    pub big_int_get_unsigned_argument: u64,
    pub big_int_get_call_value: u64,
    pub big_int_finish_unsigned: u64,
}

/// Full gas schedule of a host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GasSchedule {
    #[serde(rename = "BaseOperationCost")]
    pub base_operation_cost: BaseOperationCost,
    #[serde(rename = "BaseOpsAPICost")]
    pub base_ops_api_cost: BaseOpsApiCost,
    #[serde(rename = "BigIntAPICost")]
    pub big_int_api_cost: BigIntApiCost,
    /// Per-opcode costs handed to the bytecode engine
    #[serde(rename = "WASMOpcodeCost", default)]
    pub wasm_opcode_cost: BTreeMap<String, u64>,
}

impl GasSchedule {
    /// Build a schedule from its configuration map.
    pub fn from_map(map: &GasScheduleMap) -> Result<Self, VmError> {
        let value = toml::Value::try_from(map).map_err(|e| VmError::GasSchedule(e.to_string()))?;
        value
            .try_into::<GasSchedule>()
            .map_err(|e| VmError::GasSchedule(e.to_string()))
    }

    /// Flatten the schedule back into its configuration map.
    pub fn to_map(&self) -> Result<GasScheduleMap, VmError> {
        let value = toml::Value::try_from(self).map_err(|e| VmError::GasSchedule(e.to_string()))?;
        let mut map: GasScheduleMap = value
            .try_into()
            .map_err(|e: toml::de::Error| VmError::GasSchedule(e.to_string()))?;
        map.retain(|_, section| !section.is_empty());
        Ok(map)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, VmError> {
        let map: GasScheduleMap = toml::from_str(contents).map_err(|e| VmError::GasSchedule(e.to_string()))?;
        Self::from_map(&map)
    }

    /// Load a schedule from a TOML file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read gas schedule '{}': {}", path.display(), e))?;
        let schedule = Self::from_toml_str(&contents)
            .map_err(|e| anyhow::anyhow!("Failed to parse gas schedule '{}': {}", path.display(), e))?;
        Ok(schedule)
    }

    /// Schedule where every cost equals `cost`.
    pub fn uniform(cost: u64) -> Result<Self, VmError> {
        let mut map = Self::default().to_map()?;
        for section in map.values_mut() {
            for value in section.values_mut() {
                *value = cost;
            }
        }
        Self::from_map(&map)
    }

    /// Cost of a WASM opcode, zero when the schedule does not list it.
    pub fn opcode_cost(&self, opcode: &str) -> u64 {
        self.wasm_opcode_cost.get(opcode).copied().unwrap_or(0)
    }
}

impl Default for GasSchedule {
    fn default() -> Self {
        Self {
            base_operation_cost: BaseOperationCost {
                store_per_byte: 10_000,
                release_per_byte: 1_000,
                data_copy_per_byte: 50,
                persist_per_byte: 1_000,
                compile_per_byte: 300,
                aot_prepare_per_byte: 100,
                get_code: 1_000_000,
            },
            base_ops_api_cost: BaseOpsApiCost {
                get_sc_address: 1_000,
                get_owner_address: 5_000,
                is_smart_contract: 5_000,
                get_shard_of_address: 5_000,
                get_external_balance: 7_000,
                get_block_hash: 10_000,
                transfer_value: 100_000,
                get_argument: 1_000,
                get_function: 1_000,
                get_num_arguments: 1_000,
                storage_store: 75_000,
                storage_load: 50_000,
                get_caller: 1_000,
                get_call_value: 1_000,
                log: 3_750,
                finish: 1,
                signal_error: 1,
                get_block_time_stamp: 10_000,
                get_gas_left: 1_000,
                get_block_nonce: 10_000,
                get_block_round: 10_000,
                get_block_epoch: 10_000,
                get_state_root_hash: 10_000,
                execute_on_same_context: 100_000,
                execute_on_dest_context: 100_000,
                execute_read_only: 160_000,
                async_call_step: 100_000,
                async_callback_gas_lock: 4_000_000,
                create_async_call: 200_000,
                create_contract: 300_000,
                get_return_data: 1_000,
                get_num_return_data: 1_000,
            },
            big_int_api_cost: BigIntApiCost {
                big_int_new: 2_000,
                big_int_add: 2_000,
                big_int_get_unsigned_argument: 1_000,
                big_int_get_call_value: 1_000,
                big_int_finish_unsigned: 1_000,
            },
            wasm_opcode_cost: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_map_roundtrip() {
        let schedule = GasSchedule::default();
        let map = schedule.to_map().unwrap();
        assert_eq!(map["BaseOperationCost"]["AoTPreparePerByte"], 100);
        assert_eq!(map["BaseOpsAPICost"]["GetSCAddress"], 1_000);
        assert_eq!(GasSchedule::from_map(&map).unwrap(), schedule);
    }

    #[test]
    fn test_missing_key_is_rejected() {
        let mut map = GasSchedule::default().to_map().unwrap();
        map.get_mut("BaseOperationCost").unwrap().remove("StorePerByte");

        let err = GasSchedule::from_map(&map).unwrap_err();
        assert!(matches!(err, VmError::GasSchedule(ref msg) if msg.contains("StorePerByte")));
    }

    #[test]
    fn test_uniform_schedule() {
        let schedule = GasSchedule::uniform(1).unwrap();
        assert_eq!(schedule.base_operation_cost.get_code, 1);
        assert_eq!(schedule.base_ops_api_cost.async_callback_gas_lock, 1);
        assert_eq!(schedule.big_int_api_cost.big_int_add, 1);
    }

    #[test]
    fn test_opcode_costs_from_toml() {
        let mut map = GasSchedule::uniform(2).unwrap().to_map().unwrap();
        map.insert("WASMOpcodeCost".into(), BTreeMap::from([("I32Add".to_string(), 3u64)]));
        let text = toml::to_string(&map).unwrap();

        let schedule = GasSchedule::from_toml_str(&text).unwrap();
        assert_eq!(schedule.opcode_cost("I32Add"), 3);
        assert_eq!(schedule.opcode_cost("Unreachable"), 0);
        assert_eq!(schedule.base_ops_api_cost.finish, 2);
    }

    #[test]
    fn test_from_file() {
        let text = toml::to_string(&GasSchedule::default().to_map().unwrap()).unwrap();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(text.as_bytes()).unwrap();

        let schedule = GasSchedule::from_file(file.path()).unwrap();
        assert_eq!(schedule, GasSchedule::default());
        assert!(GasSchedule::from_file(Path::new("/nonexistent/gas.toml")).is_err());
    }
}
