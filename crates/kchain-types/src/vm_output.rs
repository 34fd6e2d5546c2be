use crate::address::Address;
use crate::call_input::CallType;
use crate::code_metadata::CodeMetadata;
use num_bigint::BigInt;
use std::collections::BTreeMap;
use std::fmt;

/// Outcome of a contract execution.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ReturnCode {
    #[default]
    Ok,
    FunctionNotFound,
    FunctionWrongSignature,
    ContractNotFound,
    UserError,
    OutOfGas,
    AccountCollision,
    OutOfFunds,
    CallStackOverFlow,
    ContractInvalid,
    ExecutionFailed,
    UpgradeFailed,
    SimulateFailed,
}

impl ReturnCode {
    /// Numeric code, as passed to callbacks
    pub fn as_u64(&self) -> u64 {
        *self as u64
    }

    pub fn is_ok(&self) -> bool {
        *self == ReturnCode::Ok
    }
}

impl fmt::Display for ReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ReturnCode::Ok => "ok",
            ReturnCode::FunctionNotFound => "function not found",
            ReturnCode::FunctionWrongSignature => "wrong signature for function",
            ReturnCode::ContractNotFound => "contract not found",
            ReturnCode::UserError => "user error",
            ReturnCode::OutOfGas => "out of gas",
            ReturnCode::AccountCollision => "account collision",
            ReturnCode::OutOfFunds => "out of funds",
            ReturnCode::CallStackOverFlow => "call stack overflow",
            ReturnCode::ContractInvalid => "contract invalid",
            ReturnCode::ExecutionFailed => "execution failed",
            ReturnCode::UpgradeFailed => "upgrade failed",
            ReturnCode::SimulateFailed => "simulate failed",
        };
        f.write_str(text)
    }
}

/// A pending storage write.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StorageUpdate {
    pub offset: Vec<u8>,
    pub data: Vec<u8>,
}

/// Value, data and gas sent to an account, to be dispatched by the
/// surrounding protocol (e.g. cross-shard).
#[derive(Clone, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct OutputTransfer {
    pub value: BigInt,
    pub gas_limit: u64,
    pub gas_locked: u64,
    pub data: Vec<u8>,
    pub call_type: CallType,
    pub sender: Address,
}

/// Event emitted by a contract.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LogEntry {
    pub identifier: Vec<u8>,
    pub address: Address,
    pub topics: Vec<Vec<u8>>,
    pub data: Vec<u8>,
}

/// Accumulated changes to one account.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct OutputAccount {
    pub address: Address,
    pub nonce: u64,
    /// World balance, once it has been read
    pub balance: Option<BigInt>,
    pub balance_delta: BigInt,
    pub storage_updates: BTreeMap<Vec<u8>, StorageUpdate>,
    pub code: Vec<u8>,
    pub code_metadata: Option<CodeMetadata>,
    pub code_deployer: Option<Address>,
    pub output_transfers: Vec<OutputTransfer>,
    pub gas_used: u64,
}

impl OutputAccount {
    pub fn new(address: Address) -> Self {
        Self {
            address,
            ..Default::default()
        }
    }

    pub fn storage_value(&self, key: &[u8]) -> Option<&[u8]> {
        self.storage_updates.get(key).map(|update| update.data.as_slice())
    }
}

/// Result of a top-level call.
///
/// Accounts are kept in address order, so two hosts that produce the same
/// output serialize it identically.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct VmOutput {
    pub return_data: Vec<Vec<u8>>,
    pub return_code: ReturnCode,
    pub return_message: String,
    pub gas_remaining: u64,
    pub gas_refund: u64,
    pub output_accounts: BTreeMap<Address, OutputAccount>,
    pub deleted_accounts: Vec<Address>,
    pub logs: Vec<LogEntry>,
}

impl VmOutput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Failed output: no accounts, no gas left.
    pub fn failure(return_code: ReturnCode, message: impl Into<String>) -> Self {
        Self {
            return_code,
            return_message: message.into(),
            ..Default::default()
        }
    }

    pub fn is_ok(&self) -> bool {
        self.return_code.is_ok()
    }

    pub fn account(&self, address: &Address) -> Option<&OutputAccount> {
        self.output_accounts.get(address)
    }

    /// Sum of gas used by every account
    pub fn total_gas_used(&self) -> u64 {
        self.output_accounts
            .values()
            .fold(0u64, |acc, account| acc.saturating_add(account.gas_used))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_return_code_display() {
        assert_eq!(ReturnCode::Ok.to_string(), "ok");
        assert_eq!(ReturnCode::OutOfGas.to_string(), "out of gas");
        assert_eq!(ReturnCode::ExecutionFailed.as_u64(), 10);
    }

    #[test]
    fn test_failure_output() {
        let output = VmOutput::failure(ReturnCode::UserError, "nope");
        assert!(!output.is_ok());
        assert_eq!(output.gas_remaining, 0);
        assert!(output.output_accounts.is_empty());
    }

    #[test]
    fn test_total_gas_used() {
        let mut output = VmOutput::new();
        for (i, gas) in [(1u8, 10u64), (2, 32)] {
            let address = Address::from_bytes([i; 32]);
            let mut account = OutputAccount::new(address);
            account.gas_used = gas;
            output.output_accounts.insert(address, account);
        }
        assert_eq!(output.total_gas_used(), 42);
    }

    #[test]
    fn test_output_serializes() {
        let output = VmOutput::failure(ReturnCode::ContractNotFound, "missing");
        let json = serde_json::to_string(&output).unwrap();
        let back: VmOutput = serde_json::from_str(&json).unwrap();
        assert_eq!(back, output);
    }
}
