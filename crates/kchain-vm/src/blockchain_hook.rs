//! Read access to world state, supplied by the embedder.

use kchain_types::{Address, CallInput, UserAccount, VmOutput};
use num_bigint::BigInt;
use std::collections::BTreeSet;
use thiserror::Error;

/// Failure reported by the world.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct HookError(pub String);

impl HookError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Block header fields visible to contracts.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BlockInfo {
    pub nonce: u64,
    pub round: u64,
    pub epoch: u32,
    pub timestamp: u64,
    pub random_seed: Vec<u8>,
}

/// Token balance and metadata held by an account.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DcdtToken {
    pub value: BigInt,
    pub nonce: u64,
    pub attributes: Vec<u8>,
}

/// World state and protocol services the host calls into.
///
/// Implementations are shared by every host of a process and must be safe
/// to call from several threads.
pub trait BlockchainHook: Send + Sync {
    /// Address of a contract deployed by `creator` at `creator_nonce`.
    fn new_address(&self, creator: &Address, creator_nonce: u64, vm_type: &[u8]) -> Result<Address, HookError>;

    /// Account record, `None` if the account does not exist.
    fn get_user_account(&self, address: &Address) -> Result<Option<UserAccount>, HookError>;

    fn get_storage_data(&self, address: &Address, key: &[u8]) -> Result<Vec<u8>, HookError>;

    fn get_shard_of_address(&self, address: &Address) -> u32;

    fn is_smart_contract(&self, address: &Address) -> bool;

    fn is_payable(&self, address: &Address) -> Result<bool, HookError>;

    /// Execute a protocol built-in function.
    fn process_builtin_function(&self, input: &CallInput) -> Result<VmOutput, HookError>;

    fn builtin_function_names(&self) -> BTreeSet<String>;

    fn get_dcdt_token(&self, address: &Address, token_id: &[u8], nonce: u64) -> Result<DcdtToken, HookError>;

    fn current_block(&self) -> BlockInfo;

    fn last_block(&self) -> BlockInfo;

    fn get_block_hash(&self, nonce: u64) -> Result<Vec<u8>, HookError>;

    fn state_root_hash(&self) -> Vec<u8>;

    /// Code of a contract; empty for user accounts.
    fn get_code(&self, address: &Address) -> Result<Vec<u8>, HookError> {
        Ok(self
            .get_user_account(address)?
            .map(|account| account.code)
            .unwrap_or_default())
    }
}
