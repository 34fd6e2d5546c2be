//! Host functions callable by running contract code.
//!
//! Every function charges its cost from the gas schedule before doing any
//! work. A function returning [`InstanceError::Breakpoint`] has stopped the
//! contract; the host resolves the reason once the engine returns. Functions
//! returning an `i32` status follow the contract ABI: `0` on success, `1` on
//! a failure the contract may recover from.

use crate::contexts::storage::StorageStatus;
use crate::engine::InstanceError;
use kchain_types::{Address, CodeMetadata};
use num_bigint::BigInt;

pub type HookResult<T> = Result<T, InstanceError>;

/// Index of a big integer held by the host
pub type BigIntHandle = i32;

pub trait VmHooks {
    fn sc_address(&mut self) -> HookResult<Address>;
    fn owner_address(&mut self) -> HookResult<Address>;
    fn caller(&mut self) -> HookResult<Address>;
    fn call_value(&mut self) -> HookResult<BigInt>;
    fn function(&mut self) -> HookResult<String>;
    fn num_arguments(&mut self) -> HookResult<usize>;
    fn argument(&mut self, index: usize) -> HookResult<Vec<u8>>;
    fn gas_left(&mut self) -> HookResult<u64>;
    fn shard_of_address(&mut self, address: &Address) -> HookResult<u32>;
    fn is_smart_contract(&mut self, address: &Address) -> HookResult<bool>;
    fn external_balance(&mut self, address: &Address) -> HookResult<BigInt>;
    fn block_nonce(&mut self) -> HookResult<u64>;
    fn block_round(&mut self) -> HookResult<u64>;
    fn block_epoch(&mut self) -> HookResult<u32>;
    fn block_timestamp(&mut self) -> HookResult<u64>;
    fn state_root_hash(&mut self) -> HookResult<Vec<u8>>;

    /// Charge gas consumed by the running code itself
    fn use_gas(&mut self, gas: u64) -> HookResult<()>;

    fn finish(&mut self, data: &[u8]) -> HookResult<()>;

    /// Stop the contract with a user error. Always returns a breakpoint.
    fn signal_error(&mut self, message: &str) -> HookResult<()>;

    fn write_log(&mut self, topics: &[Vec<u8>], data: &[u8]) -> HookResult<()>;
    fn num_return_data(&mut self) -> HookResult<usize>;
    fn return_data(&mut self, index: usize) -> HookResult<Vec<u8>>;

    fn storage_store(&mut self, key: &[u8], value: &[u8]) -> HookResult<StorageStatus>;
    fn storage_load(&mut self, key: &[u8]) -> HookResult<Vec<u8>>;
    fn storage_load_from_address(&mut self, address: &Address, key: &[u8]) -> HookResult<Vec<u8>>;

    fn transfer_value(&mut self, destination: &Address, value: &BigInt, data: &[u8]) -> HookResult<i32>;

    fn transfer_value_execute(
        &mut self,
        destination: &Address,
        value: &BigInt,
        gas_limit: u64,
        function: &str,
        arguments: &[Vec<u8>],
    ) -> HookResult<i32>;

    #[allow(clippy::too_many_arguments)]
    fn transfer_dcdt_execute(
        &mut self,
        destination: &Address,
        token_id: &[u8],
        nonce: u64,
        value: &BigInt,
        gas_limit: u64,
        function: &str,
        arguments: &[Vec<u8>],
    ) -> HookResult<i32>;

    fn execute_on_dest_context(
        &mut self,
        gas_limit: u64,
        destination: &Address,
        value: &BigInt,
        function: &str,
        arguments: &[Vec<u8>],
    ) -> HookResult<i32>;

    fn execute_on_same_context(
        &mut self,
        gas_limit: u64,
        destination: &Address,
        value: &BigInt,
        function: &str,
        arguments: &[Vec<u8>],
    ) -> HookResult<i32>;

    fn execute_read_only(
        &mut self,
        gas_limit: u64,
        destination: &Address,
        function: &str,
        arguments: &[Vec<u8>],
    ) -> HookResult<i32>;

    /// Deploy new code; `None` when the deployment failed.
    fn create_contract(
        &mut self,
        gas_limit: u64,
        value: &BigInt,
        code: &[u8],
        code_metadata: CodeMetadata,
        arguments: &[Vec<u8>],
    ) -> HookResult<Option<Address>>;

    /// Replace the code of `destination` through an asynchronous call.
    fn upgrade_contract(
        &mut self,
        destination: &Address,
        gas_limit: u64,
        value: &BigInt,
        code: &[u8],
        code_metadata: CodeMetadata,
        arguments: &[Vec<u8>],
    ) -> HookResult<()>;

    /// Call another contract asynchronously. Stops the calling contract.
    fn async_call(&mut self, destination: &Address, value: &BigInt, data: &[u8]) -> HookResult<()>;

    /// Register an asynchronous call resolved when the contract returns.
    #[allow(clippy::too_many_arguments)]
    fn create_async_call(
        &mut self,
        identifier: &[u8],
        destination: &Address,
        value: &BigInt,
        data: &[u8],
        success_callback: &str,
        error_callback: &str,
        gas: u64,
    ) -> HookResult<i32>;

    /// Callback run once every call of an async context has been resolved.
    fn set_async_context_callback(&mut self, identifier: &[u8], callback: &str) -> HookResult<i32>;

    fn big_int_new(&mut self, small_value: i64) -> HookResult<BigIntHandle>;
    fn big_int_add(&mut self, destination: BigIntHandle, a: BigIntHandle, b: BigIntHandle) -> HookResult<()>;
    fn big_int_get_unsigned_argument(&mut self, index: usize, destination: BigIntHandle) -> HookResult<()>;
    fn big_int_get_call_value(&mut self, destination: BigIntHandle) -> HookResult<()>;
    fn big_int_finish_unsigned(&mut self, handle: BigIntHandle) -> HookResult<()>;
}
