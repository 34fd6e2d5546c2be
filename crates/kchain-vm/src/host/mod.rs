//! The VM host: owns the execution contexts and orchestrates calls.
//!
//! Contracts call back into the host through [`crate::VmHooks`]; nested
//! calls push a snapshot of every context, run the child frame and then
//! merge or roll back its effects.

mod async_call;
mod builtin;
mod execution;
mod hooks;


pub use builtin::{DCDT_NFT_TRANSFER_FUNCTION_NAME, DCDT_TRANSFER_FUNCTION_NAME};

use crate::blockchain_hook::BlockchainHook;
use crate::config::HostConfig;
use crate::contexts::{
    BigIntContext, BlockchainContext, Breakpoint, ExecutionFrame, MeteringContext, OutputContext, RuntimeContext,
    StorageContext,
};
use crate::engine::{BytecodeEngine, CodeCache};
use crate::error::VmError;
use crate::gas_schedule::GasSchedule;
use crate::state_stack::StateStack;
use crate::wasm_validation::WasmCodeVerifier;
use kchain_types::{Address, CallInput, CallType, ReturnCode, VmOutput};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_HOST_ID: AtomicU64 = AtomicU64::new(0);

/// Result of a nested call on the destination's context.
///
/// The output is always produced; it is an error output when the call
/// failed.
#[derive(Debug, Clone, PartialEq)]
pub struct DestCallOutcome {
    pub vm_output: VmOutput,
    pub result: Result<(), VmError>,
}

impl DestCallOutcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }

    pub fn into_result(self) -> Result<VmOutput, VmError> {
        self.result.map(|_| self.vm_output)
    }
}

/// Executes one transaction at a time against a world supplied by a
/// [`BlockchainHook`].
pub struct VmHost {
    config: HostConfig,
    blockchain: BlockchainContext,
    runtime: RuntimeContext,
    metering: MeteringContext,
    output: OutputContext,
    storage: StorageContext,
    big_int: BigIntContext,
    builtin_functions: BTreeSet<String>,
    span: tracing::Span,
}

impl VmHost {
    pub fn new(
        hook: Arc<dyn BlockchainHook>,
        engine: Arc<dyn BytecodeEngine>,
        config: HostConfig,
    ) -> Result<Self, VmError> {
        let code_cache = Arc::new(CodeCache::new(config.code_cache_capacity));
        Self::with_code_cache(hook, engine, code_cache, config)
    }

    /// Create a host sharing compiled code with other hosts.
    pub fn with_code_cache(
        hook: Arc<dyn BlockchainHook>,
        engine: Arc<dyn BytecodeEngine>,
        code_cache: Arc<CodeCache>,
        config: HostConfig,
    ) -> Result<Self, VmError> {
        config.validate()?;

        let verifier = if config.verify_code {
            Some(WasmCodeVerifier::new()?)
        } else {
            None
        };
        let builtin_functions = hook.builtin_function_names();
        let id = NEXT_HOST_ID.fetch_add(1, Ordering::Relaxed);
        let span = tracing::info_span!("vm_host", id);
        tracing::debug!(
            parent: &span,
            shards = config.num_shards,
            builtins = builtin_functions.len(),
            "host created"
        );

        Ok(Self {
            blockchain: BlockchainContext::new(hook, config.vm_type),
            runtime: RuntimeContext::new(engine, code_cache, verifier, config.max_instances),
            metering: MeteringContext::new(config.features.clone(), config.block_gas_limit),
            output: OutputContext::new(),
            storage: StorageContext::new(config.protected_key_prefix.as_bytes()),
            big_int: BigIntContext::new(),
            builtin_functions,
            span,
            config,
        })
    }

    /// Select the gas schedule. Ignored once a schedule is in use.
    pub fn set_gas_schedule(&self, schedule: GasSchedule) -> bool {
        self.metering.set_gas_schedule(Arc::new(schedule))
    }

    pub fn gas_schedule(&self) -> &GasSchedule {
        self.metering.gas_schedule()
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn runtime(&self) -> &RuntimeContext {
        &self.runtime
    }

    pub fn metering(&self) -> &MeteringContext {
        &self.metering
    }

    pub fn output(&self) -> &OutputContext {
        &self.output
    }

    pub fn storage(&self) -> &StorageContext {
        &self.storage
    }

    pub fn blockchain(&self) -> &BlockchainContext {
        &self.blockchain
    }

    pub fn is_builtin_function_name(&self, name: &str) -> bool {
        self.builtin_functions.contains(name)
    }

    pub fn are_in_same_shard(&self, a: &Address, b: &Address) -> bool {
        self.blockchain.in_same_shard(a, b)
    }

    /// Whether every context's snapshot stack is empty.
    pub fn state_stacks_empty(&self) -> bool {
        self.check_state_stacks().is_ok()
    }

    fn check_state_stacks(&self) -> Result<(), VmError> {
        let depths = [
            ("runtime", self.runtime.state_stack_len()),
            ("metering", self.metering.state_stack_len()),
            ("output", self.output.state_stack_len()),
            ("storage", self.storage.state_stack_len()),
            ("big int", self.big_int.state_stack_len()),
        ];
        match depths.into_iter().find(|(_, depth)| *depth > 0) {
            Some((context, depth)) => {
                tracing::error!(context, depth, "state stack not empty after execution");
                Err(VmError::StateStackImbalance(context))
            }
            None => Ok(()),
        }
    }

    fn init_state(&mut self) {
        self.runtime.clean_instance();
        self.runtime.clear_state_stack();
        self.metering.clear_state_stack();
        self.output.clear_state_stack();
        self.storage.clear_state_stack();
        self.big_int.clear_state_stack();

        self.runtime.init_state();
        self.metering.init_state();
        self.output.init_state();
        self.storage.init_state();
        self.big_int.init_state();
    }

    pub fn gas_left(&self) -> u64 {
        self.metering.gas_left(&self.runtime)
    }

    fn use_gas(&mut self, gas: u64) {
        self.metering.use_gas(&mut self.runtime, gas);
    }

    fn restore_gas(&mut self, gas: u64) {
        self.metering.restore_gas(&mut self.runtime, gas);
    }

    fn free_gas(&mut self, gas: u64) {
        self.metering.free_gas(&mut self.output, gas);
    }

    /// Record gas passed by the current contract to `destination`.
    fn forward_gas(&mut self, destination: Option<&Address>, gas: u64) {
        let source = *self.runtime.sc_address();
        let on_stack = destination.is_some_and(|address| self.runtime.is_contract_on_stack(address));
        self.metering.forward_gas(&source, destination, gas, on_stack);
    }

    fn use_all_gas_left(&mut self) {
        let left = self.gas_left();
        self.use_gas(left);
    }

    /// Output of the current frame, charging its gas to the contract.
    fn get_vm_output(&mut self) -> VmOutput {
        let (gas_used, _) = self.metering.gas_used_by_contract(&self.runtime);
        let gas_remaining = self.gas_left();
        let sc_address = *self.runtime.sc_address();
        self.output.get_vm_output(&sc_address, gas_remaining, gas_used)
    }

    /// Stop the running contract with a failure.
    fn fail_execution(&mut self, err: Option<&VmError>) {
        let message = err.map(|e| e.to_string()).unwrap_or_else(|| "execution failed".to_string());
        tracing::debug!(%message, "execution failed");
        self.output.set_return_code(ReturnCode::ExecutionFailed);
        self.output.set_return_message(message);
        self.runtime.set_breakpoint(Breakpoint::ExecutionFailed);
    }

    fn signal_user_error(&mut self, message: &str) {
        self.output.set_return_code(ReturnCode::UserError);
        self.output.set_return_message(message);
        self.runtime.set_breakpoint(Breakpoint::SignalError);
    }

    /// Nested direct calls inherit the transaction hashes of the caller.
    fn copy_tx_hashes_from_context(&self, input: &mut CallInput) {
        if input.vm_input.call_type != CallType::DirectCall {
            return;
        }
        self.inherit_tx_hashes(input);
    }

    fn inherit_tx_hashes(&self, input: &mut CallInput) {
        let current = self.runtime.vm_input();
        if !current.original_tx_hash.is_empty() {
            input.vm_input.original_tx_hash = current.original_tx_hash.clone();
        }
        if !current.current_tx_hash.is_empty() {
            input.vm_input.current_tx_hash = current.current_tx_hash.clone();
        }
        if !current.prev_tx_hash.is_empty() {
            input.vm_input.prev_tx_hash = current.prev_tx_hash.clone();
        }
    }
}

impl std::fmt::Debug for VmHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmHost")
            .field("runtime", &self.runtime)
            .field("builtin_functions", &self.builtin_functions)
            .finish()
    }
}
