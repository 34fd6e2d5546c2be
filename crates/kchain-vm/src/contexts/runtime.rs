//! The executing frame: its input, the running instance and the pending
//! asynchronous work.

use crate::contexts::metering::ExecutionFrame;
use crate::engine::{BytecodeEngine, CodeCache, EngineError, RuntimeInstance};
use crate::error::VmError;
use crate::state_stack::StateStack;
use crate::wasm_validation::WasmCodeVerifier;
use kchain_types::{Address, CallInput, CodeMetadata, VmInput};
use num_bigint::BigInt;
use std::collections::BTreeMap;
use std::sync::Arc;

pub const INIT_FUNCTION_NAME: &str = "init";
pub const CALLBACK_FUNCTION_NAME: &str = "callBack";
pub const UPGRADE_FUNCTION_NAME: &str = "upgradeContract";

/// Why the running contract was stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Breakpoint {
    #[default]
    None,
    ExecutionFailed,
    AsyncCall,
    SignalError,
    OutOfGas,
}

/// The asynchronous call requested by the running contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsyncCallInfo {
    pub destination: Address,
    pub data: Vec<u8>,
    pub gas_limit: u64,
    pub gas_locked: u64,
    pub value: BigInt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AsyncCallStatus {
    #[default]
    Pending,
    Resolved,
    Rejected,
}

/// A call registered through `createAsyncCall`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsyncGeneratedCall {
    pub status: AsyncCallStatus,
    pub destination: Address,
    pub data: Vec<u8>,
    pub value: BigInt,
    pub success_callback: String,
    pub error_callback: String,
    pub provided_gas: u64,
    pub gas_limit: u64,
    pub gas_locked: u64,
}

impl AsyncGeneratedCall {
    pub fn has_callbacks(&self) -> bool {
        !self.success_callback.is_empty() || !self.error_callback.is_empty()
    }
}

/// Calls grouped under one identifier, with a callback for the group.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AsyncContext {
    pub callback: String,
    pub calls: Vec<AsyncGeneratedCall>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AsyncContextInfo {
    pub caller: Address,
    pub return_data: Vec<u8>,
    pub contexts: BTreeMap<Vec<u8>, AsyncContext>,
}

impl AsyncContextInfo {
    pub fn new(caller: Address) -> Self {
        Self {
            caller,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.values().all(|context| context.calls.is_empty())
    }

    pub fn call_count(&self) -> usize {
        self.contexts.values().map(|context| context.calls.len()).sum()
    }

    pub fn merge(&mut self, other: AsyncContextInfo) {
        for (identifier, context) in other.contexts {
            let target = self.contexts.entry(identifier).or_default();
            target.calls.extend(context.calls);
            if !context.callback.is_empty() {
                target.callback = context.callback;
            }
        }
    }
}

struct RuntimeSnapshot {
    vm_input: VmInput,
    sc_address: Address,
    function: String,
    read_only: bool,
    breakpoint: Breakpoint,
    async_call_info: Option<AsyncCallInfo>,
    async_context_info: AsyncContextInfo,
}

struct InstanceSnapshot {
    instance: Option<Arc<dyn RuntimeInstance>>,
    detached_points: u64,
    code_size: u64,
}

pub struct RuntimeContext {
    vm_input: VmInput,
    sc_address: Address,
    function: String,
    read_only: bool,
    breakpoint: Breakpoint,
    async_call_info: Option<AsyncCallInfo>,
    async_context_info: AsyncContextInfo,
    instance: Option<Arc<dyn RuntimeInstance>>,
    /// Gas points of a frame running without an instance (built-in calls)
    detached_points: u64,
    code_size: u64,
    must_verify_next: bool,
    state_stack: Vec<RuntimeSnapshot>,
    instance_stack: Vec<InstanceSnapshot>,
    max_instances: usize,
    engine: Arc<dyn BytecodeEngine>,
    code_cache: Arc<CodeCache>,
    verifier: Option<WasmCodeVerifier>,
}

impl RuntimeContext {
    pub fn new(
        engine: Arc<dyn BytecodeEngine>,
        code_cache: Arc<CodeCache>,
        verifier: Option<WasmCodeVerifier>,
        max_instances: usize,
    ) -> Self {
        Self {
            vm_input: VmInput::default(),
            sc_address: Address::ZERO,
            function: String::new(),
            read_only: false,
            breakpoint: Breakpoint::None,
            async_call_info: None,
            async_context_info: AsyncContextInfo::default(),
            instance: None,
            detached_points: 0,
            code_size: 0,
            must_verify_next: false,
            state_stack: Vec::new(),
            instance_stack: Vec::new(),
            max_instances,
            engine,
            code_cache,
            verifier,
        }
    }

    pub fn init_state_from_call_input(&mut self, input: &CallInput) {
        self.vm_input = input.vm_input.clone();
        self.sc_address = input.recipient;
        self.function = input.function.clone();
        self.breakpoint = Breakpoint::None;
        self.async_call_info = None;
        self.async_context_info = AsyncContextInfo::new(input.vm_input.caller);
    }

    pub fn set_vm_input(&mut self, input: VmInput) {
        self.vm_input = input;
    }

    pub fn vm_input(&self) -> &VmInput {
        &self.vm_input
    }

    pub fn vm_input_mut(&mut self) -> &mut VmInput {
        &mut self.vm_input
    }

    pub fn set_sc_address(&mut self, address: Address) {
        self.sc_address = address;
    }

    pub fn function(&self) -> &str {
        &self.function
    }

    pub fn set_custom_call_function(&mut self, function: impl Into<String>) {
        self.function = function.into();
    }

    pub fn arguments(&self) -> &[Vec<u8>] {
        &self.vm_input.arguments
    }

    pub fn current_tx_hash(&self) -> &[u8] {
        &self.vm_input.current_tx_hash
    }

    pub fn original_tx_hash(&self) -> &[u8] {
        &self.vm_input.original_tx_hash
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    pub fn set_read_only(&mut self, read_only: bool) {
        self.read_only = read_only;
    }

    pub fn breakpoint(&self) -> Breakpoint {
        self.breakpoint
    }

    pub fn set_breakpoint(&mut self, breakpoint: Breakpoint) {
        self.breakpoint = breakpoint;
    }

    pub fn async_call_info(&self) -> Option<&AsyncCallInfo> {
        self.async_call_info.as_ref()
    }

    pub fn set_async_call_info(&mut self, info: AsyncCallInfo) {
        self.async_call_info = Some(info);
    }

    pub fn async_context_info(&self) -> &AsyncContextInfo {
        &self.async_context_info
    }

    pub fn take_async_context_info(&mut self) -> AsyncContextInfo {
        let caller = self.async_context_info.caller;
        std::mem::replace(&mut self.async_context_info, AsyncContextInfo::new(caller))
    }

    pub fn merge_async_context_info(&mut self, other: AsyncContextInfo) {
        self.async_context_info.merge(other);
    }

    pub fn add_async_context_call(&mut self, identifier: &[u8], call: AsyncGeneratedCall) {
        self.async_context_info
            .contexts
            .entry(identifier.to_vec())
            .or_default()
            .calls
            .push(call);
    }

    pub fn set_async_context_callback(&mut self, identifier: &[u8], callback: &str) -> Result<(), VmError> {
        let context = self
            .async_context_info
            .contexts
            .get_mut(identifier)
            .ok_or_else(|| VmError::AsyncContextDoesNotExist(hex::encode(identifier)))?;
        context.callback = callback.to_string();
        Ok(())
    }

    /// Split the upgrade arguments into code, metadata and the arguments
    /// left for the new code's `init`.
    pub fn extract_code_upgrade_from_args(&mut self) -> Result<(Vec<u8>, CodeMetadata), VmError> {
        if self.vm_input.arguments.len() < 2 {
            return Err(VmError::InvalidUpgradeArguments);
        }
        let mut arguments = std::mem::take(&mut self.vm_input.arguments).into_iter();
        let code = arguments.next().unwrap_or_default();
        let metadata = CodeMetadata::from_bytes(&arguments.next().unwrap_or_default());
        self.vm_input.arguments = arguments.collect();
        Ok((code, metadata))
    }

    /// Require verification of the next code started in this runtime.
    pub fn must_verify_next_contract_code(&mut self) {
        self.must_verify_next = true;
    }

    pub fn is_verification_pending(&self) -> bool {
        self.must_verify_next
    }

    pub fn reset_verification(&mut self) {
        self.must_verify_next = false;
    }

    /// Start an instance of `code` as the current instance.
    pub fn start_instance(&mut self, code: &[u8], gas_limit: u64, new_code: bool) -> Result<(), VmError> {
        if self.instance_stack.len() >= self.max_instances {
            tracing::debug!(max = self.max_instances, "instance limit reached");
            return Err(VmError::MaxInstancesReached);
        }

        if std::mem::take(&mut self.must_verify_next) {
            if let Some(verifier) = &self.verifier {
                verifier.verify(code)?;
            }
        }

        let compiled = self
            .code_cache
            .get_or_compile(self.engine.as_ref(), code, new_code)
            .map_err(engine_error)?;
        let instance = compiled.instantiate(gas_limit).map_err(engine_error)?;
        instance.set_points_used(0);

        self.replace_instance(Some(instance));
        self.detached_points = 0;
        self.code_size = code.len() as u64;
        Ok(())
    }

    /// Run the current frame without an instance, metering a frame-local
    /// counter instead.
    pub fn detach_instance(&mut self) {
        self.replace_instance(None);
        self.detached_points = 0;
        self.code_size = 0;
    }

    fn replace_instance(&mut self, instance: Option<Arc<dyn RuntimeInstance>>) {
        if let Some(current) = self.instance.take() {
            let kept = instance
                .as_ref()
                .map(|next| Arc::ptr_eq(next, &current))
                .unwrap_or(false);
            if !kept && !self.is_saved_instance(&current) {
                current.clean();
            }
        }
        self.instance = instance;
    }

    fn is_saved_instance(&self, instance: &Arc<dyn RuntimeInstance>) -> bool {
        self.instance_stack
            .iter()
            .filter_map(|saved| saved.instance.as_ref())
            .any(|saved| Arc::ptr_eq(saved, instance))
    }

    fn pop_instance(&mut self) {
        let Some(saved) = self.instance_stack.pop() else {
            return;
        };
        self.replace_instance(saved.instance);
        self.detached_points = saved.detached_points;
        self.code_size = saved.code_size;
    }

    pub fn instance(&self) -> Result<Arc<dyn RuntimeInstance>, VmError> {
        self.instance
            .clone()
            .ok_or_else(|| VmError::Engine("no running instance".into()))
    }

    pub fn has_function(&self, name: &str) -> bool {
        self.instance
            .as_ref()
            .map(|instance| instance.has_function(name))
            .unwrap_or(false)
    }

    pub fn has_callback_method(&self) -> bool {
        self.has_function(CALLBACK_FUNCTION_NAME)
    }

    /// Name of the export to run for the current call.
    pub fn function_to_call(&self) -> Result<String, VmError> {
        if self.has_function(&self.function) {
            return Ok(self.function.clone());
        }
        if self.function == CALLBACK_FUNCTION_NAME {
            return Err(VmError::NilCallbackFunction);
        }
        Err(VmError::FuncNotFound(self.function.clone()))
    }

    /// Clean the current instance at the end of a top-level call.
    pub fn clean_instance(&mut self) {
        self.replace_instance(None);
        self.detached_points = 0;
    }

    pub fn running_instances_count(&self) -> usize {
        self.instance_stack.len() + usize::from(self.instance.is_some())
    }

    pub fn instance_stack_len(&self) -> usize {
        self.instance_stack.len()
    }

    /// Whether `address` runs in a frame below the current one
    pub fn is_contract_on_stack(&self, address: &Address) -> bool {
        self.state_stack.iter().any(|state| &state.sc_address == address)
    }
}

fn engine_error(err: EngineError) -> VmError {
    match err {
        EngineError::InvalidCode(reason) => {
            tracing::debug!(%reason, "code rejected by engine");
            VmError::ContractInvalid
        }
        EngineError::Internal(reason) => VmError::Engine(reason),
    }
}

impl ExecutionFrame for RuntimeContext {
    fn points_used(&self) -> u64 {
        match &self.instance {
            Some(instance) => instance.points_used(),
            None => self.detached_points,
        }
    }

    fn set_points_used(&mut self, points: u64) {
        match &self.instance {
            Some(instance) => instance.set_points_used(points),
            None => self.detached_points = points,
        }
    }

    fn sc_address(&self) -> &Address {
        &self.sc_address
    }

    fn sc_code_size(&self) -> u64 {
        self.code_size
    }
}

impl StateStack for RuntimeContext {
    fn init_state(&mut self) {
        self.vm_input = VmInput::default();
        self.sc_address = Address::ZERO;
        self.function.clear();
        self.read_only = false;
        self.breakpoint = Breakpoint::None;
        self.async_call_info = None;
        self.async_context_info = AsyncContextInfo::default();
        self.must_verify_next = false;
    }

    fn push_state(&mut self) {
        self.state_stack.push(RuntimeSnapshot {
            vm_input: self.vm_input.clone(),
            sc_address: self.sc_address,
            function: self.function.clone(),
            read_only: self.read_only,
            breakpoint: self.breakpoint,
            async_call_info: self.async_call_info.clone(),
            async_context_info: self.async_context_info.clone(),
        });
        self.instance_stack.push(InstanceSnapshot {
            instance: self.instance.clone(),
            detached_points: self.detached_points,
            code_size: self.code_size,
        });
    }

    fn pop_set_active_state(&mut self) {
        let Some(snapshot) = self.state_stack.pop() else {
            return;
        };
        self.vm_input = snapshot.vm_input;
        self.sc_address = snapshot.sc_address;
        self.function = snapshot.function;
        self.read_only = snapshot.read_only;
        self.breakpoint = snapshot.breakpoint;
        self.async_call_info = snapshot.async_call_info;
        self.async_context_info = snapshot.async_context_info;
        self.pop_instance();
    }

    fn pop_discard(&mut self) {
        if self.state_stack.pop().is_some() {
            self.pop_instance();
        }
    }

    fn clear_state_stack(&mut self) {
        self.state_stack.clear();
        for saved in std::mem::take(&mut self.instance_stack) {
            if let Some(instance) = saved.instance {
                let is_current = self
                    .instance
                    .as_ref()
                    .map(|current| Arc::ptr_eq(current, &instance))
                    .unwrap_or(false);
                if !is_current {
                    instance.clean();
                }
            }
        }
    }

    fn state_stack_len(&self) -> usize {
        self.state_stack.len()
    }
}

impl std::fmt::Debug for RuntimeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeContext")
            .field("sc_address", &self.sc_address)
            .field("function", &self.function)
            .field("breakpoint", &self.breakpoint)
            .field("read_only", &self.read_only)
            .field("depth", &self.state_stack.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockContract, MockEngine};

    fn addr(b: u8) -> Address {
        Address::from_bytes([b; 32])
    }

    fn runtime(max_instances: usize) -> (Arc<MockEngine>, RuntimeContext) {
        let engine = Arc::new(MockEngine::new());
        engine.register(b"parent".to_vec(), MockContract::new().with_function("run", |_| Ok(())));
        engine.register(b"child".to_vec(), MockContract::new().with_function(CALLBACK_FUNCTION_NAME, |_| Ok(())));
        let runtime = RuntimeContext::new(engine.clone(), Arc::new(CodeCache::default()), None, max_instances);
        (engine, runtime)
    }

    #[test]
    fn test_nested_instances_are_restored() {
        let (engine, mut runtime) = runtime(10);
        runtime.init_state_from_call_input(&CallInput::new(addr(1), addr(2), "run", 100));
        runtime.start_instance(b"parent", 100, false).unwrap();
        runtime.set_points_used(30);

        runtime.push_state();
        runtime.init_state_from_call_input(&CallInput::new(addr(2), addr(3), "callBack", 50));
        runtime.start_instance(b"child", 50, false).unwrap();
        assert_eq!(runtime.points_used(), 0);
        assert!(runtime.is_contract_on_stack(&addr(2)));
        assert!(runtime.has_callback_method());

        runtime.pop_set_active_state();
        assert_eq!(runtime.points_used(), 30);
        assert_eq!(runtime.sc_address(), &addr(2));
        assert_eq!(runtime.function(), "run");
        assert_eq!(engine.cleaned_instances(), 1);
        assert_eq!(runtime.instance_stack_len(), 0);
    }

    #[test]
    fn test_parent_kept_when_child_never_started() {
        let (engine, mut runtime) = runtime(10);
        runtime.start_instance(b"parent", 100, false).unwrap();
        runtime.push_state();
        runtime.pop_set_active_state();

        assert_eq!(engine.cleaned_instances(), 0);
        runtime.clean_instance();
        assert_eq!(engine.cleaned_instances(), 1);
    }

    #[test]
    fn test_max_instances() {
        let (_, mut runtime) = runtime(1);
        runtime.start_instance(b"parent", 100, false).unwrap();
        runtime.push_state();
        assert_eq!(runtime.start_instance(b"child", 10, false), Err(VmError::MaxInstancesReached));
        runtime.pop_set_active_state();
        assert_eq!(runtime.running_instances_count(), 1);
    }

    #[test]
    fn test_unknown_code_is_invalid() {
        let (_, mut runtime) = runtime(10);
        assert_eq!(runtime.start_instance(b"nope", 10, false), Err(VmError::ContractInvalid));
    }

    #[test]
    fn test_detached_frame_meters_locally() {
        let (_, mut runtime) = runtime(10);
        runtime.start_instance(b"parent", 100, false).unwrap();
        runtime.set_points_used(7);

        runtime.push_state();
        runtime.detach_instance();
        runtime.set_points_used(3);
        assert_eq!(runtime.points_used(), 3);

        runtime.pop_set_active_state();
        assert_eq!(runtime.points_used(), 7);
    }

    #[test]
    fn test_function_to_call() {
        let (_, mut runtime) = runtime(10);
        runtime.init_state_from_call_input(&CallInput::new(addr(1), addr(2), "missing", 100));
        runtime.start_instance(b"parent", 100, false).unwrap();
        assert_eq!(runtime.function_to_call(), Err(VmError::FuncNotFound("missing".into())));

        runtime.set_custom_call_function(CALLBACK_FUNCTION_NAME);
        assert_eq!(runtime.function_to_call(), Err(VmError::NilCallbackFunction));

        runtime.set_custom_call_function("run");
        assert_eq!(runtime.function_to_call(), Ok("run".to_string()));
    }

    #[test]
    fn test_extract_upgrade_args() {
        let (_, mut runtime) = runtime(10);
        let input = CallInput::new(addr(1), addr(2), UPGRADE_FUNCTION_NAME, 100)
            .with_arguments(vec![b"code".to_vec(), vec![0x01, 0x00], b"arg".to_vec()]);
        runtime.init_state_from_call_input(&input);

        let (code, metadata) = runtime.extract_code_upgrade_from_args().unwrap();
        assert_eq!(code, b"code".to_vec());
        assert!(metadata.upgradeable);
        assert_eq!(runtime.arguments(), &[b"arg".to_vec()]);

        runtime.init_state_from_call_input(&CallInput::new(addr(1), addr(2), UPGRADE_FUNCTION_NAME, 100));
        assert_eq!(runtime.extract_code_upgrade_from_args(), Err(VmError::InvalidUpgradeArguments));
    }

    #[test]
    fn test_async_context_registration() {
        let (_, mut runtime) = runtime(10);
        runtime.init_state_from_call_input(&CallInput::new(addr(1), addr(2), "run", 100));
        assert_eq!(
            runtime.set_async_context_callback(b"ctx", "done"),
            Err(VmError::AsyncContextDoesNotExist(hex::encode(b"ctx")))
        );

        let call = AsyncGeneratedCall {
            status: AsyncCallStatus::Pending,
            destination: addr(3),
            data: b"f".to_vec(),
            value: BigInt::from(0),
            success_callback: "ok".into(),
            error_callback: String::new(),
            provided_gas: 10,
            gas_limit: 0,
            gas_locked: 0,
        };
        runtime.add_async_context_call(b"ctx", call);
        runtime.set_async_context_callback(b"ctx", "done").unwrap();
        assert_eq!(runtime.async_context_info().call_count(), 1);

        let taken = runtime.take_async_context_info();
        assert!(runtime.async_context_info().is_empty());
        assert_eq!(taken.contexts[b"ctx".as_slice()].callback, "done");
    }

    #[test]
    fn test_verification_flag_is_consumed() {
        let (_, mut runtime) = runtime(10);
        runtime.must_verify_next_contract_code();
        runtime.start_instance(b"parent", 10, true).unwrap();
        assert!(!runtime.is_verification_pending());
    }
}
