use crate::engine::{BytecodeEngine, CompiledContract, EngineError, InstanceError, RuntimeInstance};
use crate::vmhooks::VmHooks;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Body of an exported function.
pub type ContractFunction = Arc<dyn Fn(&mut dyn VmHooks) -> Result<(), InstanceError> + Send + Sync>;

/// A contract made of Rust closures, registered under some code bytes.
#[derive(Clone, Default)]
pub struct MockContract {
    functions: HashMap<String, ContractFunction>,
}

impl MockContract {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_function<F>(mut self, name: &str, function: F) -> Self
    where
        F: Fn(&mut dyn VmHooks) -> Result<(), InstanceError> + Send + Sync + 'static,
    {
        self.functions.insert(name.to_string(), Arc::new(function));
        self
    }
}

/// Engine that "compiles" code by looking it up among registered contracts.
#[derive(Default)]
pub struct MockEngine {
    contracts: RwLock<HashMap<Vec<u8>, MockContract>>,
    compilations: AtomicU64,
    cleaned: Arc<AtomicU64>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, code: Vec<u8>, contract: MockContract) {
        self.contracts.write().insert(code, contract);
    }

    pub fn compilations(&self) -> u64 {
        self.compilations.load(Ordering::Relaxed)
    }

    /// Instances released so far
    pub fn cleaned_instances(&self) -> u64 {
        self.cleaned.load(Ordering::Relaxed)
    }
}

impl BytecodeEngine for MockEngine {
    fn compile(&self, code: &[u8]) -> Result<Arc<dyn CompiledContract>, EngineError> {
        let contract = self
            .contracts
            .read()
            .get(code)
            .cloned()
            .ok_or_else(|| EngineError::InvalidCode("unknown code".into()))?;
        self.compilations.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::new(MockCompiled {
            contract,
            cleaned: Arc::clone(&self.cleaned),
        }))
    }
}

struct MockCompiled {
    contract: MockContract,
    cleaned: Arc<AtomicU64>,
}

impl CompiledContract for MockCompiled {
    fn instantiate(&self, gas_limit: u64) -> Result<Arc<dyn RuntimeInstance>, EngineError> {
        Ok(Arc::new(MockInstance {
            functions: self.contract.functions.clone(),
            points: AtomicU64::new(0),
            gas_limit: AtomicU64::new(gas_limit),
            cleaned: Arc::clone(&self.cleaned),
        }))
    }
}

struct MockInstance {
    functions: HashMap<String, ContractFunction>,
    points: AtomicU64,
    gas_limit: AtomicU64,
    cleaned: Arc<AtomicU64>,
}

impl RuntimeInstance for MockInstance {
    fn has_function(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    fn call_function(&self, name: &str, hooks: &mut dyn VmHooks) -> Result<(), InstanceError> {
        let function = self
            .functions
            .get(name)
            .cloned()
            .ok_or_else(|| InstanceError::FunctionNotFound(name.to_string()))?;
        function(hooks)?;
        if self.points.load(Ordering::Relaxed) > self.gas_limit.load(Ordering::Relaxed) {
            return Err(InstanceError::Trap("out of gas".into()));
        }
        Ok(())
    }

    fn points_used(&self) -> u64 {
        self.points.load(Ordering::Relaxed)
    }

    fn set_points_used(&self, points: u64) {
        self.points.store(points, Ordering::Relaxed);
    }

    fn set_gas_limit(&self, gas_limit: u64) {
        self.gas_limit.store(gas_limit, Ordering::Relaxed);
    }

    fn clean(&self) {
        self.cleaned.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_code_rejected() {
        let engine = MockEngine::new();
        assert!(matches!(engine.compile(b"nope").err(), Some(EngineError::InvalidCode(_))));
        assert_eq!(engine.compilations(), 0);
    }

    #[test]
    fn test_instance_tracks_points() {
        let engine = MockEngine::new();
        engine.register(b"c".to_vec(), MockContract::new().with_function("f", |_| Ok(())));
        let instance = engine.compile(b"c").unwrap().instantiate(100).unwrap();

        assert!(instance.has_function("f"));
        assert!(!instance.has_function("g"));
        instance.set_points_used(40);
        assert_eq!(instance.points_used(), 40);

        instance.clean();
        assert_eq!(engine.cleaned_instances(), 1);
    }
}
