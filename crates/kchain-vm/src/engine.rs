//! Seam between the host and the bytecode engine.
//!
//! The host never interprets code itself. It compiles code through a
//! [`BytecodeEngine`], instantiates it with a gas limit and calls exported
//! functions, handing the running code a [`VmHooks`] implementation to call
//! back into.

use crate::vmhooks::VmHooks;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Failures reported while preparing code.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EngineError {
    /// The code is not acceptable contract code
    #[error("invalid code: {0}")]
    InvalidCode(String),
    /// The engine itself failed
    #[error("engine failure: {0}")]
    Internal(String),
}

/// Ways a running function can stop early.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InstanceError {
    /// A host function raised a breakpoint; the host knows which one
    #[error("breakpoint")]
    Breakpoint,
    #[error("trap: {0}")]
    Trap(String),
    #[error("function not found: {0}")]
    FunctionNotFound(String),
}

/// A live instance of contract code.
///
/// Instances are shared between the instance stack and the active frame,
/// so all state is interior.
pub trait RuntimeInstance: Send + Sync {
    fn has_function(&self, name: &str) -> bool;

    fn call_function(&self, name: &str, hooks: &mut dyn VmHooks) -> Result<(), InstanceError>;

    /// Gas points consumed by this instance so far
    fn points_used(&self) -> u64;

    fn set_points_used(&self, points: u64);

    fn set_gas_limit(&self, gas_limit: u64);

    /// Release engine resources; the instance must not be called again.
    fn clean(&self);
}

/// Compiled code, ready to be instantiated any number of times.
pub trait CompiledContract: Send + Sync {
    fn instantiate(&self, gas_limit: u64) -> Result<Arc<dyn RuntimeInstance>, EngineError>;
}

pub trait BytecodeEngine: Send + Sync {
    fn compile(&self, code: &[u8]) -> Result<Arc<dyn CompiledContract>, EngineError>;
}

/// Compiled code keyed by the hash of its bytes.
///
/// Shared by all hosts of a process: reads take a shared lock, compilation
/// results are inserted under the write lock.
pub struct CodeCache {
    entries: RwLock<HashMap<[u8; 32], Arc<dyn CompiledContract>>>,
    capacity: usize,
    compilations: AtomicU64,
}

impl CodeCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            compilations: AtomicU64::new(0),
        }
    }

    pub fn code_hash(code: &[u8]) -> [u8; 32] {
        *blake3::hash(code).as_bytes()
    }

    pub fn get(&self, code: &[u8]) -> Option<Arc<dyn CompiledContract>> {
        self.entries.read().get(&Self::code_hash(code)).cloned()
    }

    /// Fetch compiled code, compiling on a miss.
    ///
    /// Newly deployed code is always compiled again, so a stale entry can
    /// never stand in for code that still has to pass verification.
    pub fn get_or_compile(
        &self,
        engine: &dyn BytecodeEngine,
        code: &[u8],
        new_code: bool,
    ) -> Result<Arc<dyn CompiledContract>, EngineError> {
        let key = Self::code_hash(code);
        if !new_code {
            if let Some(compiled) = self.entries.read().get(&key) {
                return Ok(Arc::clone(compiled));
            }
        }

        let compiled = engine.compile(code)?;
        self.compilations.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(code_hash = %hex::encode(key), code_len = code.len(), "compiled contract code");

        let mut entries = self.entries.write();
        if entries.len() >= self.capacity && !entries.contains_key(&key) {
            if let Some(evicted) = entries.keys().next().copied() {
                entries.remove(&evicted);
            }
        }
        entries.insert(key, Arc::clone(&compiled));
        Ok(compiled)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of compilations performed through this cache
    pub fn compilations(&self) -> u64 {
        self.compilations.load(Ordering::Relaxed)
    }
}

impl Default for CodeCache {
    fn default() -> Self {
        Self::new(1_000)
    }
}

impl fmt::Debug for CodeCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodeCache")
            .field("entries", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockContract, MockEngine};

    fn engine_with(codes: &[&[u8]]) -> MockEngine {
        let engine = MockEngine::new();
        for code in codes {
            engine.register(code.to_vec(), MockContract::new());
        }
        engine
    }

    #[test]
    fn test_cache_compiles_once() {
        let engine = engine_with(&[b"alpha"]);
        let cache = CodeCache::new(4);

        cache.get_or_compile(&engine, b"alpha", false).unwrap();
        cache.get_or_compile(&engine, b"alpha", false).unwrap();

        assert_eq!(engine.compilations(), 1);
        assert_eq!(cache.compilations(), 1);
        assert!(cache.get(b"alpha").is_some());
    }

    #[test]
    fn test_new_code_is_recompiled() {
        let engine = engine_with(&[b"alpha"]);
        let cache = CodeCache::new(4);

        cache.get_or_compile(&engine, b"alpha", false).unwrap();
        cache.get_or_compile(&engine, b"alpha", true).unwrap();

        assert_eq!(engine.compilations(), 2);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_capacity_is_bounded() {
        let engine = engine_with(&[b"a", b"b", b"c"]);
        let cache = CodeCache::new(2);
        for code in [b"a", b"b", b"c"] {
            cache.get_or_compile(&engine, code, false).unwrap();
        }
        assert_eq!(cache.len(), 2);
        assert!(cache.get(b"c").is_some());
    }

    #[test]
    fn test_invalid_code_not_cached() {
        let engine = engine_with(&[]);
        let cache = CodeCache::default();
        let err = cache.get_or_compile(&engine, b"garbage", false).err();
        assert!(matches!(err, Some(EngineError::InvalidCode(_))));
        assert!(cache.is_empty());
    }
}
