//! K-Chain VM - smart contract execution host.
//!
//! This crate provides:
//! - Gas metering with per-contract accounting and async gas locking
//! - Nested execution on the same or on the destination context, with
//!   snapshot and rollback of every execution context
//! - Built-in function and DCDT token transfer interception
//! - Synchronous and asynchronous inter-contract calls
//! - The host API ([`VmHooks`]) seen by running contract code
//!
//! The bytecode engine and the world state are injected through
//! [`BytecodeEngine`] and [`BlockchainHook`].

pub mod blockchain_hook;
pub mod call_args;
pub mod config;
pub mod contexts;
pub mod engine;
pub mod error;
pub mod gas_schedule;
pub mod host;
pub mod state_stack;
pub mod telemetry;
pub mod vmhooks;
pub mod wasm_validation;

#[cfg(any(test, feature = "testutils"))]
pub mod mock;

pub use blockchain_hook::{BlockInfo, BlockchainHook, DcdtToken, HookError};
pub use config::{FeatureFlags, HostConfig};
pub use contexts::runtime::{CALLBACK_FUNCTION_NAME, INIT_FUNCTION_NAME, UPGRADE_FUNCTION_NAME};
pub use contexts::{Breakpoint, StorageStatus};
pub use engine::{BytecodeEngine, CodeCache, CompiledContract, EngineError, InstanceError, RuntimeInstance};
pub use error::VmError;
pub use gas_schedule::{GasSchedule, GasScheduleMap};
pub use host::{DestCallOutcome, VmHost, DCDT_NFT_TRANSFER_FUNCTION_NAME, DCDT_TRANSFER_FUNCTION_NAME};
pub use state_stack::StateStack;
pub use vmhooks::{BigIntHandle, HookResult, VmHooks};
pub use wasm_validation::WasmCodeVerifier;
