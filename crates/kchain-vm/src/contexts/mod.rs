//! Execution contexts of the host.
//!
//! Each context owns one concern of the running call tree and keeps its own
//! snapshot stack (see [`crate::state_stack::StateStack`]).

pub mod big_int;
pub mod blockchain;
pub mod metering;
pub mod output;
pub mod runtime;
pub mod storage;

pub use big_int::BigIntContext;
pub use blockchain::BlockchainContext;
pub use metering::{ContractGasState, ExecutionFrame, MeteringContext};
pub use output::{CodeDeployInput, OutputContext};
pub use runtime::{AsyncCallInfo, AsyncContextInfo, AsyncGeneratedCall, Breakpoint, RuntimeContext};
pub use storage::{StorageContext, StorageStatus, StorageWrite};
