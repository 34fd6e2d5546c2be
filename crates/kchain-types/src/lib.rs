//! K-Chain Types - data exchanged between the VM host and its embedder.
//!
//! This crate provides:
//! - Addresses (32-byte, Bech32m encoded, shard-aware)
//! - Call inputs for calls and deployments
//! - VM outputs: output accounts, transfers, logs and return codes
//! - Code metadata and world account records

pub mod account;
pub mod address;
pub mod call_input;
pub mod code_metadata;
pub mod error;
pub mod vm_output;

mod serialization;

pub use account::UserAccount;
pub use address::Address;
pub use call_input::{CallInput, CallType, ContractCreateInput, DcdtTokenType, DcdtTransfer, VmInput};
pub use code_metadata::CodeMetadata;
pub use error::TypesError;
pub use vm_output::{LogEntry, OutputAccount, OutputTransfer, ReturnCode, StorageUpdate, VmOutput};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        Address, CallInput, CallType, CodeMetadata, ContractCreateInput, DcdtTransfer, OutputAccount,
        OutputTransfer, ReturnCode, UserAccount, VmInput, VmOutput,
    };
}
