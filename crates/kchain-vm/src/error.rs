use kchain_types::ReturnCode;
use thiserror::Error;

/// Errors that can occur while executing a call tree.
///
/// All of them except the infrastructure ones are turned into an error
/// [`kchain_types::VmOutput`] at the call-frame boundary.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum VmError {
    #[error("not enough gas")]
    NotEnoughGas,

    #[error("contract not found")]
    ContractNotFound,

    #[error("contract invalid")]
    ContractInvalid,

    #[error("execution failed")]
    ExecutionFailed,

    #[error("{0}")]
    SignalError(String),

    #[error("function not found: {0}")]
    FuncNotFound(String),

    #[error("callback function not found")]
    NilCallbackFunction,

    #[error("it is not allowed to call init in run")]
    InitFuncCalledInRun,

    #[error("it is not allowed to call callBack outside of an async callback")]
    CallBackFuncCalledInRun,

    #[error("invalid upgrade arguments")]
    InvalidUpgradeArguments,

    #[error("upgrade not allowed")]
    UpgradeNotAllowed,

    #[error("contract account not found")]
    NilContract,

    #[error("deployment over existing account")]
    DeploymentOverExistingAccount,

    #[error("operation not permitted in read only mode")]
    InvalidCallOnReadOnlyMode,

    #[error("calling built-in function on the same context is disallowed")]
    BuiltinCallOnSameContextDisallowed,

    #[error("synchronous execution only possible within the same shard")]
    SyncExecutionNotInSameShard,

    #[error("maximum instances reached")]
    MaxInstancesReached,

    #[error("return code is not ok")]
    ReturnCodeNotOk,

    #[error("{message}")]
    BuiltinFailed { code: ReturnCode, message: String },

    #[error("transfer of negative value")]
    TransferNegativeValue,

    #[error("insufficient funds for transfer")]
    TransferInsufficientFunds,

    #[error("sending value to non payable contract")]
    AccountNotPayable,

    #[error("cannot write to storage under reserved key")]
    StoreReservedKey,

    #[error("argument index out of range")]
    ArgOutOfRange,

    #[error("value transfer not allowed on DCDT call")]
    TransferValueOnDcdtCall,

    #[error("failed transfer")]
    FailedTransfer,

    #[error("no async call info")]
    NilAsyncCallInfo,

    #[error("unknown async context: {0}")]
    AsyncContextDoesNotExist(String),

    #[error("unhandled runtime breakpoint")]
    UnhandledBreakpoint,

    #[error("invalid call data: {0}")]
    InvalidCallData(String),

    #[error("trap: {0}")]
    Trap(String),

    #[error("blockchain hook error: {0}")]
    BlockchainHook(String),

    #[error("invalid gas schedule: {0}")]
    GasSchedule(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("bytecode engine failure: {0}")]
    Engine(String),

    #[error("state stack of the {0} context is not empty")]
    StateStackImbalance(&'static str),
}

impl VmError {
    /// Return code reported for a call that failed with this error.
    pub fn return_code(&self) -> ReturnCode {
        match self {
            VmError::NotEnoughGas => ReturnCode::OutOfGas,
            VmError::ContractNotFound | VmError::NilContract => ReturnCode::ContractNotFound,
            VmError::ContractInvalid => ReturnCode::ContractInvalid,
            VmError::FuncNotFound(_) => ReturnCode::FunctionNotFound,
            VmError::SignalError(_)
            | VmError::InitFuncCalledInRun
            | VmError::CallBackFuncCalledInRun
            | VmError::InvalidCallOnReadOnlyMode => ReturnCode::UserError,
            VmError::InvalidUpgradeArguments | VmError::UpgradeNotAllowed => ReturnCode::UpgradeFailed,
            VmError::DeploymentOverExistingAccount => ReturnCode::AccountCollision,
            VmError::TransferInsufficientFunds => ReturnCode::OutOfFunds,
            VmError::MaxInstancesReached => ReturnCode::CallStackOverFlow,
            VmError::BuiltinFailed { code, .. } => *code,
            _ => ReturnCode::ExecutionFailed,
        }
    }

    /// Failures of the host itself rather than of the executed contracts.
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, VmError::Engine(_) | VmError::StateStackImbalance(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(VmError::NotEnoughGas.to_string(), "not enough gas");
        assert_eq!(VmError::SignalError("bad input".into()).to_string(), "bad input");
        let builtin = VmError::BuiltinFailed {
            code: ReturnCode::UserError,
            message: "whatdidyoudo".into(),
        };
        assert_eq!(builtin.to_string(), "whatdidyoudo");
    }

    #[test]
    fn test_return_codes() {
        assert_eq!(VmError::NotEnoughGas.return_code(), ReturnCode::OutOfGas);
        assert_eq!(VmError::ContractNotFound.return_code(), ReturnCode::ContractNotFound);
        assert_eq!(VmError::InitFuncCalledInRun.return_code(), ReturnCode::UserError);
        assert_eq!(VmError::ReturnCodeNotOk.return_code(), ReturnCode::ExecutionFailed);
        assert_eq!(
            VmError::BuiltinFailed {
                code: ReturnCode::OutOfFunds,
                message: String::new()
            }
            .return_code(),
            ReturnCode::OutOfFunds
        );
    }

    #[test]
    fn test_infrastructure_errors() {
        assert!(VmError::Engine("boom".into()).is_infrastructure());
        assert!(VmError::StateStackImbalance("output").is_infrastructure());
        assert!(!VmError::ExecutionFailed.is_infrastructure());
    }
}
