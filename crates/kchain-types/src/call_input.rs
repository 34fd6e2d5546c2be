use crate::address::Address;
use crate::code_metadata::CodeMetadata;
use crate::error::TypesError;
use num_bigint::BigInt;
use num_traits::Zero;
use std::fmt;

/// How a call reached the contract.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CallType {
    #[default]
    DirectCall,
    AsynchronousCall,
    AsynchronousCallBack,
    DcdtTransferAndExecute,
}

impl TryFrom<u8> for CallType {
    type Error = TypesError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(CallType::DirectCall),
            1 => Ok(CallType::AsynchronousCall),
            2 => Ok(CallType::AsynchronousCallBack),
            3 => Ok(CallType::DcdtTransferAndExecute),
            other => Err(TypesError::UnknownCallType(other)),
        }
    }
}

impl From<CallType> for u8 {
    fn from(value: CallType) -> Self {
        match value {
            CallType::DirectCall => 0,
            CallType::AsynchronousCall => 1,
            CallType::AsynchronousCallBack => 2,
            CallType::DcdtTransferAndExecute => 3,
        }
    }
}

impl fmt::Display for CallType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CallType::DirectCall => "DirectCall",
            CallType::AsynchronousCall => "AsynchronousCall",
            CallType::AsynchronousCallBack => "AsynchronousCallBack",
            CallType::DcdtTransferAndExecute => "DCDTTransferAndExecute",
        };
        f.write_str(name)
    }
}

/// Kind of token moved by a DCDT transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DcdtTokenType {
    #[default]
    Fungible,
    NonFungible,
}

/// Token payment attached to a call.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DcdtTransfer {
    pub token_name: Vec<u8>,
    pub value: BigInt,
    pub nonce: u64,
    pub token_type: DcdtTokenType,
}

/// Fields shared by every kind of VM input.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct VmInput {
    pub caller: Address,
    pub arguments: Vec<Vec<u8>>,
    pub call_value: BigInt,
    pub call_type: CallType,
    pub gas_price: u64,
    pub gas_provided: u64,
    /// Gas reserved for the callback of an asynchronous call
    pub gas_locked: u64,
    pub original_tx_hash: Vec<u8>,
    pub current_tx_hash: Vec<u8>,
    pub prev_tx_hash: Vec<u8>,
    pub dcdt_transfers: Vec<DcdtTransfer>,
}

impl VmInput {
    pub fn has_value(&self) -> bool {
        !self.call_value.is_zero()
    }
}

/// A call to an exported function of a deployed contract.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CallInput {
    pub vm_input: VmInput,
    pub recipient: Address,
    pub function: String,
    pub allow_init_function: bool,
}

impl CallInput {
    pub fn new(caller: Address, recipient: Address, function: impl Into<String>, gas_provided: u64) -> Self {
        Self {
            vm_input: VmInput {
                caller,
                gas_provided,
                ..Default::default()
            },
            recipient,
            function: function.into(),
            allow_init_function: false,
        }
    }

    pub fn with_arguments(mut self, arguments: Vec<Vec<u8>>) -> Self {
        self.vm_input.arguments = arguments;
        self
    }

    pub fn with_value(mut self, value: impl Into<BigInt>) -> Self {
        self.vm_input.call_value = value.into();
        self
    }

    pub fn with_call_type(mut self, call_type: CallType) -> Self {
        self.vm_input.call_type = call_type;
        self
    }

    pub fn with_gas_locked(mut self, gas_locked: u64) -> Self {
        self.vm_input.gas_locked = gas_locked;
        self
    }

    pub fn with_tx_hashes(mut self, original: Vec<u8>, current: Vec<u8>) -> Self {
        self.vm_input.original_tx_hash = original;
        self.vm_input.current_tx_hash = current;
        self
    }

    pub fn allowing_init(mut self) -> Self {
        self.allow_init_function = true;
        self
    }

    pub fn caller(&self) -> &Address {
        &self.vm_input.caller
    }

    pub fn gas_provided(&self) -> u64 {
        self.vm_input.gas_provided
    }
}

/// A deployment of new contract code.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ContractCreateInput {
    pub vm_input: VmInput,
    pub contract_code: Vec<u8>,
    pub code_metadata: CodeMetadata,
}

impl ContractCreateInput {
    pub fn new(caller: Address, contract_code: Vec<u8>, gas_provided: u64) -> Self {
        Self {
            vm_input: VmInput {
                caller,
                gas_provided,
                ..Default::default()
            },
            contract_code,
            code_metadata: CodeMetadata::default(),
        }
    }

    pub fn with_metadata(mut self, code_metadata: CodeMetadata) -> Self {
        self.code_metadata = code_metadata;
        self
    }

    pub fn with_arguments(mut self, arguments: Vec<Vec<u8>>) -> Self {
        self.vm_input.arguments = arguments;
        self
    }

    pub fn with_value(mut self, value: impl Into<BigInt>) -> Self {
        self.vm_input.call_value = value.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_type_codes() {
        for code in 0u8..4 {
            let call_type = CallType::try_from(code).unwrap();
            assert_eq!(u8::from(call_type), code);
        }
        assert_eq!(CallType::try_from(9), Err(TypesError::UnknownCallType(9)));
    }

    #[test]
    fn test_call_input_builder() {
        let caller = Address::from_bytes([1u8; 32]);
        let recipient = Address::from_bytes([2u8; 32]);
        let input = CallInput::new(caller, recipient, "transfer", 5_000)
            .with_value(12)
            .with_call_type(CallType::AsynchronousCall)
            .with_gas_locked(300);

        assert_eq!(input.caller(), &caller);
        assert_eq!(input.gas_provided(), 5_000);
        assert_eq!(input.vm_input.gas_locked, 300);
        assert!(input.vm_input.has_value());
        assert!(!input.allow_init_function);
    }
}
