//! Protocol built-in functions and DCDT token transfers.
//!
//! Built-ins run in the world hook. A DCDT transfer to a contract in the
//! same shard may carry a function call, executed right after the transfer
//! and rolled back together with it.

use super::VmHost;
use crate::call_args::{encode_call_data, parse_call_data};
use crate::contexts::ExecutionFrame;
use crate::error::VmError;
use kchain_types::{
    Address, CallInput, CallType, DcdtTokenType, DcdtTransfer, OutputTransfer, ReturnCode, VmInput, VmOutput,
};
use num_bigint::{BigInt, Sign};
use num_traits::Zero;

pub const DCDT_TRANSFER_FUNCTION_NAME: &str = "DCDTTransfer";
pub const DCDT_NFT_TRANSFER_FUNCTION_NAME: &str = "DCDTNFTTransfer";

const DCDT_TRANSFER_MIN_ARGS: usize = 2;
const DCDT_NFT_TRANSFER_MIN_ARGS: usize = 4;

pub(crate) fn is_dcdt_transfer(function: &str) -> bool {
    function == DCDT_TRANSFER_FUNCTION_NAME || function == DCDT_NFT_TRANSFER_FUNCTION_NAME
}

fn unsigned_bytes(value: &BigInt) -> Vec<u8> {
    if value.is_zero() {
        return Vec::new();
    }
    value.magnitude().to_bytes_be()
}

fn nonce_bytes(nonce: u64) -> Vec<u8> {
    let bytes = nonce.to_be_bytes();
    let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    bytes[start..].to_vec()
}

fn nonce_from_bytes(bytes: &[u8]) -> u64 {
    bytes.iter().rev().take(8).rev().fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
}

/// Token payments carried by the arguments of a DCDT transfer.
pub(crate) fn dcdt_transfers_from_arguments(function: &str, arguments: &[Vec<u8>]) -> Vec<DcdtTransfer> {
    match function {
        DCDT_TRANSFER_FUNCTION_NAME if arguments.len() >= DCDT_TRANSFER_MIN_ARGS => vec![DcdtTransfer {
            token_name: arguments[0].clone(),
            value: BigInt::from_bytes_be(Sign::Plus, &arguments[1]),
            nonce: 0,
            token_type: DcdtTokenType::Fungible,
        }],
        DCDT_NFT_TRANSFER_FUNCTION_NAME if arguments.len() >= DCDT_NFT_TRANSFER_MIN_ARGS => vec![DcdtTransfer {
            token_name: arguments[0].clone(),
            value: BigInt::from_bytes_be(Sign::Plus, &arguments[2]),
            nonce: nonce_from_bytes(&arguments[1]),
            token_type: DcdtTokenType::NonFungible,
        }],
        _ => Vec::new(),
    }
}

impl VmHost {
    /// Run a built-in function as the current frame, followed by the
    /// contract call it carries, if any.
    pub(crate) fn execute_builtin_function(&mut self, input: &CallInput) -> Result<(), VmError> {
        tracing::debug!(function = %input.function, caller = %input.vm_input.caller, "execute built-in function");

        let (vm_output, follow_up) = self.call_builtin_function(input)?;
        let gas_consumed = input.vm_input.gas_provided.saturating_sub(vm_output.gas_remaining);
        self.use_gas(gas_consumed);
        self.output.add_to_active_state(vm_output);

        let Some(mut follow_up) = follow_up else {
            return Ok(());
        };
        follow_up.vm_input.gas_provided = self
            .metering
            .bound_gas_limit(&self.runtime, follow_up.vm_input.gas_provided);
        let outcome = self.execute_on_dest_context(follow_up);
        if let Err(err) = outcome.result {
            self.revert_dcdt_transfer(input)?;
            return Err(err);
        }
        Ok(())
    }

    /// Process a built-in in the world. Returns its output and the call to
    /// execute after it.
    pub(crate) fn call_builtin_function(
        &mut self,
        input: &CallInput,
    ) -> Result<(VmOutput, Option<CallInput>), VmError> {
        let mut vm_output = self
            .blockchain
            .hook()
            .process_builtin_function(input)
            .map_err(|e| VmError::BuiltinFailed {
                code: ReturnCode::ExecutionFailed,
                message: e.to_string(),
            })?;
        if !vm_output.is_ok() {
            return Err(VmError::BuiltinFailed {
                code: vm_output.return_code,
                message: vm_output.return_message,
            });
        }

        let follow_up = self.sc_execution_after_builtin(input, &vm_output)?;
        if let Some(next) = &follow_up {
            // Executed here instead of being dispatched by the protocol
            if let Some(account) = vm_output.output_accounts.get_mut(&next.recipient) {
                account.output_transfers.clear();
            }
        }
        self.add_dcdt_transfer_to_vm_output_sc_intra_shard_call(input, &mut vm_output);
        Ok((vm_output, follow_up))
    }

    /// The contract call requested by a DCDT transfer, when it can run in
    /// this shard.
    fn sc_execution_after_builtin(
        &self,
        input: &CallInput,
        vm_output: &VmOutput,
    ) -> Result<Option<CallInput>, VmError> {
        if !is_dcdt_transfer(&input.function) || !self.metering.flags().dcdt_functions_enabled {
            return Ok(None);
        }
        let receiver = match self.dcdt_receiver(input) {
            Some(receiver) => receiver,
            None => return Ok(None),
        };
        if !self.blockchain.is_smart_contract(&receiver)
            || !self.blockchain.in_same_shard(&input.vm_input.caller, &receiver)
        {
            return Ok(None);
        }

        let transfers = match vm_output.account(&receiver) {
            Some(account) => &account.output_transfers,
            None => return Ok(None),
        };
        let [call] = transfers.as_slice() else {
            return Ok(None);
        };

        let (function, arguments) = parse_call_data(&call.data)?;
        let sender = if input.function == DCDT_NFT_TRANSFER_FUNCTION_NAME {
            input.recipient
        } else {
            input.vm_input.caller
        };
        let mut next = CallInput {
            vm_input: VmInput {
                caller: sender,
                arguments,
                call_value: BigInt::zero(),
                call_type: CallType::DcdtTransferAndExecute,
                gas_price: input.vm_input.gas_price,
                gas_provided: call.gas_limit,
                gas_locked: input.vm_input.gas_locked,
                dcdt_transfers: dcdt_transfers_from_arguments(&input.function, &input.vm_input.arguments),
                ..Default::default()
            },
            recipient: receiver,
            function,
            allow_init_function: false,
        };
        self.inherit_tx_hashes(&mut next);
        Ok(Some(next))
    }

    /// Receiver of the tokens moved by a DCDT transfer.
    fn dcdt_receiver(&self, input: &CallInput) -> Option<Address> {
        if input.function == DCDT_NFT_TRANSFER_FUNCTION_NAME {
            let argument = input.vm_input.arguments.get(3)?;
            return Address::from_slice(argument).ok();
        }
        Some(input.recipient)
    }

    /// A DCDT transfer to a contract of this shard is recorded as an output
    /// transfer, so it shows up in the transaction's results.
    fn add_dcdt_transfer_to_vm_output_sc_intra_shard_call(&self, input: &CallInput, vm_output: &mut VmOutput) {
        if !vm_output.is_ok() || !is_dcdt_transfer(&input.function) {
            return;
        }
        let Some(receiver) = self.dcdt_receiver(input) else {
            return;
        };
        if !self.blockchain.is_smart_contract(&receiver)
            || !self.blockchain.in_same_shard(&input.vm_input.caller, &receiver)
        {
            return;
        }

        let data = encode_call_data(&input.function, &input.vm_input.arguments);
        vm_output
            .output_accounts
            .entry(receiver)
            .or_insert_with(|| kchain_types::OutputAccount::new(receiver))
            .output_transfers
            .push(OutputTransfer {
                value: BigInt::zero(),
                gas_limit: 0,
                gas_locked: 0,
                data,
                call_type: input.vm_input.call_type,
                sender: input.vm_input.caller,
            });
    }

    /// Send the tokens of a failed DCDT transfer back to their sender.
    pub(crate) fn revert_dcdt_transfer(&mut self, input: &CallInput) -> Result<(), VmError> {
        if !is_dcdt_transfer(&input.function) || input.vm_input.call_type == CallType::AsynchronousCallBack {
            return Ok(());
        }
        let Some(receiver) = self.dcdt_receiver(input) else {
            return Ok(());
        };
        let min_args = if input.function == DCDT_NFT_TRANSFER_FUNCTION_NAME {
            DCDT_NFT_TRANSFER_MIN_ARGS
        } else {
            DCDT_TRANSFER_MIN_ARGS
        };
        if input.vm_input.arguments.len() < min_args {
            return Ok(());
        }
        tracing::debug!(function = %input.function, receiver = %receiver, "reverting DCDT transfer");

        let mut arguments = input.vm_input.arguments.clone();
        let (caller, recipient) = if input.function == DCDT_NFT_TRANSFER_FUNCTION_NAME {
            arguments[3] = input.vm_input.caller.as_bytes().to_vec();
            (receiver, receiver)
        } else {
            (receiver, input.vm_input.caller)
        };
        let mut revert_input = CallInput {
            vm_input: VmInput {
                caller,
                arguments,
                call_value: BigInt::zero(),
                call_type: CallType::AsynchronousCallBack,
                gas_price: input.vm_input.gas_price,
                gas_provided: self.metering.block_gas_limit(),
                ..Default::default()
            },
            recipient,
            function: input.function.clone(),
            allow_init_function: false,
        };
        self.inherit_tx_hashes(&mut revert_input);

        let result = match self.blockchain.hook().process_builtin_function(&revert_input) {
            Ok(output) if output.is_ok() => Ok(()),
            Ok(output) => Err(VmError::BuiltinFailed {
                code: output.return_code,
                message: output.return_message,
            }),
            Err(e) => Err(VmError::BlockchainHook(e.to_string())),
        };
        if let Err(err) = &result {
            tracing::error!(error = %err, "DCDT revert failed");
            self.use_all_gas_left();
            self.fail_execution(Some(err));
        }
        result
    }

    /// Built-in call moving tokens from `sender` to `destination`, with all
    /// the gas left.
    pub(crate) fn dcdt_transfer_input(
        &self,
        destination: &Address,
        sender: &Address,
        token_id: &[u8],
        nonce: u64,
        value: &BigInt,
        call_type: CallType,
    ) -> CallInput {
        let (function, recipient, arguments) = if nonce > 0 {
            (
                DCDT_NFT_TRANSFER_FUNCTION_NAME,
                *sender,
                vec![
                    token_id.to_vec(),
                    nonce_bytes(nonce),
                    unsigned_bytes(value),
                    destination.as_bytes().to_vec(),
                ],
            )
        } else {
            (
                DCDT_TRANSFER_FUNCTION_NAME,
                *destination,
                vec![token_id.to_vec(), unsigned_bytes(value)],
            )
        };
        let mut input = CallInput {
            vm_input: VmInput {
                caller: *sender,
                arguments,
                call_value: BigInt::zero(),
                call_type,
                gas_price: self.runtime.vm_input().gas_price,
                gas_provided: self.gas_left(),
                ..Default::default()
            },
            recipient,
            function: function.to_string(),
            allow_init_function: false,
        };
        self.inherit_tx_hashes(&mut input);
        input
    }

    /// Move tokens out of the current contract through the world's
    /// built-in. Returns the output and the gas the built-in consumed.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn execute_dcdt_transfer(
        &mut self,
        destination: &Address,
        sender: &Address,
        token_id: &[u8],
        nonce: u64,
        value: &BigInt,
        call_type: CallType,
    ) -> Result<(VmOutput, u64), VmError> {
        if value.sign() == Sign::Minus {
            return Err(VmError::TransferNegativeValue);
        }

        let input = self.dcdt_transfer_input(destination, sender, token_id, nonce, value, call_type);
        let vm_output = self
            .blockchain
            .hook()
            .process_builtin_function(&input)
            .map_err(|e| VmError::BlockchainHook(e.to_string()))?;
        if !vm_output.is_ok() {
            return Err(VmError::BuiltinFailed {
                code: vm_output.return_code,
                message: vm_output.return_message,
            });
        }

        let gas_consumed = input.vm_input.gas_provided.saturating_sub(vm_output.gas_remaining);
        if call_type != CallType::AsynchronousCallBack {
            self.use_gas(gas_consumed);
        }
        tracing::trace!(token = %String::from_utf8_lossy(token_id), gas_consumed, "DCDT transfer");
        Ok((vm_output, gas_consumed))
    }

    /// Transfer tokens from the current contract to `destination`.
    ///
    /// When the destination is a contract of another shard, or no call is
    /// attached, the transfer is recorded for the protocol to deliver,
    /// carrying the gas of the attached call. Returns the gas available for
    /// the attached call.
    pub(crate) fn transfer_dcdt(
        &mut self,
        destination: &Address,
        token_id: &[u8],
        nonce: u64,
        value: &BigInt,
        call: Option<&CallInput>,
    ) -> Result<u64, VmError> {
        let sender = *self.runtime.sc_address();
        let is_execution = call.is_some() && self.blockchain.is_smart_contract(destination);
        let call_type = if is_execution {
            CallType::DcdtTransferAndExecute
        } else {
            CallType::DirectCall
        };
        let (mut builtin_output, _) =
            self.execute_dcdt_transfer(destination, &sender, token_id, nonce, value, call_type)?;
        // The transfer itself is recorded below; built-in side effects stay
        for account in builtin_output.output_accounts.values_mut() {
            account.output_transfers.clear();
        }
        self.output.add_to_active_state(builtin_output);

        let gas_limit = call
            .map(|c| self.metering.bound_gas_limit(&self.runtime, c.vm_input.gas_provided))
            .unwrap_or(0);
        if is_execution && self.blockchain.in_same_shard(&sender, destination) {
            return Ok(gas_limit);
        }

        let (function, mut arguments) = if nonce > 0 {
            (
                DCDT_NFT_TRANSFER_FUNCTION_NAME,
                vec![
                    token_id.to_vec(),
                    nonce_bytes(nonce),
                    unsigned_bytes(value),
                    destination.as_bytes().to_vec(),
                ],
            )
        } else {
            (DCDT_TRANSFER_FUNCTION_NAME, vec![token_id.to_vec(), unsigned_bytes(value)])
        };
        if let Some(call) = call {
            arguments.push(call.function.as_bytes().to_vec());
            arguments.extend(call.vm_input.arguments.iter().cloned());
        }

        self.output
            .output_account_mut(destination)
            .output_transfers
            .push(OutputTransfer {
                value: BigInt::zero(),
                gas_limit,
                gas_locked: 0,
                data: encode_call_data(function, &arguments),
                call_type,
                sender,
            });
        self.use_gas(gas_limit);
        self.forward_gas(None, gas_limit);
        Ok(gas_limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dcdt_transfers_from_arguments() {
        let fungible = dcdt_transfers_from_arguments(DCDT_TRANSFER_FUNCTION_NAME, &[b"TKN".to_vec(), vec![0x01, 0x00]]);
        assert_eq!(fungible.len(), 1);
        assert_eq!(fungible[0].value, BigInt::from(256));
        assert_eq!(fungible[0].token_type, DcdtTokenType::Fungible);

        let nft = dcdt_transfers_from_arguments(
            DCDT_NFT_TRANSFER_FUNCTION_NAME,
            &[b"NFT".to_vec(), vec![0x02], vec![0x01], vec![7u8; 32]],
        );
        assert_eq!(nft[0].nonce, 2);
        assert_eq!(nft[0].token_type, DcdtTokenType::NonFungible);

        assert!(dcdt_transfers_from_arguments(DCDT_TRANSFER_FUNCTION_NAME, &[b"TKN".to_vec()]).is_empty());
        assert!(dcdt_transfers_from_arguments("other", &[]).is_empty());
    }

    #[test]
    fn test_nonce_bytes_roundtrip() {
        assert!(nonce_bytes(0).is_empty());
        assert_eq!(nonce_bytes(0x0102), vec![0x01, 0x02]);
        assert_eq!(nonce_from_bytes(&nonce_bytes(u64::MAX)), u64::MAX);
        assert_eq!(unsigned_bytes(&BigInt::zero()), Vec::<u8>::new());
    }
}
