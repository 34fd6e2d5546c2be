//! Asynchronous calls and their callbacks.
//!
//! A call to a contract of the same shard runs right away, followed by the
//! caller's callback. Anything else leaves the shard as an output transfer;
//! the protocol delivers the callback in a later transaction.

use super::{DestCallOutcome, VmHost};
use crate::call_args::{even_hex, parse_call_data};
use crate::contexts::runtime::{AsyncCallStatus, AsyncGeneratedCall, CALLBACK_FUNCTION_NAME};
use crate::contexts::{AsyncCallInfo, AsyncContextInfo, Breakpoint, ExecutionFrame};
use crate::error::VmError;
use kchain_types::{Address, CallInput, CallType, ReturnCode, VmInput};
use num_bigint::BigInt;
use num_traits::Zero;

/// Where an asynchronous call gets executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AsyncCallExecutionMode {
    SyncExecution,
    BuiltinFuncIntraShard,
    BuiltinFuncCrossShard,
    AsyncUnknown,
}

const ASYNC_PENDING_KEY_SUFFIX: &[u8] = b"ASYNC";

fn return_code_bytes(code: ReturnCode) -> Vec<u8> {
    let bytes = code.as_u64().to_be_bytes();
    let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    bytes[start..].to_vec()
}

/// Arguments of a callback: the destination's return code, then its return
/// data on success or its error message on failure.
fn callback_arguments(outcome: &DestCallOutcome) -> Vec<Vec<u8>> {
    let mut arguments = vec![return_code_bytes(outcome.vm_output.return_code)];
    if outcome.is_ok() {
        arguments.extend(outcome.vm_output.return_data.iter().cloned());
    } else {
        arguments.push(outcome.vm_output.return_message.as_bytes().to_vec());
    }
    arguments
}

impl VmHost {
    /// Register the asynchronous call requested by the running contract and
    /// stop it. Gas left after locking the callback's share goes with the
    /// call, up to `gas_limit`.
    pub(crate) fn execute_async_call(
        &mut self,
        destination: &Address,
        value: &BigInt,
        data: &[u8],
        gas_limit: Option<u64>,
    ) -> Result<(), VmError> {
        self.metering.use_gas_for_async_step(&mut self.runtime)?;

        let lock_required =
            self.runtime.has_callback_method() || !self.metering.flags().dynamic_gas_locking_enabled;
        let gas_locked = if lock_required {
            self.metering.compute_gas_locked_for_async(&self.runtime)
        } else {
            0
        };
        self.metering.use_gas_bounded(&mut self.runtime, gas_locked)?;

        let gas_left = self.gas_left();
        let gas_limit = gas_limit.map_or(gas_left, |limit| limit.min(gas_left));
        tracing::debug!(destination = %destination, gas_limit, gas_locked, "async call");

        self.runtime.set_async_call_info(AsyncCallInfo {
            destination: *destination,
            data: data.to_vec(),
            gas_limit,
            gas_locked,
            value: value.clone(),
        });
        self.runtime.set_breakpoint(Breakpoint::AsyncCall);
        Ok(())
    }

    /// Carry out the asynchronous call that stopped the contract.
    pub(crate) fn handle_async_call_breakpoint(&mut self) -> Result<(), VmError> {
        self.runtime.set_breakpoint(Breakpoint::None);
        let info = self.runtime.async_call_info().cloned().ok_or(VmError::NilAsyncCallInfo)?;

        let mode = self.determine_async_call_execution_mode(&info)?;
        tracing::trace!(?mode, destination = %info.destination, "async call breakpoint");
        match mode {
            AsyncCallExecutionMode::AsyncUnknown => self.send_async_call_to_destination(&info),
            AsyncCallExecutionMode::BuiltinFuncCrossShard => self.execute_sync_destination_call(&info)?.result,
            AsyncCallExecutionMode::SyncExecution | AsyncCallExecutionMode::BuiltinFuncIntraShard => {
                let destination_outcome = self.execute_sync_destination_call(&info)?;
                let callback = self.execute_async_callback(
                    &info.destination,
                    CALLBACK_FUNCTION_NAME,
                    info.gas_locked,
                    &destination_outcome,
                );
                self.process_callback_vm_output(callback)
            }
        }
    }

    fn determine_async_call_execution_mode(&self, info: &AsyncCallInfo) -> Result<AsyncCallExecutionMode, VmError> {
        let (function, _) = parse_call_data(&info.data)?;
        let same_shard = self.blockchain.in_same_shard(self.runtime.sc_address(), &info.destination);

        if self.is_builtin_function_name(&function) {
            return Ok(if same_shard {
                AsyncCallExecutionMode::BuiltinFuncIntraShard
            } else {
                AsyncCallExecutionMode::BuiltinFuncCrossShard
            });
        }
        if same_shard && self.blockchain.get_code(&self.output, &info.destination).is_ok() {
            return Ok(AsyncCallExecutionMode::SyncExecution);
        }
        Ok(AsyncCallExecutionMode::AsyncUnknown)
    }

    #[allow(clippy::too_many_arguments)]
    fn async_call_input(
        &self,
        caller: Address,
        destination: Address,
        data: &[u8],
        value: BigInt,
        gas_provided: u64,
        gas_locked: u64,
        call_type: CallType,
    ) -> Result<CallInput, VmError> {
        let (function, arguments) = parse_call_data(data)?;
        let mut input = CallInput {
            vm_input: VmInput {
                caller,
                arguments,
                call_value: value,
                call_type,
                gas_price: self.runtime.vm_input().gas_price,
                gas_provided,
                gas_locked,
                ..Default::default()
            },
            recipient: destination,
            function,
            allow_init_function: false,
        };
        self.inherit_tx_hashes(&mut input);
        Ok(input)
    }

    fn execute_sync_destination_call(&mut self, info: &AsyncCallInfo) -> Result<DestCallOutcome, VmError> {
        let step = self.metering.gas_schedule().base_ops_api_cost.async_call_step;
        let gas_limit = self.metering.bound_gas_limit(&self.runtime, info.gas_limit);
        if gas_limit <= step {
            return Err(VmError::NotEnoughGas);
        }
        self.use_gas(step);

        let input = self.async_call_input(
            *self.runtime.sc_address(),
            info.destination,
            &info.data,
            info.value.clone(),
            gas_limit - step,
            info.gas_locked,
            CallType::AsynchronousCall,
        )?;
        Ok(self.execute_on_dest_context(input))
    }

    /// Run `function` on the current contract as the callback of a call to
    /// `destination`, with the gas the destination returned plus the gas
    /// locked for the callback.
    fn execute_async_callback(
        &mut self,
        destination: &Address,
        function: &str,
        gas_locked: u64,
        destination_outcome: &DestCallOutcome,
    ) -> Result<DestCallOutcome, VmError> {
        let arguments = callback_arguments(destination_outcome);
        let data_len: u64 = arguments.iter().map(|argument| argument.len() as u64).sum();
        let schedule = self.metering.gas_schedule();
        let cost = schedule
            .base_ops_api_cost
            .async_call_step
            .saturating_add(schedule.base_operation_cost.data_copy_per_byte.saturating_mul(data_len));

        let gas_limit = destination_outcome.vm_output.gas_remaining.saturating_add(gas_locked);
        if gas_limit <= cost {
            return Err(VmError::NotEnoughGas);
        }
        self.restore_gas(gas_locked);
        self.use_gas(cost);

        let mut input = CallInput {
            vm_input: VmInput {
                caller: *destination,
                arguments,
                call_value: BigInt::zero(),
                call_type: CallType::AsynchronousCallBack,
                gas_price: self.runtime.vm_input().gas_price,
                gas_provided: gas_limit - cost,
                ..Default::default()
            },
            recipient: *self.runtime.sc_address(),
            function: function.to_string(),
            allow_init_function: false,
        };
        self.inherit_tx_hashes(&mut input);
        tracing::trace!(function, gas = input.vm_input.gas_provided, "async callback");
        Ok(self.execute_on_dest_context(input))
    }

    /// A failed callback does not fail the caller; its error is reported in
    /// the caller's output.
    fn process_callback_vm_output(&mut self, callback: Result<DestCallOutcome, VmError>) -> Result<(), VmError> {
        let failed_output = match callback {
            Ok(outcome) if outcome.is_ok() => return Ok(()),
            Ok(outcome) => outcome.vm_output,
            Err(err) if err.is_infrastructure() => return Err(err),
            Err(err) => self.output.create_vm_output_in_case_of_error(&err),
        };
        tracing::debug!(
            return_code = %failed_output.return_code,
            message = %failed_output.return_message,
            "callback failed"
        );

        self.output.set_return_message(failed_output.return_message.clone());
        self.output.finish(failed_output.return_code.to_string().into_bytes());
        let tx_hash = self.runtime.current_tx_hash().to_vec();
        self.output.finish(tx_hash);
        Ok(())
    }

    fn send_async_call_to_destination(&mut self, info: &AsyncCallInfo) -> Result<(), VmError> {
        let sender = *self.runtime.sc_address();
        let result = self.output.transfer(
            self.blockchain.hook(),
            &info.destination,
            &sender,
            info.gas_limit,
            info.gas_locked,
            &info.value,
            info.data.clone(),
            CallType::AsynchronousCall,
        );
        if let Err(err) = result {
            self.use_all_gas_left();
            self.fail_execution(Some(&err));
            return Err(err);
        }

        self.use_gas(info.gas_limit);
        self.forward_gas(None, info.gas_limit.saturating_add(info.gas_locked));
        Ok(())
    }

    /// Register a call made through `createAsyncCall`.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn create_async_call(
        &mut self,
        identifier: &[u8],
        destination: &Address,
        value: &BigInt,
        data: &[u8],
        success_callback: &str,
        error_callback: &str,
        gas: u64,
    ) -> Result<(), VmError> {
        let call = AsyncGeneratedCall {
            status: AsyncCallStatus::Pending,
            destination: *destination,
            data: data.to_vec(),
            value: value.clone(),
            success_callback: success_callback.to_string(),
            error_callback: error_callback.to_string(),
            provided_gas: gas,
            gas_limit: 0,
            gas_locked: 0,
        };
        if !call.has_callbacks() {
            tracing::trace!(destination = %destination, "async call without callbacks");
        }
        self.runtime.add_async_context_call(identifier, call);
        Ok(())
    }

    /// Run or send out every call registered by the returning contract.
    /// Returns the calls left pending.
    pub(crate) fn process_async_info(&mut self) -> Result<AsyncContextInfo, VmError> {
        let mut info = self.runtime.take_async_context_info();
        let mut pending = AsyncContextInfo::new(info.caller);
        if info.is_empty() {
            return Ok(pending);
        }
        self.setup_async_calls_gas(&mut info)?;

        for (identifier, context) in info.contexts {
            let mut unresolved = Vec::new();
            for mut call in context.calls {
                if self.can_execute_synchronously(&call)? {
                    self.process_async_call(&mut call)?;
                } else {
                    unresolved.push(call);
                }
            }

            if !unresolved.is_empty() {
                pending.contexts.insert(
                    identifier,
                    crate::contexts::runtime::AsyncContext {
                        callback: context.callback,
                        calls: unresolved,
                    },
                );
            } else if !context.callback.is_empty() {
                self.execute_context_callback(&context.callback)?;
            }
        }

        if !pending.is_empty() {
            self.send_pending_async_calls(&pending)?;
        }
        Ok(pending)
    }

    /// Split the gas left among registered calls: explicit amounts first,
    /// the rest evenly among calls that asked for none.
    fn setup_async_calls_gas(&self, info: &mut AsyncContextInfo) -> Result<(), VmError> {
        let lock = self.metering.compute_gas_locked_for_async(&self.runtime);
        let mut gas_left = self.gas_left();
        let mut unspecified = 0u64;

        for call in info.contexts.values_mut().flat_map(|context| context.calls.iter_mut()) {
            let gas_locked = if call.has_callbacks() { lock } else { 0 };
            gas_left = gas_left.checked_sub(gas_locked).ok_or(VmError::NotEnoughGas)?;
            call.gas_locked = gas_locked;

            if call.provided_gas > 0 {
                gas_left = gas_left.checked_sub(call.provided_gas).ok_or(VmError::NotEnoughGas)?;
                call.gas_limit = call.provided_gas;
            } else {
                unspecified += 1;
            }
        }

        if unspecified > 0 {
            let share = gas_left / unspecified;
            for call in info.contexts.values_mut().flat_map(|context| context.calls.iter_mut()) {
                if call.provided_gas == 0 {
                    call.gas_limit = share;
                }
            }
        }
        Ok(())
    }

    fn can_execute_synchronously(&self, call: &AsyncGeneratedCall) -> Result<bool, VmError> {
        let (function, _) = parse_call_data(&call.data)?;
        if self.is_builtin_function_name(&function) {
            return Ok(false);
        }
        let same_shard = self.blockchain.in_same_shard(self.runtime.sc_address(), &call.destination);
        Ok(same_shard && self.blockchain.get_code(&self.output, &call.destination).is_ok())
    }

    fn process_async_call(&mut self, call: &mut AsyncGeneratedCall) -> Result<(), VmError> {
        self.use_gas(call.gas_locked);
        let input = self.async_call_input(
            *self.runtime.sc_address(),
            call.destination,
            &call.data,
            call.value.clone(),
            call.gas_limit,
            call.gas_locked,
            CallType::AsynchronousCall,
        )?;
        let destination_outcome = self.execute_on_dest_context(input);

        let callback = if destination_outcome.is_ok() {
            call.status = AsyncCallStatus::Resolved;
            call.success_callback.clone()
        } else {
            call.status = AsyncCallStatus::Rejected;
            call.error_callback.clone()
        };
        if callback.is_empty() {
            self.restore_gas(call.gas_locked);
            return Ok(());
        }

        let result = self.execute_async_callback(&call.destination, &callback, call.gas_locked, &destination_outcome);
        self.process_callback_vm_output(result)
    }

    /// Run the callback of an async context whose calls all completed.
    fn execute_context_callback(&mut self, callback: &str) -> Result<(), VmError> {
        let sc_address = *self.runtime.sc_address();
        let mut input = CallInput {
            vm_input: VmInput {
                caller: sc_address,
                gas_price: self.runtime.vm_input().gas_price,
                gas_provided: self.gas_left(),
                ..Default::default()
            },
            recipient: sc_address,
            function: callback.to_string(),
            allow_init_function: false,
        };
        self.inherit_tx_hashes(&mut input);
        let outcome = self.execute_on_dest_context(input);
        self.process_callback_vm_output(Ok(outcome))
    }

    /// Send out calls to other shards and count them, so that the last
    /// returning callback can be recognized.
    fn send_pending_async_calls(&mut self, pending: &AsyncContextInfo) -> Result<(), VmError> {
        let sender = *self.runtime.sc_address();
        for call in pending.contexts.values().flat_map(|context| context.calls.iter()) {
            self.output.transfer(
                self.blockchain.hook(),
                &call.destination,
                &sender,
                call.gas_limit,
                call.gas_locked,
                &call.value,
                call.data.clone(),
                CallType::AsynchronousCall,
            )?;
            let gas = call.gas_limit.saturating_add(call.gas_locked);
            self.use_gas(gas);
            self.forward_gas(None, gas);
        }

        let count = pending.call_count() as u64;
        let key = self.async_pending_key();
        let write = self.storage.set_protected_storage(
            &mut self.output,
            self.blockchain.hook(),
            &self.metering.gas_schedule().base_operation_cost,
            &key,
            &count.to_be_bytes(),
        );
        tracing::debug!(count, "async calls sent out of shard");
        self.use_gas(write.gas_used);
        Ok(())
    }

    fn async_pending_key(&self) -> Vec<u8> {
        let mut key = self.config.protected_key_prefix.as_bytes().to_vec();
        key.extend_from_slice(ASYNC_PENDING_KEY_SUFFIX);
        let tx_hash = if self.runtime.original_tx_hash().is_empty() {
            self.runtime.current_tx_hash()
        } else {
            self.runtime.original_tx_hash()
        };
        key.extend_from_slice(tx_hash);
        key
    }

    /// Count down the calls still pending for the current transaction.
    pub(crate) fn process_callback_stack(&mut self) -> Result<(), VmError> {
        let key = self.async_pending_key();
        let sc_address = *self.runtime.sc_address();
        let stored = self
            .storage
            .get_storage_unmetered(&self.output, self.blockchain.hook(), &sc_address, &key);
        if stored.is_empty() {
            return Ok(());
        }

        let remaining = stored
            .iter()
            .fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
            .saturating_sub(1);
        let value = if remaining == 0 {
            Vec::new()
        } else {
            remaining.to_be_bytes().to_vec()
        };
        let write = self.storage.set_protected_storage(
            &mut self.output,
            self.blockchain.hook(),
            &self.metering.gas_schedule().base_operation_cost,
            &key,
            &value,
        );
        tracing::trace!(remaining, "async callback processed");
        self.use_gas(write.gas_used);
        self.free_gas(write.gas_freed);
        Ok(())
    }

    /// Tell the caller of an asynchronous call how it ended, with the gas
    /// left for its callback.
    pub(crate) fn send_callback_to_current_caller(&mut self) -> Result<(), VmError> {
        let caller = self.runtime.vm_input().caller;
        let sender = *self.runtime.sc_address();

        let mut data = format!("@{}", even_hex(self.output.return_code().as_u64()));
        for item in self.output.return_data() {
            data.push('@');
            data.push_str(&hex::encode(item));
        }

        let gas = self.gas_left();
        let result = self.output.transfer(
            self.blockchain.hook(),
            &caller,
            &sender,
            gas,
            0,
            &BigInt::zero(),
            data.into_bytes(),
            CallType::AsynchronousCallBack,
        );
        if let Err(err) = result {
            self.fail_execution(Some(&err));
            return Err(err);
        }

        self.use_gas(gas);
        self.forward_gas(None, gas);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kchain_types::VmOutput;

    #[test]
    fn test_return_code_bytes() {
        assert!(return_code_bytes(ReturnCode::Ok).is_empty());
        assert_eq!(return_code_bytes(ReturnCode::ExecutionFailed), vec![10]);
    }

    #[test]
    fn test_callback_arguments() {
        let success = DestCallOutcome {
            vm_output: VmOutput {
                return_data: vec![b"one".to_vec(), b"two".to_vec()],
                ..Default::default()
            },
            result: Ok(()),
        };
        assert_eq!(
            callback_arguments(&success),
            vec![Vec::new(), b"one".to_vec(), b"two".to_vec()]
        );

        let failure = DestCallOutcome {
            vm_output: VmOutput::failure(ReturnCode::UserError, "denied"),
            result: Err(VmError::SignalError("denied".into())),
        };
        assert_eq!(callback_arguments(&failure), vec![vec![4], b"denied".to_vec()]);
    }
}
