//! Top-level entry points and nested call orchestration.

use super::{DestCallOutcome, VmHost};
use crate::contexts::runtime::{CALLBACK_FUNCTION_NAME, INIT_FUNCTION_NAME, UPGRADE_FUNCTION_NAME};
use crate::contexts::{Breakpoint, CodeDeployInput, ExecutionFrame};
use crate::engine::InstanceError;
use crate::error::VmError;
use crate::state_stack::StateStack;
use kchain_types::{Address, CallInput, CallType, ContractCreateInput, VmOutput};
use num_traits::Zero;

impl VmHost {
    /// Deploy new contract code and run its `init`.
    pub fn run_smart_contract_create(&mut self, input: &ContractCreateInput) -> Result<VmOutput, VmError> {
        let span = self.span.clone();
        let _enter = span.enter();
        tracing::debug!(
            caller = %input.vm_input.caller,
            code_len = input.contract_code.len(),
            gas = input.vm_input.gas_provided,
            "run smart contract create"
        );

        self.init_state();
        let result = self.do_run_smart_contract_create(input);
        self.conclude(result)
    }

    /// Call a function of a deployed contract.
    pub fn run_smart_contract_call(&mut self, input: &CallInput) -> Result<VmOutput, VmError> {
        let span = self.span.clone();
        let _enter = span.enter();
        tracing::debug!(
            caller = %input.vm_input.caller,
            recipient = %input.recipient,
            function = %input.function,
            call_type = %input.vm_input.call_type,
            gas = input.vm_input.gas_provided,
            "run smart contract call"
        );

        self.init_state();
        let result = self.do_run_smart_contract_call(input);
        self.conclude(result)
    }

    /// Replace the code of a contract. The first two arguments carry the
    /// new code and its metadata; the rest go to the new `init`.
    pub fn run_smart_contract_upgrade(&mut self, input: &CallInput) -> Result<VmOutput, VmError> {
        let span = self.span.clone();
        let _enter = span.enter();
        tracing::debug!(caller = %input.vm_input.caller, recipient = %input.recipient, "run smart contract upgrade");

        self.init_state();
        let result = self.do_run_smart_contract_upgrade(input);
        self.conclude(result)
    }

    /// Turn a contract failure into an error output. Host failures and
    /// unbalanced context stacks are errors of the call itself.
    fn conclude(&mut self, result: Result<VmOutput, VmError>) -> Result<VmOutput, VmError> {
        let outcome = match result {
            Ok(output) => Ok(output),
            Err(err) if err.is_infrastructure() => {
                tracing::error!(error = %err, "host failure");
                Err(err)
            }
            Err(err) => {
                tracing::debug!(error = %err, "call failed");
                Ok(self.output.create_vm_output_in_case_of_error(&err))
            }
        };
        self.runtime.clean_instance();
        self.check_state_stacks()?;

        if let Ok(output) = &outcome {
            tracing::debug!(
                return_code = %output.return_code,
                gas_remaining = output.gas_remaining,
                "call concluded"
            );
        }
        outcome
    }

    fn do_run_smart_contract_create(&mut self, input: &ContractCreateInput) -> Result<VmOutput, VmError> {
        let caller = input.vm_input.caller;
        let address = self.blockchain.new_address(&mut self.output, &caller)?;

        self.runtime.set_vm_input(input.vm_input.clone());
        self.runtime.set_sc_address(address);
        self.runtime.set_custom_call_function(INIT_FUNCTION_NAME);
        self.metering.init_state_from_input(self.runtime.vm_input_mut());
        self.output.add_tx_value_to_account(&address, &input.vm_input.call_value);
        self.storage.set_address(address);

        self.perform_code_deployment(CodeDeployInput {
            contract_code: input.contract_code.clone(),
            code_metadata: input.code_metadata,
            address,
            deployer: caller,
        })
    }

    fn do_run_smart_contract_upgrade(&mut self, input: &CallInput) -> Result<VmOutput, VmError> {
        self.bind_call_input(input);
        self.runtime.set_custom_call_function(INIT_FUNCTION_NAME);

        let (contract_code, code_metadata) = self.runtime.extract_code_upgrade_from_args()?;
        self.check_upgrade_permission(&input.recipient, &input.vm_input.caller)?;

        self.perform_code_deployment(CodeDeployInput {
            contract_code,
            code_metadata,
            address: input.recipient,
            deployer: input.vm_input.caller,
        })
    }

    fn do_run_smart_contract_call(&mut self, input: &CallInput) -> Result<VmOutput, VmError> {
        self.bind_call_input(input);
        self.check_gas_for_get_code(input)?;

        let code = self.blockchain.get_code(&self.output, &input.recipient)?;
        self.metering.deduct_initial_gas_for_execution(&code)?;
        let gas_for_execution = self.metering.gas_for_execution();
        self.runtime.start_instance(&code, gas_for_execution, false)?;

        self.call_sc_method()?;
        Ok(self.get_vm_output())
    }

    fn check_gas_for_get_code(&self, input: &CallInput) -> Result<(), VmError> {
        if !self.metering.flags().vm_v2_enabled {
            return Ok(());
        }
        let get_code = self.metering.gas_schedule().base_operation_cost.get_code;
        if input.vm_input.gas_provided < get_code {
            return Err(VmError::NotEnoughGas);
        }
        Ok(())
    }

    /// Load `input` as the current frame.
    fn bind_call_input(&mut self, input: &CallInput) {
        self.runtime.init_state_from_call_input(input);
        self.metering.init_state_from_input(self.runtime.vm_input_mut());
        self.output.add_tx_value_to_account(&input.recipient, &input.vm_input.call_value);
        self.storage.set_address(input.recipient);
    }

    fn perform_code_deployment(&mut self, deploy: CodeDeployInput) -> Result<VmOutput, VmError> {
        tracing::trace!(address = %deploy.address, "code deployment");
        self.metering.deduct_initial_gas_for_direct_deployment(&deploy.contract_code)?;

        self.runtime.must_verify_next_contract_code();
        let gas_for_execution = self.metering.gas_for_execution();
        self.runtime.start_instance(&deploy.contract_code, gas_for_execution, true)?;

        self.call_init_function()?;
        self.output.deploy_code(&deploy);
        Ok(self.get_vm_output())
    }

    /// Only the owner may upgrade, and only an upgradeable contract.
    fn check_upgrade_permission(&self, contract: &Address, caller: &Address) -> Result<(), VmError> {
        let account = self
            .blockchain
            .hook()
            .get_user_account(contract)
            .map_err(|e| VmError::BlockchainHook(e.to_string()))?
            .ok_or(VmError::NilContract)?;

        if !account.code_metadata.upgradeable {
            return Err(VmError::UpgradeNotAllowed);
        }
        if account.owner.as_ref() != Some(caller) {
            return Err(VmError::UpgradeNotAllowed);
        }
        Ok(())
    }

    /// Run `init` if the new code exports one.
    fn call_init_function(&mut self) -> Result<(), VmError> {
        if !self.runtime.has_function(INIT_FUNCTION_NAME) {
            return Ok(());
        }
        let instance = self.runtime.instance()?;
        let result = instance.call_function(INIT_FUNCTION_NAME, self);
        self.handle_breakpoint_if_any(result)?;
        self.check_final_gas_after_exit()
    }

    fn verify_allowed_function_call(&self) -> Result<(), VmError> {
        let function = self.runtime.function();
        if function == INIT_FUNCTION_NAME {
            return Err(VmError::InitFuncCalledInRun);
        }
        if function == CALLBACK_FUNCTION_NAME && self.runtime.vm_input().call_type != CallType::AsynchronousCallBack {
            return Err(VmError::CallBackFuncCalledInRun);
        }
        Ok(())
    }

    /// Run the requested function of the current instance, then settle the
    /// asynchronous work it registered.
    fn call_sc_method(&mut self) -> Result<(), VmError> {
        self.verify_allowed_function_call()?;

        let call_type = self.runtime.vm_input().call_type;
        let function = match self.runtime.function_to_call() {
            Ok(function) => function,
            Err(VmError::NilCallbackFunction) if call_type == CallType::AsynchronousCallBack => {
                tracing::trace!("no callback exported");
                return self.process_callback_stack();
            }
            Err(err) => return Err(err),
        };

        let instance = self.runtime.instance()?;
        let result = instance.call_function(&function, self);
        self.handle_breakpoint_if_any(result)?;
        self.check_final_gas_after_exit()?;

        match call_type {
            CallType::AsynchronousCall => {
                let pending = self.process_async_info()?;
                if pending.is_empty() {
                    self.send_callback_to_current_caller()?;
                }
            }
            CallType::AsynchronousCallBack => {
                self.process_async_info()?;
                self.process_callback_stack()?;
            }
            CallType::DirectCall | CallType::DcdtTransferAndExecute => {
                self.process_async_info()?;
            }
        }
        Ok(())
    }

    /// Run the requested function of a nested frame. A missing `init` or
    /// `callBack` is not an error.
    fn call_sc_method_indirect(&mut self) -> Result<(), VmError> {
        let function = match self.runtime.function_to_call() {
            Ok(function) => function,
            Err(VmError::NilCallbackFunction) => return Ok(()),
            Err(VmError::FuncNotFound(name)) if name == INIT_FUNCTION_NAME => return Ok(()),
            Err(err) => return Err(err),
        };

        let instance = self.runtime.instance()?;
        let result = instance.call_function(&function, self);
        self.handle_breakpoint_if_any(result)
    }

    fn check_final_gas_after_exit(&self) -> Result<(), VmError> {
        if self.runtime.points_used() > self.metering.gas_for_execution() {
            return Err(VmError::NotEnoughGas);
        }
        Ok(())
    }

    /// Resolve why the engine returned.
    pub(crate) fn handle_breakpoint_if_any(&mut self, result: Result<(), InstanceError>) -> Result<(), VmError> {
        let breakpoint = self.runtime.breakpoint();
        match result {
            Ok(()) if breakpoint == Breakpoint::None => Ok(()),
            Ok(()) | Err(InstanceError::Breakpoint) => self.handle_breakpoint(breakpoint),
            Err(InstanceError::FunctionNotFound(name)) => Err(VmError::FuncNotFound(name)),
            Err(InstanceError::Trap(reason)) => {
                if self.metering.is_out_of_gas(&self.runtime) {
                    return Err(VmError::NotEnoughGas);
                }
                tracing::debug!(%reason, "contract trapped");
                Err(VmError::Trap(reason))
            }
        }
    }

    fn handle_breakpoint(&mut self, breakpoint: Breakpoint) -> Result<(), VmError> {
        match breakpoint {
            Breakpoint::AsyncCall => self.handle_async_call_breakpoint(),
            Breakpoint::ExecutionFailed => Err(VmError::ExecutionFailed),
            Breakpoint::SignalError => Err(VmError::SignalError(self.output.return_message().to_string())),
            Breakpoint::OutOfGas => Err(VmError::NotEnoughGas),
            Breakpoint::None => Err(VmError::UnhandledBreakpoint),
        }
    }

    /// Call another contract on its own context.
    ///
    /// The caller's contexts are saved first. On success the callee's output
    /// is merged into the caller's; on failure it is dropped and the callee's
    /// gas is lost.
    pub fn execute_on_dest_context(&mut self, mut input: CallInput) -> DestCallOutcome {
        tracing::debug!(
            caller = %input.vm_input.caller,
            recipient = %input.recipient,
            function = %input.function,
            gas = input.vm_input.gas_provided,
            "execute on dest context"
        );

        self.copy_tx_hashes_from_context(&mut input);
        self.big_int.push_state();
        self.big_int.init_state();
        self.output.push_state();
        self.output.censor_vm_output();
        self.storage.push_state();
        self.storage.set_address(input.recipient);
        self.enter_frame(&input);

        let result = self.execute(&input);
        self.finish_execute_on_dest_context(result)
    }

    fn finish_execute_on_dest_context(&mut self, result: Result<(), VmError>) -> DestCallOutcome {
        let (vm_output, result) = match result {
            Ok(()) => match self.check_final_gas_after_exit() {
                Ok(()) => (self.get_vm_output(), Ok(())),
                Err(err) => (self.output.create_vm_output_in_case_of_error(&err), Err(err)),
            },
            Err(err) => (self.output.create_vm_output_in_case_of_error(&err), Err(err)),
        };
        let child = *self.runtime.sc_address();
        let gas_remaining = vm_output.gas_remaining;
        // A failed frame reports nothing, so its gas stays with the caller
        let gas_spent = if result.is_ok() {
            self.metering.gas_provided().saturating_sub(gas_remaining)
        } else {
            0
        };

        self.big_int.pop_set_active_state();
        self.storage.pop_set_active_state();
        self.metering.pop_set_active_state();
        self.runtime.pop_set_active_state();
        if result.is_ok() {
            self.output.pop_merge_active_state();
        } else {
            self.output.pop_set_active_state();
        }

        self.restore_gas(gas_remaining);
        self.forward_gas(Some(&child), gas_spent);

        if let Err(err) = &result {
            tracing::debug!(callee = %child, error = %err, "dest context call failed");
        }
        DestCallOutcome { vm_output, result }
    }

    /// Call another contract's code on the caller's storage and output.
    pub fn execute_on_same_context(&mut self, mut input: CallInput) -> Result<(), VmError> {
        tracing::debug!(
            caller = %input.vm_input.caller,
            recipient = %input.recipient,
            function = %input.function,
            "execute on same context"
        );
        if self.is_builtin_function_name(&input.function) {
            return Err(VmError::BuiltinCallOnSameContextDisallowed);
        }

        self.copy_tx_hashes_from_context(&mut input);
        self.big_int.push_state();
        self.output.push_state();
        self.enter_frame(&input);

        let result = self.execute(&input);
        self.finish_execute_on_same_context(result)
    }

    fn finish_execute_on_same_context(&mut self, result: Result<(), VmError>) -> Result<(), VmError> {
        let result = result.and_then(|_| self.check_final_gas_after_exit());
        let child = *self.runtime.sc_address();
        let (gas_remaining, gas_spent) = match result {
            // The callee's gas is charged to its own account in the shared output
            Ok(()) => (self.get_vm_output().gas_remaining, self.metering.gas_spent_by_contract(&self.runtime)),
            Err(_) => (0, 0),
        };
        let async_info = self.runtime.take_async_context_info();

        self.metering.pop_set_active_state();
        self.runtime.pop_set_active_state();
        match &result {
            Ok(()) => {
                self.big_int.pop_discard();
                self.output.pop_discard();
                self.runtime.merge_async_context_info(async_info);
            }
            Err(_) => {
                self.big_int.pop_set_active_state();
                self.output.pop_set_active_state();
            }
        }

        self.restore_gas(gas_remaining);
        self.forward_gas(Some(&child), gas_spent);
        result
    }

    /// Start a frame for `input`. The caller pays the gas it provides up
    /// front; unused gas is restored when the frame ends.
    fn enter_frame(&mut self, input: &CallInput) {
        self.use_gas(input.vm_input.gas_provided);
        self.metering.push_state();
        self.runtime.push_state();
        self.runtime.detach_instance();
        self.runtime.init_state_from_call_input(input);
        self.metering.init_state_from_input(self.runtime.vm_input_mut());
    }

    /// Execute the call described by `input` in the current frame.
    fn execute(&mut self, input: &CallInput) -> Result<(), VmError> {
        if self.is_builtin_function_name(&input.function) {
            return self.execute_builtin_function(input);
        }

        if input.vm_input.call_type != CallType::AsynchronousCallBack || !input.vm_input.call_value.is_zero() {
            // Deployments may carry value into non-payable code
            let check_payable = input.function != INIT_FUNCTION_NAME;
            self.output.transfer_value_only(
                self.blockchain.hook(),
                &input.recipient,
                &input.vm_input.caller,
                &input.vm_input.call_value,
                check_payable,
            )?;
        }

        self.execute_smart_contract_call(input)
    }

    fn execute_smart_contract_call(&mut self, input: &CallInput) -> Result<(), VmError> {
        if input.function == INIT_FUNCTION_NAME && !input.allow_init_function {
            return Err(VmError::InitFuncCalledInRun);
        }

        if input.function == UPGRADE_FUNCTION_NAME {
            return self.execute_upgrade(input);
        }

        let code = self.blockchain.get_code(&self.output, &input.recipient)?;
        if self.runtime.is_verification_pending() {
            self.metering.deduct_initial_gas_for_indirect_deployment(&code)?;
        } else {
            self.metering.deduct_initial_gas_for_execution(&code)?;
        }
        let gas_for_execution = self.metering.gas_for_execution();
        let new_code = self.runtime.is_verification_pending();
        self.runtime.start_instance(&code, gas_for_execution, new_code)?;

        self.call_sc_method_indirect()?;
        if !self.output.return_code().is_ok() {
            return Err(VmError::ReturnCodeNotOk);
        }
        Ok(())
    }

    /// Deploy a contract from a running contract.
    pub fn create_new_contract(&mut self, input: ContractCreateInput) -> Result<Address, VmError> {
        if self.runtime.read_only() {
            return Err(VmError::InvalidCallOnReadOnlyMode);
        }

        let caller = input.vm_input.caller;
        self.blockchain.increase_nonce(&mut self.output, &caller)?;
        let address = self.blockchain.new_address(&mut self.output, &caller)?;
        if self.blockchain.account_exists(&address) {
            return Err(VmError::DeploymentOverExistingAccount);
        }
        tracing::debug!(creator = %caller, address = %address, "create new contract");

        self.output.deploy_code(&CodeDeployInput {
            contract_code: input.contract_code,
            code_metadata: input.code_metadata,
            address,
            deployer: caller,
        });
        self.runtime.must_verify_next_contract_code();

        let mut init_input = CallInput {
            vm_input: input.vm_input,
            recipient: address,
            function: INIT_FUNCTION_NAME.to_string(),
            allow_init_function: true,
        };
        init_input.vm_input.call_type = CallType::DirectCall;

        let outcome = self.execute_on_dest_context(init_input);
        if let Err(err) = outcome.result {
            self.output.delete_output_account(&address);
            self.runtime.reset_verification();
            return Err(err);
        }
        Ok(address)
    }

    /// Upgrade requested through a call to `upgradeContract`.
    fn execute_upgrade(&mut self, input: &CallInput) -> Result<(), VmError> {
        let (contract_code, code_metadata) = self.runtime.extract_code_upgrade_from_args()?;
        self.check_upgrade_permission(&input.recipient, &input.vm_input.caller)?;

        self.metering.deduct_initial_gas_for_indirect_deployment(&contract_code)?;
        self.runtime.must_verify_next_contract_code();
        let gas_for_execution = self.metering.gas_for_execution();
        self.runtime.start_instance(&contract_code, gas_for_execution, true)?;

        self.runtime.set_custom_call_function(INIT_FUNCTION_NAME);
        self.call_sc_method_indirect()?;
        if !self.output.return_code().is_ok() {
            return Err(VmError::ReturnCodeNotOk);
        }

        self.output.deploy_code(&CodeDeployInput {
            contract_code,
            code_metadata,
            address: input.recipient,
            deployer: input.vm_input.caller,
        });
        Ok(())
    }
}
