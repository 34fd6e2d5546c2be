use super::builtin::is_dcdt_transfer;
use super::VmHost;
use crate::call_args::{encode_call_data, parse_call_data};
use crate::contexts::{Breakpoint, ExecutionFrame, StorageStatus};
use crate::engine::InstanceError;
use crate::error::VmError;
use crate::gas_schedule::{BaseOpsApiCost, BigIntApiCost};
use crate::vmhooks::{BigIntHandle, HookResult, VmHooks};
use kchain_types::{Address, CallInput, CallType, CodeMetadata, ContractCreateInput, VmInput};
use num_bigint::{BigInt, Sign};
use num_traits::Zero;

impl VmHost {
    fn api_cost(&self, cost: impl FnOnce(&BaseOpsApiCost) -> u64) -> u64 {
        cost(&self.metering.gas_schedule().base_ops_api_cost)
    }

    fn big_int_cost(&self, cost: impl FnOnce(&BigIntApiCost) -> u64) -> u64 {
        cost(&self.metering.gas_schedule().big_int_api_cost)
    }

    fn data_copy_cost(&self, len: usize) -> u64 {
        self.metering
            .gas_schedule()
            .base_operation_cost
            .data_copy_per_byte
            .saturating_mul(len as u64)
    }

    fn persist_cost(&self, len: usize) -> u64 {
        self.metering
            .gas_schedule()
            .base_operation_cost
            .persist_per_byte
            .saturating_mul(len as u64)
    }

    /// Charge `gas` and stop the contract if it ran out.
    fn charge(&mut self, gas: u64) -> HookResult<()> {
        self.use_gas(gas);
        self.checkpoint()
    }

    fn checkpoint(&mut self) -> HookResult<()> {
        if self.metering.is_out_of_gas(&self.runtime) {
            self.runtime.set_breakpoint(Breakpoint::OutOfGas);
            return Err(InstanceError::Breakpoint);
        }
        Ok(())
    }

    /// Stop the contract because of `err`.
    fn fault(&mut self, err: VmError) -> InstanceError {
        if err == VmError::NotEnoughGas {
            self.runtime.set_breakpoint(Breakpoint::OutOfGas);
        } else {
            self.fail_execution(Some(&err));
        }
        InstanceError::Breakpoint
    }

    /// A failed synchronous call stops the caller, or is reported to it as
    /// a status code.
    fn sync_call_failed(&mut self, err: VmError) -> HookResult<i32> {
        if self.config.sync_exec_error_fails_execution {
            self.fail_execution(Some(&err));
            return Err(InstanceError::Breakpoint);
        }
        tracing::debug!(error = %err, "synchronous call failed");
        Ok(1)
    }

    fn prepare_indirect_call_input(
        &mut self,
        destination: &Address,
        value: &BigInt,
        gas_limit: u64,
        function: &str,
        arguments: &[Vec<u8>],
        sync_required: bool,
    ) -> Result<CallInput, VmError> {
        let sender = *self.runtime.sc_address();
        if sync_required && !self.blockchain.in_same_shard(&sender, destination) {
            return Err(VmError::SyncExecutionNotInSameShard);
        }

        let data_len: usize = arguments.iter().map(Vec::len).sum();
        let copy_cost = self.data_copy_cost(data_len);
        self.use_gas(copy_cost);

        Ok(CallInput {
            vm_input: VmInput {
                caller: sender,
                arguments: arguments.to_vec(),
                call_value: value.clone(),
                call_type: CallType::DirectCall,
                gas_price: self.runtime.vm_input().gas_price,
                gas_provided: self.metering.bound_gas_limit(&self.runtime, gas_limit),
                ..Default::default()
            },
            recipient: *destination,
            function: function.to_string(),
            allow_init_function: false,
        })
    }

    /// Token transfer requested through `executeOnDestContext` with DCDT
    /// transfer call data.
    fn dcdt_transfer_and_execute_synchronously(
        &mut self,
        destination: &Address,
        value: &BigInt,
        gas_limit: u64,
        function: &str,
        arguments: &[Vec<u8>],
    ) -> HookResult<i32> {
        if !value.is_zero() {
            return Err(self.fault(VmError::TransferValueOnDcdtCall));
        }

        let (token_id, nonce, amount, rest) = match function {
            super::DCDT_TRANSFER_FUNCTION_NAME if arguments.len() >= 2 => {
                (&arguments[0], 0, &arguments[1], &arguments[2..])
            }
            super::DCDT_NFT_TRANSFER_FUNCTION_NAME if arguments.len() >= 3 => {
                let nonce = arguments[1].iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b));
                (&arguments[0], nonce, &arguments[2], &arguments[3..])
            }
            _ => {
                return Err(self.fault(VmError::InvalidCallData(format!(
                    "not enough arguments for {}",
                    function
                ))))
            }
        };
        let amount = BigInt::from_bytes_be(Sign::Plus, amount);
        let (call_function, call_arguments) = match rest.split_first() {
            Some((name, call_arguments)) => (String::from_utf8_lossy(name).into_owned(), call_arguments),
            None => (String::new(), rest),
        };

        self.transfer_dcdt_execute(
            destination,
            token_id,
            nonce,
            &amount,
            gas_limit,
            &call_function,
            call_arguments,
        )
    }
}

impl VmHooks for VmHost {
    fn sc_address(&mut self) -> HookResult<Address> {
        self.charge(self.api_cost(|c| c.get_sc_address))?;
        Ok(*self.runtime.sc_address())
    }

    fn owner_address(&mut self) -> HookResult<Address> {
        self.charge(self.api_cost(|c| c.get_owner_address))?;
        let sc_address = *self.runtime.sc_address();
        self.blockchain.owner_address(&sc_address).map_err(|e| self.fault(e))
    }

    fn caller(&mut self) -> HookResult<Address> {
        self.charge(self.api_cost(|c| c.get_caller))?;
        Ok(self.runtime.vm_input().caller)
    }

    fn call_value(&mut self) -> HookResult<BigInt> {
        self.charge(self.api_cost(|c| c.get_call_value))?;
        Ok(self.runtime.vm_input().call_value.clone())
    }

    fn function(&mut self) -> HookResult<String> {
        self.charge(self.api_cost(|c| c.get_function))?;
        Ok(self.runtime.function().to_string())
    }

    fn num_arguments(&mut self) -> HookResult<usize> {
        self.charge(self.api_cost(|c| c.get_num_arguments))?;
        Ok(self.runtime.arguments().len())
    }

    fn argument(&mut self, index: usize) -> HookResult<Vec<u8>> {
        self.charge(self.api_cost(|c| c.get_argument))?;
        let argument = self.runtime.arguments().get(index).cloned();
        argument.ok_or_else(|| self.fault(VmError::ArgOutOfRange))
    }

    fn gas_left(&mut self) -> HookResult<u64> {
        self.charge(self.api_cost(|c| c.get_gas_left))?;
        Ok(VmHost::gas_left(self))
    }

    fn shard_of_address(&mut self, address: &Address) -> HookResult<u32> {
        self.charge(self.api_cost(|c| c.get_shard_of_address))?;
        Ok(self.blockchain.shard_of_address(address))
    }

    fn is_smart_contract(&mut self, address: &Address) -> HookResult<bool> {
        self.charge(self.api_cost(|c| c.is_smart_contract))?;
        Ok(self.blockchain.is_smart_contract(address))
    }

    fn external_balance(&mut self, address: &Address) -> HookResult<BigInt> {
        self.charge(self.api_cost(|c| c.get_external_balance))?;
        Ok(self.blockchain.get_balance(&mut self.output, address))
    }

    fn block_nonce(&mut self) -> HookResult<u64> {
        self.charge(self.api_cost(|c| c.get_block_nonce))?;
        Ok(self.blockchain.current_block().nonce)
    }

    fn block_round(&mut self) -> HookResult<u64> {
        self.charge(self.api_cost(|c| c.get_block_round))?;
        Ok(self.blockchain.current_block().round)
    }

    fn block_epoch(&mut self) -> HookResult<u32> {
        self.charge(self.api_cost(|c| c.get_block_epoch))?;
        Ok(self.blockchain.current_block().epoch)
    }

    fn block_timestamp(&mut self) -> HookResult<u64> {
        self.charge(self.api_cost(|c| c.get_block_time_stamp))?;
        Ok(self.blockchain.current_block().timestamp)
    }

    fn state_root_hash(&mut self) -> HookResult<Vec<u8>> {
        self.charge(self.api_cost(|c| c.get_state_root_hash))?;
        Ok(self.blockchain.state_root_hash())
    }

    fn use_gas(&mut self, gas: u64) -> HookResult<()> {
        self.charge(gas)
    }

    fn finish(&mut self, data: &[u8]) -> HookResult<()> {
        let cost = self.api_cost(|c| c.finish).saturating_add(self.persist_cost(data.len()));
        self.charge(cost)?;
        self.output.finish(data.to_vec());
        Ok(())
    }

    fn signal_error(&mut self, message: &str) -> HookResult<()> {
        let cost = self
            .api_cost(|c| c.signal_error)
            .saturating_add(self.persist_cost(message.len()));
        self.charge(cost)?;
        self.signal_user_error(message);
        Err(InstanceError::Breakpoint)
    }

    fn write_log(&mut self, topics: &[Vec<u8>], data: &[u8]) -> HookResult<()> {
        let len = data.len() + topics.iter().map(Vec::len).sum::<usize>();
        let cost = self.api_cost(|c| c.log).saturating_add(self.data_copy_cost(len));
        self.charge(cost)?;
        let sc_address = *self.runtime.sc_address();
        self.output.write_log(&sc_address, topics, data);
        Ok(())
    }

    fn num_return_data(&mut self) -> HookResult<usize> {
        self.charge(self.api_cost(|c| c.get_num_return_data))?;
        Ok(self.output.return_data().len())
    }

    fn return_data(&mut self, index: usize) -> HookResult<Vec<u8>> {
        self.charge(self.api_cost(|c| c.get_return_data))?;
        let Some(data) = self.output.return_data().get(index).cloned() else {
            return Err(self.fault(VmError::ArgOutOfRange));
        };
        self.charge(self.data_copy_cost(data.len()))?;
        Ok(data)
    }

    fn storage_store(&mut self, key: &[u8], value: &[u8]) -> HookResult<StorageStatus> {
        self.charge(self.api_cost(|c| c.storage_store))?;
        let write = self.storage.set_storage(
            &mut self.output,
            self.blockchain.hook(),
            &self.metering.gas_schedule().base_operation_cost,
            self.runtime.read_only(),
            key,
            value,
        );
        let write = write.map_err(|e| self.fault(e))?;
        self.charge(write.gas_used)?;
        self.free_gas(write.gas_freed);
        Ok(write.status)
    }

    fn storage_load(&mut self, key: &[u8]) -> HookResult<Vec<u8>> {
        self.charge(self.api_cost(|c| c.storage_load))?;
        let (value, gas) = self.storage.get_storage(
            &self.output,
            self.blockchain.hook(),
            &self.metering.gas_schedule().base_operation_cost,
            key,
        );
        self.charge(gas)?;
        Ok(value)
    }

    fn storage_load_from_address(&mut self, address: &Address, key: &[u8]) -> HookResult<Vec<u8>> {
        self.charge(self.api_cost(|c| c.storage_load))?;
        Ok(self
            .storage
            .get_storage_from_address(&self.output, self.blockchain.hook(), address, key))
    }

    fn transfer_value(&mut self, destination: &Address, value: &BigInt, data: &[u8]) -> HookResult<i32> {
        let cost = self
            .api_cost(|c| c.transfer_value)
            .saturating_add(self.persist_cost(data.len()));
        self.charge(cost)?;

        if let Ok((function, _)) = parse_call_data(data) {
            if self.is_builtin_function_name(&function) {
                tracing::debug!(%function, "built-in call through transfer value rejected");
                return Ok(1);
            }
        }

        let sender = *self.runtime.sc_address();
        self.output
            .transfer(
                self.blockchain.hook(),
                destination,
                &sender,
                0,
                0,
                value,
                data.to_vec(),
                CallType::DirectCall,
            )
            .map_err(|e| self.fault(e))?;
        Ok(0)
    }

    fn transfer_value_execute(
        &mut self,
        destination: &Address,
        value: &BigInt,
        gas_limit: u64,
        function: &str,
        arguments: &[Vec<u8>],
    ) -> HookResult<i32> {
        self.charge(self.api_cost(|c| c.transfer_value))?;
        let input = self
            .prepare_indirect_call_input(destination, value, gas_limit, function, arguments, false)
            .map_err(|e| self.fault(e))?;
        self.checkpoint()?;

        let sender = *self.runtime.sc_address();
        if self.is_builtin_function_name(function) {
            return Ok(1);
        }
        let execute_here = !function.is_empty()
            && self.blockchain.in_same_shard(&sender, destination)
            && self.blockchain.is_smart_contract(destination);
        if execute_here {
            let outcome = self.execute_on_dest_context(input);
            return match outcome.result {
                Ok(()) => Ok(0),
                Err(err) => self.sync_call_failed(err),
            };
        }

        let gas = input.vm_input.gas_provided;
        let data = if function.is_empty() {
            Vec::new()
        } else {
            encode_call_data(function, arguments)
        };
        self.output
            .transfer(
                self.blockchain.hook(),
                destination,
                &sender,
                gas,
                0,
                value,
                data,
                CallType::DirectCall,
            )
            .map_err(|e| self.fault(e))?;
        self.use_gas(gas);
        self.forward_gas(None, gas);
        Ok(0)
    }

    fn transfer_dcdt_execute(
        &mut self,
        destination: &Address,
        token_id: &[u8],
        nonce: u64,
        value: &BigInt,
        gas_limit: u64,
        function: &str,
        arguments: &[Vec<u8>],
    ) -> HookResult<i32> {
        let data_len = token_id.len() + function.len() + arguments.iter().map(Vec::len).sum::<usize>();
        let cost = self
            .api_cost(|c| c.transfer_value)
            .saturating_add(self.data_copy_cost(data_len));
        self.charge(cost)?;

        let call = if function.is_empty() {
            None
        } else {
            let input = self
                .prepare_indirect_call_input(destination, &BigInt::zero(), gas_limit, function, arguments, false)
                .map_err(|e| self.fault(e))?;
            Some(input)
        };

        let gas_for_call = self
            .transfer_dcdt(destination, token_id, nonce, value, call.as_ref())
            .map_err(|e| self.fault(e))?;
        self.checkpoint()?;

        let Some(mut input) = call else {
            return Ok(0);
        };
        let sender = *self.runtime.sc_address();
        if !self.blockchain.is_smart_contract(destination) || !self.blockchain.in_same_shard(&sender, destination) {
            return Ok(0);
        }

        input.vm_input.gas_provided = gas_for_call;
        input.vm_input.call_type = CallType::DcdtTransferAndExecute;
        input.vm_input.dcdt_transfers = vec![kchain_types::DcdtTransfer {
            token_name: token_id.to_vec(),
            value: value.clone(),
            nonce,
            token_type: if nonce > 0 {
                kchain_types::DcdtTokenType::NonFungible
            } else {
                kchain_types::DcdtTokenType::Fungible
            },
        }];
        let outcome = self.execute_on_dest_context(input);
        let Err(err) = outcome.result else {
            return Ok(0);
        };

        let transfer = self.dcdt_transfer_input(
            destination,
            &sender,
            token_id,
            nonce,
            value,
            CallType::DcdtTransferAndExecute,
        );
        if self.revert_dcdt_transfer(&transfer).is_err() {
            return Err(InstanceError::Breakpoint);
        }
        self.sync_call_failed(err)
    }

    fn execute_on_dest_context(
        &mut self,
        gas_limit: u64,
        destination: &Address,
        value: &BigInt,
        function: &str,
        arguments: &[Vec<u8>],
    ) -> HookResult<i32> {
        self.charge(self.api_cost(|c| c.execute_on_dest_context))?;

        if is_dcdt_transfer(function) && self.metering.flags().dcdt_functions_enabled {
            return self.dcdt_transfer_and_execute_synchronously(destination, value, gas_limit, function, arguments);
        }

        let input = match self.prepare_indirect_call_input(destination, value, gas_limit, function, arguments, true) {
            Ok(input) => input,
            Err(err) => return self.sync_call_failed(err),
        };
        self.checkpoint()?;

        let outcome = VmHost::execute_on_dest_context(self, input);
        match outcome.result {
            Ok(()) => Ok(0),
            Err(err) => self.sync_call_failed(err),
        }
    }

    fn execute_on_same_context(
        &mut self,
        gas_limit: u64,
        destination: &Address,
        value: &BigInt,
        function: &str,
        arguments: &[Vec<u8>],
    ) -> HookResult<i32> {
        self.charge(self.api_cost(|c| c.execute_on_same_context))?;

        let input = match self.prepare_indirect_call_input(destination, value, gas_limit, function, arguments, true) {
            Ok(input) => input,
            Err(err) => return self.sync_call_failed(err),
        };
        self.checkpoint()?;

        match VmHost::execute_on_same_context(self, input) {
            Ok(()) => Ok(0),
            Err(err) => self.sync_call_failed(err),
        }
    }

    fn execute_read_only(
        &mut self,
        gas_limit: u64,
        destination: &Address,
        function: &str,
        arguments: &[Vec<u8>],
    ) -> HookResult<i32> {
        self.charge(self.api_cost(|c| c.execute_read_only))?;

        let input =
            match self.prepare_indirect_call_input(destination, &BigInt::zero(), gas_limit, function, arguments, true) {
                Ok(input) => input,
                Err(err) => return self.sync_call_failed(err),
            };
        self.checkpoint()?;

        let was_read_only = self.runtime.read_only();
        self.runtime.set_read_only(true);
        let outcome = VmHost::execute_on_dest_context(self, input);
        self.runtime.set_read_only(was_read_only);

        match outcome.result {
            Ok(()) => Ok(0),
            Err(err) => self.sync_call_failed(err),
        }
    }

    fn create_contract(
        &mut self,
        gas_limit: u64,
        value: &BigInt,
        code: &[u8],
        code_metadata: CodeMetadata,
        arguments: &[Vec<u8>],
    ) -> HookResult<Option<Address>> {
        let data_len = code.len() + arguments.iter().map(Vec::len).sum::<usize>();
        let cost = self
            .api_cost(|c| c.create_contract)
            .saturating_add(self.data_copy_cost(data_len));
        self.charge(cost)?;

        if self.runtime.read_only() {
            return Err(self.fault(VmError::InvalidCallOnReadOnlyMode));
        }

        let mut vm_input = VmInput {
            caller: *self.runtime.sc_address(),
            arguments: arguments.to_vec(),
            call_value: value.clone(),
            call_type: CallType::DirectCall,
            gas_price: self.runtime.vm_input().gas_price,
            gas_provided: self.metering.bound_gas_limit(&self.runtime, gas_limit),
            ..Default::default()
        };
        vm_input.original_tx_hash = self.runtime.original_tx_hash().to_vec();
        vm_input.current_tx_hash = self.runtime.current_tx_hash().to_vec();

        let input = ContractCreateInput {
            vm_input,
            contract_code: code.to_vec(),
            code_metadata,
        };
        match self.create_new_contract(input) {
            Ok(address) => Ok(Some(address)),
            Err(err) => self.sync_call_failed(err).map(|_| None),
        }
    }

    fn upgrade_contract(
        &mut self,
        destination: &Address,
        gas_limit: u64,
        value: &BigInt,
        code: &[u8],
        code_metadata: CodeMetadata,
        arguments: &[Vec<u8>],
    ) -> HookResult<()> {
        let cost = self
            .api_cost(|c| c.create_contract)
            .saturating_add(self.data_copy_cost(code.len()));
        self.charge(cost)?;

        let schedule = &self.metering.gas_schedule().base_ops_api_cost;
        let min_async_cost = schedule
            .async_call_step
            .saturating_mul(2)
            .saturating_add(schedule.async_callback_gas_lock);
        if VmHost::gas_left(self) < min_async_cost {
            self.runtime.set_breakpoint(Breakpoint::OutOfGas);
            return Err(InstanceError::Breakpoint);
        }

        let mut upgrade_arguments = vec![code.to_vec(), code_metadata.to_bytes().to_vec()];
        upgrade_arguments.extend(arguments.iter().cloned());
        let data = encode_call_data(crate::contexts::runtime::UPGRADE_FUNCTION_NAME, &upgrade_arguments);

        self.execute_async_call(destination, value, &data, Some(gas_limit))
            .map_err(|e| self.fault(e))?;
        Err(InstanceError::Breakpoint)
    }

    fn async_call(&mut self, destination: &Address, value: &BigInt, data: &[u8]) -> HookResult<()> {
        let cost = self
            .api_cost(|c| c.async_call_step)
            .saturating_add(self.data_copy_cost(data.len()));
        self.charge(cost)?;

        self.execute_async_call(destination, value, data, None)
            .map_err(|e| self.fault(e))?;
        Err(InstanceError::Breakpoint)
    }

    fn create_async_call(
        &mut self,
        identifier: &[u8],
        destination: &Address,
        value: &BigInt,
        data: &[u8],
        success_callback: &str,
        error_callback: &str,
        gas: u64,
    ) -> HookResult<i32> {
        let cost = self
            .api_cost(|c| c.create_async_call)
            .saturating_add(self.data_copy_cost(data.len()));
        self.charge(cost)?;

        VmHost::create_async_call(
            self,
            identifier,
            destination,
            value,
            data,
            success_callback,
            error_callback,
            gas,
        )
        .map_err(|e| self.fault(e))?;
        Ok(0)
    }

    fn set_async_context_callback(&mut self, identifier: &[u8], callback: &str) -> HookResult<i32> {
        self.charge(self.data_copy_cost(identifier.len() + callback.len()))?;
        self.runtime
            .set_async_context_callback(identifier, callback)
            .map_err(|e| self.fault(e))?;
        Ok(0)
    }

    fn big_int_new(&mut self, small_value: i64) -> HookResult<BigIntHandle> {
        self.charge(self.big_int_cost(|c| c.big_int_new))?;
        Ok(self.big_int.put(small_value))
    }

    fn big_int_add(&mut self, destination: BigIntHandle, a: BigIntHandle, b: BigIntHandle) -> HookResult<()> {
        self.charge(self.big_int_cost(|c| c.big_int_add))?;
        let (a, b) = self.big_int.get_two(a, b);
        self.big_int.set(destination, a + b);
        Ok(())
    }

    fn big_int_get_unsigned_argument(&mut self, index: usize, destination: BigIntHandle) -> HookResult<()> {
        self.charge(self.big_int_cost(|c| c.big_int_get_unsigned_argument))?;
        let Some(argument) = self.runtime.arguments().get(index).cloned() else {
            return Err(self.fault(VmError::ArgOutOfRange));
        };
        let value = BigInt::from_bytes_be(Sign::Plus, &argument);
        self.big_int.set(destination, value);
        Ok(())
    }

    fn big_int_get_call_value(&mut self, destination: BigIntHandle) -> HookResult<()> {
        self.charge(self.big_int_cost(|c| c.big_int_get_call_value))?;
        let value = self.runtime.vm_input().call_value.clone();
        self.big_int.set(destination, value);
        Ok(())
    }

    fn big_int_finish_unsigned(&mut self, handle: BigIntHandle) -> HookResult<()> {
        self.charge(self.big_int_cost(|c| c.big_int_finish_unsigned))?;
        let value = self.big_int.get_one(handle).clone();
        let bytes = if value.is_zero() {
            Vec::new()
        } else {
            value.magnitude().to_bytes_be()
        };
        self.charge(self.persist_cost(bytes.len()))?;
        self.output.finish(bytes);
        Ok(())
    }
}
