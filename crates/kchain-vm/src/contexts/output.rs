//! Accumulated effects of a call tree.
//!
//! A nested call works on a copy of its caller's accumulated output. On
//! success the copy replaces the caller's state; on failure it is dropped.

use crate::blockchain_hook::BlockchainHook;
use crate::error::VmError;
use crate::state_stack::StateStack;
use kchain_types::{
    Address, CallType, CodeMetadata, LogEntry, OutputAccount, OutputTransfer, ReturnCode, StorageUpdate, VmOutput,
};
use num_bigint::BigInt;
use num_traits::{Signed, Zero};

/// Code written to an account by a deployment or upgrade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeDeployInput {
    pub contract_code: Vec<u8>,
    pub code_metadata: CodeMetadata,
    pub address: Address,
    pub deployer: Address,
}

#[derive(Debug, Default)]
pub struct OutputContext {
    state: VmOutput,
    state_stack: Vec<VmOutput>,
}

impl OutputContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear the parts of the output that belong to the caller only.
    pub fn censor_vm_output(&mut self) {
        self.state.return_data.clear();
        self.state.return_code = ReturnCode::Ok;
        self.state.return_message.clear();
        self.state.gas_remaining = 0;
        self.state.gas_refund = 0;
        self.state.logs.clear();
    }

    /// Merge the output of a successful child into its caller's snapshot.
    pub fn pop_merge_active_state(&mut self) {
        let Some(mut previous) = self.state_stack.pop() else {
            return;
        };
        let child = std::mem::take(&mut self.state);
        merge_vm_outputs(&mut previous, child);
        self.state = previous;
    }

    /// Fold the output of a built-in function into the active state.
    ///
    /// Unlike a child frame, a built-in output only carries its own effects,
    /// so balances and gas add up.
    pub fn add_to_active_state(&mut self, output: VmOutput) {
        for (address, account) in output.output_accounts {
            let target = self.output_account_mut(&address);
            target.balance_delta += account.balance_delta;
            target.nonce = target.nonce.max(account.nonce);
            target.storage_updates.extend(account.storage_updates);
            target.output_transfers.extend(account.output_transfers);
            target.gas_used = target.gas_used.saturating_add(account.gas_used);
            if !account.code.is_empty() {
                target.code = account.code;
                target.code_metadata = account.code_metadata;
                target.code_deployer = account.code_deployer;
            }
            if account.balance.is_some() && target.balance.is_none() {
                target.balance = account.balance;
            }
        }
        for address in output.deleted_accounts {
            if !self.state.deleted_accounts.contains(&address) {
                self.state.deleted_accounts.push(address);
            }
        }
        self.state.logs.extend(output.logs);
        self.state.return_data.extend(output.return_data);
        self.state.gas_refund = self.state.gas_refund.saturating_add(output.gas_refund);
    }

    pub fn output_account_mut(&mut self, address: &Address) -> &mut OutputAccount {
        self.state
            .output_accounts
            .entry(*address)
            .or_insert_with(|| OutputAccount::new(*address))
    }

    pub fn output_account(&self, address: &Address) -> Option<&OutputAccount> {
        self.state.output_accounts.get(address)
    }

    pub fn delete_output_account(&mut self, address: &Address) {
        self.state.output_accounts.remove(address);
    }

    /// World balance of `address` plus its accumulated delta.
    pub fn balance_of(&mut self, hook: &dyn BlockchainHook, address: &Address) -> BigInt {
        let known = self.output_account(address).and_then(|account| account.balance.clone());
        let world = match known {
            Some(balance) => balance,
            None => {
                let balance = match hook.get_user_account(address) {
                    Ok(Some(account)) => account.balance,
                    Ok(None) => BigInt::zero(),
                    Err(e) => {
                        tracing::debug!(error = %e, "balance lookup failed");
                        BigInt::zero()
                    }
                };
                self.output_account_mut(address).balance = Some(balance.clone());
                balance
            }
        };
        let delta = self
            .output_account(address)
            .map(|account| account.balance_delta.clone())
            .unwrap_or_default();
        world + delta
    }

    /// Move value between two accounts, without any data.
    pub fn transfer_value_only(
        &mut self,
        hook: &dyn BlockchainHook,
        destination: &Address,
        sender: &Address,
        value: &BigInt,
        check_payable: bool,
    ) -> Result<(), VmError> {
        if value.is_negative() {
            return Err(VmError::TransferNegativeValue);
        }
        if check_payable && !value.is_zero() && !self.is_payable(hook, sender, destination) {
            return Err(VmError::AccountNotPayable);
        }
        if &self.balance_of(hook, sender) < value {
            return Err(VmError::TransferInsufficientFunds);
        }

        self.output_account_mut(sender).balance_delta -= value;
        self.output_account_mut(destination).balance_delta += value;
        Ok(())
    }

    fn is_payable(&self, hook: &dyn BlockchainHook, sender: &Address, destination: &Address) -> bool {
        if !hook.is_smart_contract(destination) {
            return true;
        }
        let deployed = self
            .output_account(destination)
            .and_then(|account| account.code_metadata);
        if let Some(metadata) = deployed {
            return metadata.payable || (metadata.payable_by_sc && hook.is_smart_contract(sender));
        }
        match hook.get_user_account(destination) {
            Ok(Some(account)) => {
                let metadata = account.code_metadata;
                metadata.payable || (metadata.payable_by_sc && hook.is_smart_contract(sender))
            }
            _ => hook.is_payable(destination).unwrap_or(false),
        }
    }

    /// Move value and record an output transfer carrying `data` and gas.
    #[allow(clippy::too_many_arguments)]
    pub fn transfer(
        &mut self,
        hook: &dyn BlockchainHook,
        destination: &Address,
        sender: &Address,
        gas_limit: u64,
        gas_locked: u64,
        value: &BigInt,
        data: Vec<u8>,
        call_type: CallType,
    ) -> Result<(), VmError> {
        self.transfer_value_only(hook, destination, sender, value, false)?;
        self.output_account_mut(destination).output_transfers.push(OutputTransfer {
            value: value.clone(),
            gas_limit,
            gas_locked,
            data,
            call_type,
            sender: *sender,
        });
        Ok(())
    }

    /// Credit the value of the transaction to its recipient.
    pub fn add_tx_value_to_account(&mut self, address: &Address, value: &BigInt) {
        self.output_account_mut(address).balance_delta += value;
    }

    pub fn deploy_code(&mut self, input: &CodeDeployInput) {
        let account = self.output_account_mut(&input.address);
        account.code = input.contract_code.clone();
        account.code_metadata = Some(input.code_metadata);
        account.code_deployer = Some(input.deployer);
    }

    /// Mark an account for deletion at the end of the transaction.
    pub fn self_destruct(&mut self, address: &Address, beneficiary: &Address) {
        tracing::debug!(address = %address, beneficiary = %beneficiary, "self destruct");
        if !self.state.deleted_accounts.contains(address) {
            self.state.deleted_accounts.push(*address);
        }
    }

    pub fn write_log(&mut self, address: &Address, topics: &[Vec<u8>], data: &[u8]) {
        let (identifier, topics) = match topics.split_first() {
            Some((first, rest)) => (first.clone(), rest.to_vec()),
            None => (Vec::new(), Vec::new()),
        };
        self.state.logs.push(LogEntry {
            identifier,
            address: *address,
            topics,
            data: data.to_vec(),
        });
    }

    pub fn finish(&mut self, data: Vec<u8>) {
        self.state.return_data.push(data);
    }

    pub fn prepend_finish(&mut self, data: Vec<u8>) {
        self.state.return_data.insert(0, data);
    }

    pub fn clear_return_data(&mut self) {
        self.state.return_data.clear();
    }

    pub fn return_data(&self) -> &[Vec<u8>] {
        &self.state.return_data
    }

    pub fn return_code(&self) -> ReturnCode {
        self.state.return_code
    }

    pub fn set_return_code(&mut self, code: ReturnCode) {
        self.state.return_code = code;
    }

    pub fn return_message(&self) -> &str {
        &self.state.return_message
    }

    pub fn set_return_message(&mut self, message: impl Into<String>) {
        self.state.return_message = message.into();
    }

    pub fn refund(&self) -> u64 {
        self.state.gas_refund
    }

    pub fn add_refund(&mut self, gas: u64) {
        self.state.gas_refund = self.state.gas_refund.saturating_add(gas);
    }

    pub fn logs(&self) -> &[LogEntry] {
        &self.state.logs
    }

    pub fn storage_update(&self, address: &Address, key: &[u8]) -> Option<&StorageUpdate> {
        self.output_account(address)
            .and_then(|account| account.storage_updates.get(key))
    }

    /// Gas used so far by every account of the active output
    pub fn current_total_used_gas(&self) -> u64 {
        self.state.total_gas_used()
    }

    /// Snapshot of the active output, charging `gas_used` to the current
    /// contract.
    pub fn get_vm_output(&mut self, sc_address: &Address, gas_remaining: u64, gas_used: u64) -> VmOutput {
        self.state.gas_remaining = gas_remaining;
        let account = self.output_account_mut(sc_address);
        account.gas_used = account.gas_used.saturating_add(gas_used);
        self.state.clone()
    }

    /// Output of a call that failed with `err`: no accounts, no gas left.
    pub fn create_vm_output_in_case_of_error(&self, err: &VmError) -> VmOutput {
        let failed_in_frame = matches!(err, VmError::ExecutionFailed | VmError::ReturnCodeNotOk);

        let return_code = if failed_in_frame && !self.state.return_code.is_ok() {
            self.state.return_code
        } else {
            err.return_code()
        };
        let message = if failed_in_frame && !self.state.return_message.is_empty() {
            self.state.return_message.clone()
        } else {
            err.to_string()
        };
        VmOutput::failure(return_code, message)
    }
}

impl StateStack for OutputContext {
    fn init_state(&mut self) {
        self.state = VmOutput::new();
    }

    fn push_state(&mut self) {
        self.state_stack.push(self.state.clone());
    }

    fn pop_set_active_state(&mut self) {
        if let Some(previous) = self.state_stack.pop() {
            self.state = previous;
        }
    }

    fn pop_discard(&mut self) {
        self.state_stack.pop();
    }

    fn clear_state_stack(&mut self) {
        self.state_stack.clear();
    }

    fn state_stack_len(&self) -> usize {
        self.state_stack.len()
    }
}

/// Merge `right`, produced by a child frame, into `left`.
///
/// The child started from a copy of the caller's accounts, so its balances,
/// storage and gas already include the caller's and replace them. Logs,
/// return data and refund were cleared for the child and are appended.
fn merge_vm_outputs(left: &mut VmOutput, right: VmOutput) {
    for (address, right_account) in right.output_accounts {
        let left_account = left
            .output_accounts
            .entry(address)
            .or_insert_with(|| OutputAccount::new(address));
        merge_output_accounts(left_account, right_account);
    }

    for address in right.deleted_accounts {
        if !left.deleted_accounts.contains(&address) {
            left.deleted_accounts.push(address);
        }
    }

    left.logs.extend(right.logs);
    left.return_data.extend(right.return_data);
    left.gas_refund = left.gas_refund.saturating_add(right.gas_refund);
    left.gas_remaining = right.gas_remaining;
    left.return_code = right.return_code;
    left.return_message = right.return_message;
}

fn merge_output_accounts(left: &mut OutputAccount, right: OutputAccount) {
    left.storage_updates.extend(right.storage_updates);

    if right.balance.is_some() {
        left.balance = right.balance;
    }
    if !right.code.is_empty() {
        left.code = right.code;
    }
    if right.code_metadata.is_some() {
        left.code_metadata = right.code_metadata;
    }
    if right.code_deployer.is_some() {
        left.code_deployer = right.code_deployer;
    }

    left.balance_delta = right.balance_delta;
    left.nonce = left.nonce.max(right.nonce);

    if right.output_transfers.len() > left.output_transfers.len() {
        let start = left.output_transfers.len();
        left.output_transfers.extend(right.output_transfers.into_iter().skip(start));
    }
    left.gas_used = right.gas_used;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockWorld;
    use kchain_types::UserAccount;

    fn addr(b: u8) -> Address {
        Address::from_bytes([b; 32])
    }

    fn world() -> MockWorld {
        let world = MockWorld::new();
        world.put_account(UserAccount::new(addr(1), 1_000));
        world.put_account(UserAccount::new(addr(2), 0));
        world
    }

    #[test]
    fn test_transfer_moves_value() {
        let world = world();
        let mut output = OutputContext::new();
        output
            .transfer_value_only(&world, &addr(2), &addr(1), &BigInt::from(300), false)
            .unwrap();

        assert_eq!(output.balance_of(&world, &addr(1)), BigInt::from(700));
        assert_eq!(output.balance_of(&world, &addr(2)), BigInt::from(300));
        assert_eq!(output.output_account(&addr(1)).unwrap().balance_delta, BigInt::from(-300));
    }

    #[test]
    fn test_transfer_checks() {
        let world = world();
        let mut output = OutputContext::new();
        assert_eq!(
            output.transfer_value_only(&world, &addr(2), &addr(1), &BigInt::from(-1), false),
            Err(VmError::TransferNegativeValue)
        );
        assert_eq!(
            output.transfer_value_only(&world, &addr(2), &addr(1), &BigInt::from(1_001), false),
            Err(VmError::TransferInsufficientFunds)
        );
    }

    #[test]
    fn test_transfer_to_non_payable_contract() {
        let world = world();
        let sc = Address::new_contract_address(&addr(1), 0, &[5, 0]);
        world.put_account(UserAccount::new_contract(sc, b"code".to_vec(), addr(1)));

        let mut output = OutputContext::new();
        assert_eq!(
            output.transfer_value_only(&world, &sc, &addr(1), &BigInt::from(5), true),
            Err(VmError::AccountNotPayable)
        );
        assert!(output
            .transfer_value_only(&world, &sc, &addr(1), &BigInt::from(5), false)
            .is_ok());
    }

    #[test]
    fn test_transfer_records_output_transfer() {
        let world = world();
        let mut output = OutputContext::new();
        output
            .transfer(&world, &addr(2), &addr(1), 50, 10, &BigInt::from(1), b"hello".to_vec(), CallType::AsynchronousCall)
            .unwrap();

        let transfers = &output.output_account(&addr(2)).unwrap().output_transfers;
        assert_eq!(transfers.len(), 1);
        assert_eq!(transfers[0].gas_limit, 50);
        assert_eq!(transfers[0].gas_locked, 10);
        assert_eq!(transfers[0].sender, addr(1));
    }

    #[test]
    fn test_child_merge_and_discard() {
        let world = world();
        let mut output = OutputContext::new();
        output.finish(b"parent".to_vec());
        output.write_log(&addr(1), &[b"evt".to_vec()], b"p");
        output.add_refund(5);

        output.push_state();
        output.censor_vm_output();
        assert!(output.return_data().is_empty());
        output
            .transfer_value_only(&world, &addr(2), &addr(1), &BigInt::from(10), false)
            .unwrap();
        output.finish(b"child".to_vec());
        output.write_log(&addr(2), &[], b"c");
        output.pop_merge_active_state();

        assert_eq!(output.return_data(), &[b"parent".to_vec(), b"child".to_vec()]);
        assert_eq!(output.logs().len(), 2);
        assert_eq!(output.refund(), 5);
        assert_eq!(output.output_account(&addr(2)).unwrap().balance_delta, BigInt::from(10));

        output.push_state();
        output.censor_vm_output();
        output
            .transfer_value_only(&world, &addr(2), &addr(1), &BigInt::from(10), false)
            .unwrap();
        output.pop_set_active_state();
        assert_eq!(output.output_account(&addr(2)).unwrap().balance_delta, BigInt::from(10));
        assert_eq!(output.state_stack_len(), 0);
    }

    #[test]
    fn test_builtin_output_is_additive() {
        let mut output = OutputContext::new();
        output.add_tx_value_to_account(&addr(1), &BigInt::from(7));

        let mut builtin = VmOutput::new();
        let mut account = OutputAccount::new(addr(1));
        account.balance_delta = BigInt::from(3);
        account.gas_used = 4;
        builtin.output_accounts.insert(addr(1), account);
        output.add_to_active_state(builtin);

        let account = output.output_account(&addr(1)).unwrap();
        assert_eq!(account.balance_delta, BigInt::from(10));
        assert_eq!(account.gas_used, 4);
    }

    #[test]
    fn test_log_identifier_is_first_topic() {
        let mut output = OutputContext::new();
        output.write_log(&addr(1), &[b"id".to_vec(), b"t1".to_vec()], b"data");
        let log = &output.logs()[0];
        assert_eq!(log.identifier, b"id".to_vec());
        assert_eq!(log.topics, vec![b"t1".to_vec()]);
    }

    #[test]
    fn test_error_output() {
        let mut output = OutputContext::new();
        output.output_account_mut(&addr(1));

        let failed = output.create_vm_output_in_case_of_error(&VmError::SignalError("bad".into()));
        assert_eq!(failed.return_code, ReturnCode::UserError);
        assert_eq!(failed.return_message, "bad");
        assert!(failed.output_accounts.is_empty());
        assert_eq!(failed.gas_remaining, 0);

        output.set_return_code(ReturnCode::ExecutionFailed);
        output.set_return_message("nested failure");
        let failed = output.create_vm_output_in_case_of_error(&VmError::ExecutionFailed);
        assert_eq!(failed.return_message, "nested failure");

        let failed = output.create_vm_output_in_case_of_error(&VmError::NotEnoughGas);
        assert_eq!(failed.return_code, ReturnCode::OutOfGas);
        assert_eq!(failed.return_message, "not enough gas");
    }

    #[test]
    fn test_get_vm_output_charges_contract() {
        let mut output = OutputContext::new();
        let vm_output = output.get_vm_output(&addr(3), 90, 10);
        assert_eq!(vm_output.gas_remaining, 90);
        assert_eq!(vm_output.account(&addr(3)).unwrap().gas_used, 10);
    }

    #[test]
    fn test_self_destruct_once() {
        let mut output = OutputContext::new();
        output.self_destruct(&addr(1), &addr(2));
        output.self_destruct(&addr(1), &addr(2));
        output.push_state();
        output.pop_merge_active_state();
        assert_eq!(output.get_vm_output(&addr(1), 0, 0).deleted_accounts, vec![addr(1)]);
    }
}
