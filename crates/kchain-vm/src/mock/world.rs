use crate::blockchain_hook::{BlockInfo, BlockchainHook, DcdtToken, HookError};
use crate::call_args::encode_call_data;
use crate::host::{DCDT_NFT_TRANSFER_FUNCTION_NAME, DCDT_TRANSFER_FUNCTION_NAME};
use kchain_types::{
    Address, CallInput, CallType, OutputAccount, OutputTransfer, ReturnCode, UserAccount, VmOutput,
};
use num_bigint::{BigInt, Sign};
use num_traits::Zero;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};

/// Gas charged by the mock DCDT built-ins
pub const DCDT_BUILTIN_COST: u64 = 1_000;

#[derive(Default)]
struct WorldState {
    accounts: HashMap<Address, UserAccount>,
    storage: HashMap<Address, HashMap<Vec<u8>, Vec<u8>>>,
    tokens: HashMap<(Address, Vec<u8>, u64), BigInt>,
    current_block: BlockInfo,
}

/// World state kept in memory.
///
/// The DCDT built-ins move token balances immediately, so a reverted
/// transfer is visible as a second movement in the opposite direction.
pub struct MockWorld {
    state: RwLock<WorldState>,
    num_shards: u32,
}

impl MockWorld {
    pub fn new() -> Self {
        Self::with_shards(1)
    }

    pub fn with_shards(num_shards: u32) -> Self {
        Self {
            state: RwLock::new(WorldState::default()),
            num_shards: num_shards.max(1),
        }
    }

    pub fn put_account(&self, account: UserAccount) {
        self.state.write().accounts.insert(account.address, account);
    }

    pub fn account(&self, address: &Address) -> Option<UserAccount> {
        self.state.read().accounts.get(address).cloned()
    }

    pub fn set_storage(&self, address: &Address, key: &[u8], value: &[u8]) {
        self.state
            .write()
            .storage
            .entry(*address)
            .or_default()
            .insert(key.to_vec(), value.to_vec());
    }

    pub fn storage(&self, address: &Address, key: &[u8]) -> Vec<u8> {
        self.state
            .read()
            .storage
            .get(address)
            .and_then(|entries| entries.get(key))
            .cloned()
            .unwrap_or_default()
    }

    pub fn set_dcdt_balance(&self, address: &Address, token_id: &[u8], nonce: u64, value: impl Into<BigInt>) {
        self.state
            .write()
            .tokens
            .insert((*address, token_id.to_vec(), nonce), value.into());
    }

    pub fn dcdt_balance(&self, address: &Address, token_id: &[u8], nonce: u64) -> BigInt {
        self.state
            .read()
            .tokens
            .get(&(*address, token_id.to_vec(), nonce))
            .cloned()
            .unwrap_or_default()
    }

    pub fn set_current_block(&self, block: BlockInfo) {
        self.state.write().current_block = block;
    }

    /// Commit the accounts of a successful output.
    pub fn apply_output(&self, output: &VmOutput) {
        let mut state = self.state.write();
        for (address, changes) in &output.output_accounts {
            let account = state
                .accounts
                .entry(*address)
                .or_insert_with(|| UserAccount::new(*address, 0));
            account.balance += &changes.balance_delta;
            account.nonce = account.nonce.max(changes.nonce);
            if !changes.code.is_empty() {
                account.code = changes.code.clone();
                if let Some(metadata) = changes.code_metadata {
                    account.code_metadata = metadata;
                }
                if changes.code_deployer.is_some() {
                    account.owner = changes.code_deployer;
                }
            }

            let storage = state.storage.entry(*address).or_default();
            for update in changes.storage_updates.values() {
                if update.data.is_empty() {
                    storage.remove(&update.offset);
                } else {
                    storage.insert(update.offset.clone(), update.data.clone());
                }
            }
        }
        for address in &output.deleted_accounts {
            state.accounts.remove(address);
            state.storage.remove(address);
        }
    }

    fn process_dcdt_transfer(&self, input: &CallInput) -> VmOutput {
        let is_nft = input.function == DCDT_NFT_TRANSFER_FUNCTION_NAME;
        let arguments = &input.vm_input.arguments;
        if arguments.len() < if is_nft { 4 } else { 2 } {
            return VmOutput::failure(ReturnCode::FunctionWrongSignature, "not enough arguments");
        }
        if input.vm_input.gas_provided < DCDT_BUILTIN_COST {
            return VmOutput::failure(ReturnCode::OutOfGas, "not enough gas");
        }

        let token_id = arguments[0].clone();
        let (nonce, value, receiver, call) = if is_nft {
            let Ok(receiver) = Address::from_slice(&arguments[3]) else {
                return VmOutput::failure(ReturnCode::UserError, "invalid receiver");
            };
            let nonce = arguments[1].iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b));
            (nonce, BigInt::from_bytes_be(Sign::Plus, &arguments[2]), receiver, &arguments[4..])
        } else {
            (0, BigInt::from_bytes_be(Sign::Plus, &arguments[1]), input.recipient, &arguments[2..])
        };
        let sender = input.vm_input.caller;

        {
            let mut state = self.state.write();
            let from = state.tokens.entry((sender, token_id.clone(), nonce)).or_default();
            if *from < value {
                return VmOutput::failure(ReturnCode::OutOfFunds, "insufficient funds");
            }
            *from -= &value;
            *state.tokens.entry((receiver, token_id, nonce)).or_default() += &value;
        }

        let gas_remaining = input.vm_input.gas_provided - DCDT_BUILTIN_COST;
        let mut output = VmOutput {
            gas_remaining,
            ..Default::default()
        };
        if let Some((function, arguments)) = call.split_first() {
            if self.is_smart_contract(&receiver) {
                let function = String::from_utf8_lossy(function);
                let mut account = OutputAccount::new(receiver);
                account.output_transfers.push(OutputTransfer {
                    value: BigInt::zero(),
                    gas_limit: gas_remaining,
                    gas_locked: 0,
                    data: encode_call_data(&function, arguments),
                    call_type: CallType::DcdtTransferAndExecute,
                    sender,
                });
                output.output_accounts.insert(receiver, account);
            }
        }
        output
    }
}

impl Default for MockWorld {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockchainHook for MockWorld {
    fn new_address(&self, creator: &Address, creator_nonce: u64, vm_type: &[u8]) -> Result<Address, HookError> {
        Ok(Address::new_contract_address(creator, creator_nonce, vm_type))
    }

    fn get_user_account(&self, address: &Address) -> Result<Option<UserAccount>, HookError> {
        Ok(self.account(address))
    }

    fn get_storage_data(&self, address: &Address, key: &[u8]) -> Result<Vec<u8>, HookError> {
        Ok(self.storage(address, key))
    }

    fn get_shard_of_address(&self, address: &Address) -> u32 {
        address.shard_id(self.num_shards)
    }

    fn is_smart_contract(&self, address: &Address) -> bool {
        address.is_smart_contract_address()
            || self
                .state
                .read()
                .accounts
                .get(address)
                .map(UserAccount::is_contract)
                .unwrap_or(false)
    }

    fn is_payable(&self, address: &Address) -> Result<bool, HookError> {
        Ok(self
            .account(address)
            .map(|account| account.code_metadata.payable)
            .unwrap_or(false))
    }

    fn process_builtin_function(&self, input: &CallInput) -> Result<VmOutput, HookError> {
        match input.function.as_str() {
            DCDT_TRANSFER_FUNCTION_NAME | DCDT_NFT_TRANSFER_FUNCTION_NAME => Ok(self.process_dcdt_transfer(input)),
            other => Err(HookError::new(format!("unknown built-in function {}", other))),
        }
    }

    fn builtin_function_names(&self) -> BTreeSet<String> {
        [DCDT_TRANSFER_FUNCTION_NAME, DCDT_NFT_TRANSFER_FUNCTION_NAME]
            .into_iter()
            .map(String::from)
            .collect()
    }

    fn get_dcdt_token(&self, address: &Address, token_id: &[u8], nonce: u64) -> Result<DcdtToken, HookError> {
        Ok(DcdtToken {
            value: self.dcdt_balance(address, token_id, nonce),
            nonce,
            attributes: Vec::new(),
        })
    }

    fn current_block(&self) -> BlockInfo {
        self.state.read().current_block.clone()
    }

    fn last_block(&self) -> BlockInfo {
        let current = self.current_block();
        BlockInfo {
            nonce: current.nonce.saturating_sub(1),
            round: current.round.saturating_sub(1),
            ..current
        }
    }

    fn get_block_hash(&self, nonce: u64) -> Result<Vec<u8>, HookError> {
        Ok(blake3::hash(&nonce.to_be_bytes()).as_bytes().to_vec())
    }

    fn state_root_hash(&self) -> Vec<u8> {
        vec![0u8; 32]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kchain_types::StorageUpdate;

    fn addr(b: u8) -> Address {
        Address::from_bytes([b; 32])
    }

    #[test]
    fn test_dcdt_transfer_moves_tokens() {
        let world = MockWorld::new();
        world.set_dcdt_balance(&addr(1), b"TKN", 0, 100);

        let input = CallInput::new(addr(1), addr(2), DCDT_TRANSFER_FUNCTION_NAME, 5_000)
            .with_arguments(vec![b"TKN".to_vec(), vec![40]]);
        let output = world.process_builtin_function(&input).unwrap();

        assert!(output.is_ok());
        assert_eq!(output.gas_remaining, 5_000 - DCDT_BUILTIN_COST);
        assert_eq!(world.dcdt_balance(&addr(1), b"TKN", 0), BigInt::from(60));
        assert_eq!(world.dcdt_balance(&addr(2), b"TKN", 0), BigInt::from(40));
    }

    #[test]
    fn test_dcdt_transfer_insufficient_funds() {
        let world = MockWorld::new();
        let input = CallInput::new(addr(1), addr(2), DCDT_TRANSFER_FUNCTION_NAME, 5_000)
            .with_arguments(vec![b"TKN".to_vec(), vec![1]]);
        let output = world.process_builtin_function(&input).unwrap();
        assert_eq!(output.return_code, ReturnCode::OutOfFunds);
    }

    #[test]
    fn test_apply_output() {
        let world = MockWorld::new();
        world.put_account(UserAccount::new(addr(1), 10));

        let mut account = OutputAccount::new(addr(1));
        account.balance_delta = BigInt::from(-4);
        account.nonce = 2;
        account.storage_updates.insert(
            b"k".to_vec(),
            StorageUpdate {
                offset: b"k".to_vec(),
                data: b"v".to_vec(),
            },
        );
        let mut output = VmOutput::new();
        output.output_accounts.insert(addr(1), account);
        world.apply_output(&output);

        let stored = world.account(&addr(1)).unwrap();
        assert_eq!(stored.balance, BigInt::from(6));
        assert_eq!(stored.nonce, 2);
        assert_eq!(world.storage(&addr(1), b"k"), b"v".to_vec());
    }
}
