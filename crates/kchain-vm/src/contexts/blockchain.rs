//! World state as seen by the executing contracts: the world hook overlaid
//! with the changes accumulated in the output.

use crate::blockchain_hook::{BlockInfo, BlockchainHook, DcdtToken};
use crate::contexts::output::OutputContext;
use crate::error::VmError;
use kchain_types::Address;
use num_bigint::BigInt;
use std::sync::Arc;

pub struct BlockchainContext {
    hook: Arc<dyn BlockchainHook>,
    vm_type: [u8; 2],
}

impl BlockchainContext {
    pub fn new(hook: Arc<dyn BlockchainHook>, vm_type: [u8; 2]) -> Self {
        Self { hook, vm_type }
    }

    pub fn hook(&self) -> &dyn BlockchainHook {
        self.hook.as_ref()
    }

    /// Address of the next contract deployed by `creator`.
    pub fn new_address(&self, output: &mut OutputContext, creator: &Address) -> Result<Address, VmError> {
        let nonce = self.get_nonce(output, creator)?;
        let nonce = nonce.saturating_sub(1);
        self.hook
            .new_address(creator, nonce, &self.vm_type)
            .map_err(|e| VmError::BlockchainHook(e.to_string()))
    }

    pub fn account_exists(&self, address: &Address) -> bool {
        matches!(self.hook.get_user_account(address), Ok(Some(_)))
    }

    pub fn get_balance(&self, output: &mut OutputContext, address: &Address) -> BigInt {
        output.balance_of(self.hook(), address)
    }

    /// Nonce of `address`, loading it from the world on first use.
    pub fn get_nonce(&self, output: &mut OutputContext, address: &Address) -> Result<u64, VmError> {
        if let Some(account) = output.output_account(address) {
            if account.nonce > 0 {
                return Ok(account.nonce);
            }
        }
        let nonce = match self.hook.get_user_account(address) {
            Ok(Some(account)) => account.nonce,
            Ok(None) => 0,
            Err(e) => return Err(VmError::BlockchainHook(e.to_string())),
        };
        output.output_account_mut(address).nonce = nonce;
        Ok(nonce)
    }

    pub fn increase_nonce(&self, output: &mut OutputContext, address: &Address) -> Result<(), VmError> {
        let nonce = self.get_nonce(output, address)?;
        output.output_account_mut(address).nonce = nonce.saturating_add(1);
        Ok(())
    }

    /// Code of a contract, preferring code deployed in this transaction.
    pub fn get_code(&self, output: &OutputContext, address: &Address) -> Result<Vec<u8>, VmError> {
        if let Some(account) = output.output_account(address) {
            if !account.code.is_empty() {
                return Ok(account.code.clone());
            }
        }
        let code = self.hook.get_code(address).unwrap_or_default();
        if code.is_empty() {
            return Err(VmError::ContractNotFound);
        }
        Ok(code)
    }

    pub fn get_code_size(&self, output: &OutputContext, address: &Address) -> u64 {
        self.get_code(output, address).map(|code| code.len() as u64).unwrap_or(0)
    }

    pub fn owner_address(&self, address: &Address) -> Result<Address, VmError> {
        match self.hook.get_user_account(address) {
            Ok(Some(account)) => Ok(account.owner.unwrap_or(Address::ZERO)),
            Ok(None) => Err(VmError::NilContract),
            Err(e) => Err(VmError::BlockchainHook(e.to_string())),
        }
    }

    pub fn is_smart_contract(&self, address: &Address) -> bool {
        self.hook.is_smart_contract(address)
    }

    pub fn shard_of_address(&self, address: &Address) -> u32 {
        self.hook.get_shard_of_address(address)
    }

    pub fn in_same_shard(&self, a: &Address, b: &Address) -> bool {
        self.shard_of_address(a) == self.shard_of_address(b)
    }

    pub fn get_dcdt_token(&self, address: &Address, token_id: &[u8], nonce: u64) -> Result<DcdtToken, VmError> {
        self.hook
            .get_dcdt_token(address, token_id, nonce)
            .map_err(|e| VmError::BlockchainHook(e.to_string()))
    }

    pub fn current_block(&self) -> BlockInfo {
        self.hook.current_block()
    }

    pub fn last_block(&self) -> BlockInfo {
        self.hook.last_block()
    }

    pub fn block_hash(&self, nonce: u64) -> Vec<u8> {
        self.hook.get_block_hash(nonce).unwrap_or_default()
    }

    pub fn state_root_hash(&self) -> Vec<u8> {
        self.hook.state_root_hash()
    }
}

impl std::fmt::Debug for BlockchainContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockchainContext")
            .field("vm_type", &self.vm_type)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockWorld;
    use kchain_types::UserAccount;

    fn addr(b: u8) -> Address {
        Address::from_bytes([b; 32])
    }

    fn setup() -> (Arc<MockWorld>, BlockchainContext) {
        let world = Arc::new(MockWorld::new());
        world.put_account(UserAccount::new(addr(1), 500).with_nonce(3));
        let blockchain = BlockchainContext::new(world.clone(), [5, 0]);
        (world, blockchain)
    }

    #[test]
    fn test_new_address_uses_previous_nonce() {
        let (_, blockchain) = setup();
        let mut output = OutputContext::new();
        let address = blockchain.new_address(&mut output, &addr(1)).unwrap();
        assert_eq!(address, Address::new_contract_address(&addr(1), 2, &[5, 0]));
    }

    #[test]
    fn test_nonce_accumulates_in_output() {
        let (_, blockchain) = setup();
        let mut output = OutputContext::new();
        blockchain.increase_nonce(&mut output, &addr(1)).unwrap();
        blockchain.increase_nonce(&mut output, &addr(1)).unwrap();
        assert_eq!(blockchain.get_nonce(&mut output, &addr(1)).unwrap(), 5);
        assert_eq!(blockchain.get_nonce(&mut output, &addr(9)).unwrap(), 0);
    }

    #[test]
    fn test_code_lookup() {
        let (world, blockchain) = setup();
        let mut output = OutputContext::new();
        assert_eq!(blockchain.get_code(&output, &addr(2)), Err(VmError::ContractNotFound));

        world.put_account(UserAccount::new_contract(addr(2), b"world".to_vec(), addr(1)));
        assert_eq!(blockchain.get_code(&output, &addr(2)).unwrap(), b"world".to_vec());

        output.output_account_mut(&addr(2)).code = b"fresh".to_vec();
        assert_eq!(blockchain.get_code(&output, &addr(2)).unwrap(), b"fresh".to_vec());
        assert_eq!(blockchain.get_code_size(&output, &addr(2)), 5);
    }

    #[test]
    fn test_balance_includes_delta() {
        let (_, blockchain) = setup();
        let mut output = OutputContext::new();
        output.add_tx_value_to_account(&addr(1), &BigInt::from(20));
        assert_eq!(blockchain.get_balance(&mut output, &addr(1)), BigInt::from(520));
        assert!(blockchain.account_exists(&addr(1)));
        assert!(!blockchain.account_exists(&addr(4)));
    }
}
