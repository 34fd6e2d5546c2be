//! Contract storage on top of world state and pending updates.

use crate::blockchain_hook::BlockchainHook;
use crate::contexts::output::OutputContext;
use crate::error::VmError;
use crate::gas_schedule::BaseOperationCost;
use crate::state_stack::StateStack;
use kchain_types::{Address, StorageUpdate};

/// Effect of a storage write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageStatus {
    Unchanged,
    Modified,
    Added,
    Deleted,
}

impl StorageStatus {
    /// ABI code returned to contracts
    pub fn as_i32(&self) -> i32 {
        match self {
            StorageStatus::Unchanged => 0,
            StorageStatus::Modified => 1,
            StorageStatus::Added => 2,
            StorageStatus::Deleted => 3,
        }
    }
}

/// A storage write and the gas it costs or frees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageWrite {
    pub status: StorageStatus,
    pub gas_used: u64,
    pub gas_freed: u64,
}

impl StorageWrite {
    fn unchanged() -> Self {
        Self {
            status: StorageStatus::Unchanged,
            gas_used: 0,
            gas_freed: 0,
        }
    }
}

#[derive(Debug)]
pub struct StorageContext {
    address: Address,
    protected_key_prefix: Vec<u8>,
    state_stack: Vec<Address>,
}

impl StorageContext {
    pub fn new(protected_key_prefix: impl Into<Vec<u8>>) -> Self {
        Self {
            address: Address::ZERO,
            protected_key_prefix: protected_key_prefix.into(),
            state_stack: Vec::new(),
        }
    }

    pub fn set_address(&mut self, address: Address) {
        self.address = address;
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn is_protected_key(&self, key: &[u8]) -> bool {
        key.starts_with(&self.protected_key_prefix)
    }

    /// Read a key of the current contract. Keys longer than an address are
    /// charged per extra byte.
    pub fn get_storage(
        &self,
        output: &OutputContext,
        hook: &dyn BlockchainHook,
        costs: &BaseOperationCost,
        key: &[u8],
    ) -> (Vec<u8>, u64) {
        let extra_bytes = key.len().saturating_sub(Address::LEN) as u64;
        let gas = costs.data_copy_per_byte.saturating_mul(extra_bytes);
        (self.get_storage_unmetered(output, hook, &self.address, key), gas)
    }

    /// Read a key of another contract, allowed only if it is readable.
    pub fn get_storage_from_address(
        &self,
        output: &OutputContext,
        hook: &dyn BlockchainHook,
        address: &Address,
        key: &[u8],
    ) -> Vec<u8> {
        if address != &self.address {
            let readable = match hook.get_user_account(address) {
                Ok(Some(account)) => account.code_metadata.readable,
                _ => false,
            };
            if !readable {
                return Vec::new();
            }
        }
        self.get_storage_unmetered(output, hook, address, key)
    }

    pub fn get_storage_unmetered(
        &self,
        output: &OutputContext,
        hook: &dyn BlockchainHook,
        address: &Address,
        key: &[u8],
    ) -> Vec<u8> {
        if let Some(update) = output.storage_update(address, key) {
            return update.data.clone();
        }
        hook.get_storage_data(address, key).unwrap_or_else(|e| {
            tracing::debug!(error = %e, "storage read failed");
            Vec::new()
        })
    }

    /// Write a key of the current contract. Protected keys are rejected.
    pub fn set_storage(
        &self,
        output: &mut OutputContext,
        hook: &dyn BlockchainHook,
        costs: &BaseOperationCost,
        read_only: bool,
        key: &[u8],
        value: &[u8],
    ) -> Result<StorageWrite, VmError> {
        if self.is_protected_key(key) {
            return Err(VmError::StoreReservedKey);
        }
        Ok(self.write(output, hook, costs, read_only, key, value))
    }

    /// Write a key without the protected prefix check, for host bookkeeping.
    pub fn set_protected_storage(
        &self,
        output: &mut OutputContext,
        hook: &dyn BlockchainHook,
        costs: &BaseOperationCost,
        key: &[u8],
        value: &[u8],
    ) -> StorageWrite {
        self.write(output, hook, costs, false, key, value)
    }

    fn write(
        &self,
        output: &mut OutputContext,
        hook: &dyn BlockchainHook,
        costs: &BaseOperationCost,
        read_only: bool,
        key: &[u8],
        value: &[u8],
    ) -> StorageWrite {
        if read_only {
            return StorageWrite::unchanged();
        }

        let old_value = self.get_storage_unmetered(output, hook, &self.address, key);
        let new_len = value.len() as u64;
        let old_len = old_value.len() as u64;

        if old_value == value {
            return StorageWrite {
                status: StorageStatus::Unchanged,
                gas_used: costs.data_copy_per_byte.saturating_mul(new_len),
                gas_freed: 0,
            };
        }

        output.output_account_mut(&self.address).storage_updates.insert(
            key.to_vec(),
            StorageUpdate {
                offset: key.to_vec(),
                data: value.to_vec(),
            },
        );

        if old_value.is_empty() {
            return StorageWrite {
                status: StorageStatus::Added,
                gas_used: costs.store_per_byte.saturating_mul(new_len),
                gas_freed: 0,
            };
        }
        if value.is_empty() {
            return StorageWrite {
                status: StorageStatus::Deleted,
                gas_used: 0,
                gas_freed: costs.release_per_byte.saturating_mul(old_len),
            };
        }

        let (gas_used, gas_freed) = if new_len > old_len {
            let persist = costs.persist_per_byte.saturating_mul(old_len);
            let store = costs.store_per_byte.saturating_mul(new_len - old_len);
            (persist.saturating_add(store), 0)
        } else if new_len < old_len {
            (
                costs.persist_per_byte.saturating_mul(new_len),
                costs.release_per_byte.saturating_mul(old_len - new_len),
            )
        } else {
            (costs.persist_per_byte.saturating_mul(new_len), 0)
        };

        StorageWrite {
            status: StorageStatus::Modified,
            gas_used,
            gas_freed,
        }
    }
}

impl StateStack for StorageContext {
    fn init_state(&mut self) {}

    fn push_state(&mut self) {
        self.state_stack.push(self.address);
    }

    fn pop_set_active_state(&mut self) {
        if let Some(address) = self.state_stack.pop() {
            self.address = address;
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gas_schedule::GasSchedule;
    use crate::mock::MockWorld;
    use kchain_types::{CodeMetadata, UserAccount};

    fn addr(b: u8) -> Address {
        Address::from_bytes([b; 32])
    }

    fn costs() -> BaseOperationCost {
        BaseOperationCost {
            store_per_byte: 10,
            release_per_byte: 3,
            data_copy_per_byte: 1,
            persist_per_byte: 2,
            ..GasSchedule::default().base_operation_cost
        }
    }

    fn setup() -> (MockWorld, OutputContext, StorageContext) {
        let world = MockWorld::new();
        world.set_storage(&addr(1), b"existing", b"abcd");
        let mut storage = StorageContext::new("KCHAIN");
        storage.set_address(addr(1));
        (world, OutputContext::new(), storage)
    }

    #[test]
    fn test_add_then_read_back() {
        let (world, mut output, storage) = setup();
        let write = storage
            .set_storage(&mut output, &world, &costs(), false, b"key", b"val")
            .unwrap();
        assert_eq!(write, StorageWrite { status: StorageStatus::Added, gas_used: 30, gas_freed: 0 });

        let (value, gas) = storage.get_storage(&output, &world, &costs(), b"key");
        assert_eq!(value, b"val".to_vec());
        assert_eq!(gas, 0);
    }

    #[test]
    fn test_write_statuses() {
        let (world, mut output, storage) = setup();
        let costs = costs();

        let same = storage.set_storage(&mut output, &world, &costs, false, b"existing", b"abcd").unwrap();
        assert_eq!(same.status, StorageStatus::Unchanged);
        assert_eq!(same.gas_used, 4);

        let grow = storage.set_storage(&mut output, &world, &costs, false, b"existing", b"abcdef").unwrap();
        assert_eq!(grow, StorageWrite { status: StorageStatus::Modified, gas_used: 4 * 2 + 2 * 10, gas_freed: 0 });

        let shrink = storage.set_storage(&mut output, &world, &costs, false, b"existing", b"ab").unwrap();
        assert_eq!(shrink, StorageWrite { status: StorageStatus::Modified, gas_used: 4, gas_freed: 4 * 3 });

        let equal = storage.set_storage(&mut output, &world, &costs, false, b"existing", b"xy").unwrap();
        assert_eq!(equal, StorageWrite { status: StorageStatus::Modified, gas_used: 4, gas_freed: 0 });

        let deleted = storage.set_storage(&mut output, &world, &costs, false, b"existing", b"").unwrap();
        assert_eq!(deleted, StorageWrite { status: StorageStatus::Deleted, gas_used: 0, gas_freed: 6 });
    }

    #[test]
    fn test_read_only_write_is_ignored() {
        let (world, mut output, storage) = setup();
        let write = storage.set_storage(&mut output, &world, &costs(), true, b"key", b"val").unwrap();
        assert_eq!(write.status, StorageStatus::Unchanged);
        assert!(output.storage_update(&addr(1), b"key").is_none());
    }

    #[test]
    fn test_protected_keys() {
        let (world, mut output, storage) = setup();
        assert_eq!(
            storage.set_storage(&mut output, &world, &costs(), false, b"KCHAINasync", b"1"),
            Err(VmError::StoreReservedKey)
        );
        let write = storage.set_protected_storage(&mut output, &world, &costs(), b"KCHAINasync", b"1");
        assert_eq!(write.status, StorageStatus::Added);
    }

    #[test]
    fn test_long_keys_cost_extra() {
        let (world, output, storage) = setup();
        let key = vec![7u8; Address::LEN + 5];
        let (_, gas) = storage.get_storage(&output, &world, &costs(), &key);
        assert_eq!(gas, 5);
    }

    #[test]
    fn test_read_other_contract() {
        let (world, output, storage) = setup();
        let readable = addr(2);
        let hidden = addr(3);
        world.put_account(
            UserAccount::new_contract(readable, b"code".to_vec(), addr(9)).with_metadata(CodeMetadata {
                readable: true,
                ..Default::default()
            }),
        );
        world.put_account(UserAccount::new_contract(hidden, b"code".to_vec(), addr(9)));
        world.set_storage(&readable, b"k", b"visible");
        world.set_storage(&hidden, b"k", b"secret");

        assert_eq!(storage.get_storage_from_address(&output, &world, &readable, b"k"), b"visible".to_vec());
        assert!(storage.get_storage_from_address(&output, &world, &hidden, b"k").is_empty());
    }

    #[test]
    fn test_address_stack() {
        let (_, _, mut storage) = setup();
        storage.push_state();
        storage.set_address(addr(5));
        storage.pop_set_active_state();
        assert_eq!(storage.address(), &addr(1));
    }
}
