use crate::address::Address;
use crate::code_metadata::CodeMetadata;
use num_bigint::BigInt;

/// Account state as seen by the world hook.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct UserAccount {
    pub address: Address,
    pub nonce: u64,
    pub balance: BigInt,
    /// Contract code (empty for user accounts)
    pub code: Vec<u8>,
    pub code_metadata: CodeMetadata,
    /// Deployer of the contract, allowed to upgrade it
    pub owner: Option<Address>,
}

impl UserAccount {
    /// Create a new user account with given balance
    pub fn new(address: Address, balance: impl Into<BigInt>) -> Self {
        Self {
            address,
            balance: balance.into(),
            ..Default::default()
        }
    }

    /// Create a contract account
    pub fn new_contract(address: Address, code: Vec<u8>, owner: Address) -> Self {
        Self {
            address,
            code,
            owner: Some(owner),
            ..Default::default()
        }
    }

    pub fn with_metadata(mut self, code_metadata: CodeMetadata) -> Self {
        self.code_metadata = code_metadata;
        self
    }

    pub fn with_nonce(mut self, nonce: u64) -> Self {
        self.nonce = nonce;
        self
    }

    pub fn is_contract(&self) -> bool {
        !self.code.is_empty()
    }

    pub fn is_owned_by(&self, address: &Address) -> bool {
        self.owner.as_ref() == Some(address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_account_kinds() {
        let user = UserAccount::new(Address::from_bytes([1u8; 32]), 100);
        assert!(!user.is_contract());

        let owner = Address::from_bytes([2u8; 32]);
        let contract = UserAccount::new_contract(Address::from_bytes([3u8; 32]), b"code".to_vec(), owner);
        assert!(contract.is_contract());
        assert!(contract.is_owned_by(&owner));
        assert!(!contract.is_owned_by(&user.address));
    }
}
