use crate::error::TypesError;
use std::fmt;
use std::str::FromStr;

/// 32-byte account address.
/// Display format: Bech32m with "kc" human-readable prefix.
///
/// Smart contract addresses start with [`Address::SC_PREFIX_LEN`] zero bytes
/// followed by the two-byte VM type. The last byte of every address decides
/// its shard.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address([u8; 32]);

impl Address {
    pub const ZERO: Self = Self([0u8; 32]);
    pub const LEN: usize = 32;

    /// Bech32m human-readable prefix
    pub const BECH32_HRP: &'static str = "kc";

    /// Number of leading zero bytes that mark a contract address
    pub const SC_PREFIX_LEN: usize = 8;

    /// Bytes reserved for the VM type, right after the zero prefix
    pub const VM_TYPE_LEN: usize = 2;

    /// Trailing creator bytes kept in a contract address so it stays in the
    /// creator's shard
    const SHARD_SUFFIX_LEN: usize = 2;

    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Create from a byte slice
    pub fn from_slice(slice: &[u8]) -> Result<Self, TypesError> {
        if slice.len() != Self::LEN {
            return Err(TypesError::InvalidAddressLength(slice.len()));
        }
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(slice);
        Ok(Self(bytes))
    }

    /// Derive the address of a contract deployed by `creator` at `nonce`.
    ///
    /// `blake3(creator || nonce_le)` fills the middle of the address; the
    /// last two bytes are copied from the creator.
    pub fn new_contract_address(creator: &Address, nonce: u64, vm_type: &[u8]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&creator.0);
        hasher.update(&nonce.to_le_bytes());
        let digest = hasher.finalize();

        let mut bytes = [0u8; 32];
        let vm_start = Self::SC_PREFIX_LEN;
        let hash_start = vm_start + Self::VM_TYPE_LEN;
        let suffix_start = Self::LEN - Self::SHARD_SUFFIX_LEN;

        for (i, b) in vm_type.iter().take(Self::VM_TYPE_LEN).enumerate() {
            bytes[vm_start + i] = *b;
        }
        bytes[hash_start..suffix_start]
            .copy_from_slice(&digest.as_bytes()[..suffix_start - hash_start]);
        bytes[suffix_start..].copy_from_slice(&creator.0[suffix_start..]);
        Self(bytes)
    }

    /// Check if this is the zero address
    pub fn is_zero(&self) -> bool {
        self == &Self::ZERO
    }

    /// Check whether the address has the smart contract layout
    pub fn is_smart_contract_address(&self) -> bool {
        !self.is_zero() && self.0[..Self::SC_PREFIX_LEN].iter().all(|&b| b == 0)
    }

    /// Shard of this address for a network of `num_shards` shards.
    ///
    /// Takes as many low bits of the last byte as are needed to number the
    /// shards; ids past the last shard fold back by dropping the top bit.
    pub fn shard_id(&self, num_shards: u32) -> u32 {
        if num_shards <= 1 {
            return 0;
        }

        let bits = u32::BITS - (num_shards - 1).leading_zeros();
        let mask_high = (1u32 << bits) - 1;
        let mask_low = (1u32 << (bits - 1)) - 1;

        let last = u32::from(self.0[Self::LEN - 1]);
        let shard = last & mask_high;
        if shard > num_shards - 1 {
            last & mask_low
        } else {
            shard
        }
    }

    /// Convert to hex string without 0x prefix
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hrp = bech32::Hrp::parse_unchecked(Self::BECH32_HRP);
        match bech32::encode::<bech32::Bech32m>(hrp, &self.0) {
            Ok(encoded) => write!(f, "{}", encoded),
            Err(_) => Err(fmt::Error),
        }
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address(0x{})", hex::encode(self.0))
    }
}

impl fmt::LowerHex for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl FromStr for Address {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Support both Bech32m ("kc1...") and hex ("0x...")
        if s.starts_with("kc1") {
            let (hrp, data) = bech32::decode(s).map_err(|e| TypesError::Bech32Error(e.to_string()))?;

            let expected_hrp = bech32::Hrp::parse_unchecked(Self::BECH32_HRP);
            if hrp != expected_hrp {
                return Err(TypesError::InvalidAddressFormat(format!(
                    "Invalid HRP: expected '{}', got '{}'",
                    Self::BECH32_HRP,
                    hrp
                )));
            }

            Self::from_slice(&data)
        } else if s.starts_with("0x") || s.starts_with("0X") {
            let bytes = hex::decode(&s[2..])?;
            Self::from_slice(&bytes)
        } else {
            Err(TypesError::InvalidAddressFormat(s.to_string()))
        }
    }
}

impl AsRef<[u8]> for Address {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn addr_with_last(last: u8) -> Address {
        let mut bytes = [7u8; 32];
        bytes[31] = last;
        Address::from_bytes(bytes)
    }

    #[test]
    fn test_address_zero() {
        assert_eq!(Address::ZERO.as_bytes(), &[0u8; 32]);
        assert!(Address::ZERO.is_zero());
        assert!(!Address::ZERO.is_smart_contract_address());
    }

    #[test]
    fn test_address_from_slice() {
        assert!(Address::from_slice(&[1u8; 32]).is_ok());
        assert_eq!(
            Address::from_slice(&[1u8; 20]),
            Err(TypesError::InvalidAddressLength(20))
        );
    }

    #[test]
    fn test_contract_address_layout() {
        let creator = addr_with_last(0x03);
        let sc = Address::new_contract_address(&creator, 5, &[5, 0]);

        assert!(sc.is_smart_contract_address());
        assert_eq!(sc.as_bytes()[8], 5);
        assert_eq!(sc.as_bytes()[30..], creator.as_bytes()[30..]);
        assert_eq!(sc.shard_id(3), creator.shard_id(3));

        // Deterministic, nonce-sensitive
        assert_eq!(sc, Address::new_contract_address(&creator, 5, &[5, 0]));
        assert_ne!(sc, Address::new_contract_address(&creator, 6, &[5, 0]));
    }

    #[test]
    fn test_shard_id_single_shard() {
        assert_eq!(addr_with_last(0xff).shard_id(1), 0);
    }

    #[test]
    fn test_shard_id_folds_back() {
        // 3 shards need 2 bits; id 3 folds to 1
        assert_eq!(addr_with_last(0b00).shard_id(3), 0);
        assert_eq!(addr_with_last(0b01).shard_id(3), 1);
        assert_eq!(addr_with_last(0b10).shard_id(3), 2);
        assert_eq!(addr_with_last(0b11).shard_id(3), 1);
    }

    #[test]
    fn test_address_bech32m_roundtrip() {
        let addr = addr_with_last(9);
        let encoded = addr.to_string();
        assert!(encoded.starts_with("kc1"));
        let decoded: Address = encoded.parse().unwrap();
        assert_eq!(addr, decoded);
    }

    #[test]
    fn test_address_from_str_invalid() {
        assert!(Address::from_str("invalid").is_err());
        assert!(Address::from_str("0x1234").is_err());
    }

    proptest! {
        #[test]
        fn prop_shard_id_in_range(last in any::<u8>(), shards in 1u32..64) {
            prop_assert!(addr_with_last(last).shard_id(shards) < shards);
        }
    }
}
