use crate::error::TypesError;

/// Deployment flags stored next to contract code.
///
/// Encoded as two bytes: the first carries `upgradeable` (0x01) and
/// `readable` (0x04), the second carries `payable` (0x02) and
/// `payable_by_sc` (0x04).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CodeMetadata {
    pub upgradeable: bool,
    pub readable: bool,
    pub payable: bool,
    pub payable_by_sc: bool,
}

impl CodeMetadata {
    pub const LEN: usize = 2;

    const UPGRADEABLE: u8 = 0x01;
    const READABLE: u8 = 0x04;
    const PAYABLE: u8 = 0x02;
    const PAYABLE_BY_SC: u8 = 0x04;

    /// Decode metadata; short input is padded with zero flags.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let first = bytes.first().copied().unwrap_or(0);
        let second = bytes.get(1).copied().unwrap_or(0);
        Self {
            upgradeable: first & Self::UPGRADEABLE != 0,
            readable: first & Self::READABLE != 0,
            payable: second & Self::PAYABLE != 0,
            payable_by_sc: second & Self::PAYABLE_BY_SC != 0,
        }
    }

    /// Strict decoding, used for metadata supplied by callers.
    pub fn try_from_slice(bytes: &[u8]) -> Result<Self, TypesError> {
        if bytes.len() != Self::LEN {
            return Err(TypesError::InvalidCodeMetadataLength(bytes.len()));
        }
        Ok(Self::from_bytes(bytes))
    }

    pub fn to_bytes(&self) -> [u8; 2] {
        let mut bytes = [0u8; 2];
        if self.upgradeable {
            bytes[0] |= Self::UPGRADEABLE;
        }
        if self.readable {
            bytes[0] |= Self::READABLE;
        }
        if self.payable {
            bytes[1] |= Self::PAYABLE;
        }
        if self.payable_by_sc {
            bytes[1] |= Self::PAYABLE_BY_SC;
        }
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_bytes() {
        let meta = CodeMetadata {
            upgradeable: true,
            payable: true,
            ..Default::default()
        };
        assert_eq!(meta.to_bytes(), [0x01, 0x02]);
        assert_eq!(CodeMetadata::from_bytes(&[0x01, 0x02]), meta);
    }

    #[test]
    fn test_metadata_short_input() {
        assert_eq!(CodeMetadata::from_bytes(&[]), CodeMetadata::default());
        assert!(CodeMetadata::from_bytes(&[0x05]).readable);
        assert!(CodeMetadata::try_from_slice(&[0x05]).is_err());
    }
}
