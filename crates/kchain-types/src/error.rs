use thiserror::Error;

/// Errors that can occur in type operations.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TypesError {
    #[error("Invalid address format: {0}")]
    InvalidAddressFormat(String),

    #[error("Invalid address length: expected 32, got {0}")]
    InvalidAddressLength(usize),

    #[error("Invalid code metadata length: expected 2, got {0}")]
    InvalidCodeMetadataLength(usize),

    #[error("Unknown call type: {0}")]
    UnknownCallType(u8),

    #[error("Hex decoding error: {0}")]
    HexError(String),

    #[error("Bech32 error: {0}")]
    Bech32Error(String),
}

impl From<hex::FromHexError> for TypesError {
    fn from(e: hex::FromHexError) -> Self {
        TypesError::HexError(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TypesError::InvalidAddressLength(20);
        assert_eq!(err.to_string(), "Invalid address length: expected 32, got 20");
    }

    #[test]
    fn test_from_hex_error() {
        let err: TypesError = hex::decode("zz").unwrap_err().into();
        assert!(matches!(err, TypesError::HexError(_)));
    }
}
