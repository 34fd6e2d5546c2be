//! Call data codec: `function@hexArg1@hexArg2...`.

use crate::error::VmError;

pub const ARG_SEPARATOR: char = '@';

/// Split call data into its function name and decoded arguments.
pub fn parse_call_data(data: &[u8]) -> Result<(String, Vec<Vec<u8>>), VmError> {
    let text = std::str::from_utf8(data).map_err(|_| VmError::InvalidCallData("not utf-8".into()))?;
    let mut tokens = text.split(ARG_SEPARATOR);

    let function = tokens.next().unwrap_or_default();
    if function.is_empty() {
        return Err(VmError::InvalidCallData("empty function name".into()));
    }

    let arguments = tokens
        .map(|token| hex::decode(token).map_err(|e| VmError::InvalidCallData(e.to_string())))
        .collect::<Result<Vec<_>, _>>()?;

    Ok((function.to_string(), arguments))
}

/// Encode a function call as call data.
pub fn encode_call_data(function: &str, arguments: &[Vec<u8>]) -> Vec<u8> {
    let mut data = function.to_string();
    for argument in arguments {
        data.push(ARG_SEPARATOR);
        data.push_str(&hex::encode(argument));
    }
    data.into_bytes()
}

/// Hex form with an even number of digits, as used in callback data.
pub fn even_hex(value: u64) -> String {
    let digits = format!("{:x}", value);
    if digits.len() % 2 == 1 {
        format!("0{}", digits)
    } else {
        digits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_call_data() {
        let (function, args) = parse_call_data(b"transfer@0102@ff").unwrap();
        assert_eq!(function, "transfer");
        assert_eq!(args, vec![vec![1, 2], vec![0xff]]);

        let (function, args) = parse_call_data(b"ping").unwrap();
        assert_eq!(function, "ping");
        assert!(args.is_empty());
    }

    #[test]
    fn test_empty_argument() {
        let (_, args) = parse_call_data(b"f@@01").unwrap();
        assert_eq!(args, vec![vec![], vec![1]]);
    }

    #[test]
    fn test_parse_rejects_bad_data() {
        assert!(parse_call_data(b"").is_err());
        assert!(parse_call_data(b"@01").is_err());
        assert!(parse_call_data(b"f@0").is_err());
        assert!(parse_call_data(b"f@zz").is_err());
    }

    #[test]
    fn test_encode_call_data() {
        let data = encode_call_data("accept", &[b"TKN".to_vec(), vec![0x0a]]);
        assert_eq!(data, b"accept@544b4e@0a".to_vec());
        assert_eq!(parse_call_data(&data).unwrap().1[0], b"TKN".to_vec());
    }

    #[test]
    fn test_even_hex() {
        assert_eq!(even_hex(0), "00");
        assert_eq!(even_hex(4), "04");
        assert_eq!(even_hex(0x1ab), "01ab");
    }
}
