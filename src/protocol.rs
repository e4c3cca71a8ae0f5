//! Protocol parser, validator and response encoding for FileVault
//!
//! A request is a single line `VERB KEY [PAYLOAD]`. The verb and key are
//! split off at the first two delimiters; whatever follows the second
//! delimiter is the payload, taken verbatim with any embedded whitespace.

use crate::error::{FileVaultError, ParseError, Result, StoreError, ValidationError};
use nom::{
    bytes::complete::{take_till1, take_while_m_n},
    combinator::{all_consuming, opt, rest},
    sequence::{preceded, tuple},
    IResult,
};
use std::fmt;
use std::str;

/// Longest key accepted, leaving room for the `.txt` suffix and temp-file
/// decorations inside a 255-byte file name.
pub const MAX_KEY_LEN: usize = 200;

/// Verbs understood by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Insert,
    Select,
}

impl Verb {
    /// Match a verb token case-insensitively
    pub fn from_token(token: &str) -> Option<Self> {
        if token.eq_ignore_ascii_case("INSERT") {
            Some(Verb::Insert)
        } else if token.eq_ignore_ascii_case("SELECT") {
            Some(Verb::Select)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Insert => "INSERT",
            Verb::Select => "SELECT",
        }
    }
}

/// A request split into its fields but not yet checked
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawCommand {
    pub verb: String,
    pub key: String,
    pub payload: Option<Vec<u8>>,
}

/// A validated command, ready to run against the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Insert { key: String, content: Vec<u8> },
    Select { key: String },
}

impl Command {
    pub fn verb(&self) -> Verb {
        match self {
            Command::Insert { .. } => Verb::Insert,
            Command::Select { .. } => Verb::Select,
        }
    }

    pub fn key(&self) -> &str {
        match self {
            Command::Insert { key, .. } | Command::Select { key } => key,
        }
    }
}

/// Error kinds reported to clients on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Malformed,
    UnknownVerb,
    InvalidKey,
    MissingPayload,
    IoFailure,
    Timeout,
    TooLarge,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Malformed => "MALFORMED",
            ErrorCode::UnknownVerb => "UNKNOWN_VERB",
            ErrorCode::InvalidKey => "INVALID_KEY",
            ErrorCode::MissingPayload => "MISSING_PAYLOAD",
            ErrorCode::IoFailure => "IO_FAILURE",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::TooLarge => "TOO_LARGE",
        }
    }

    pub fn from_wire(code: &str) -> Option<Self> {
        let code = match code {
            "MALFORMED" => ErrorCode::Malformed,
            "UNKNOWN_VERB" => ErrorCode::UnknownVerb,
            "INVALID_KEY" => ErrorCode::InvalidKey,
            "MISSING_PAYLOAD" => ErrorCode::MissingPayload,
            "IO_FAILURE" => ErrorCode::IoFailure,
            "TIMEOUT" => ErrorCode::Timeout,
            "TOO_LARGE" => ErrorCode::TooLarge,
            _ => return None,
        };
        Some(code)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Response types from the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Ok,
    Value(Vec<u8>),
    NotFound,
    Error { code: ErrorCode, message: String },
}

impl Response {
    pub fn error(code: ErrorCode, message: impl fmt::Display) -> Self {
        Response::Error {
            code,
            message: message.to_string(),
        }
    }

    /// Serialize response to bytes for network transmission
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Response::Ok => b"OK\r\n".to_vec(),
            Response::Value(content) => {
                let mut out = Vec::with_capacity(content.len() + 8);
                out.extend_from_slice(b"VALUE ");
                out.extend_from_slice(content);
                out.extend_from_slice(b"\r\n");
                out
            }
            Response::NotFound => b"NOT_FOUND\r\n".to_vec(),
            Response::Error { code, message } => {
                format!("ERROR {} {}\r\n", code, message).into_bytes()
            }
        }
    }

    /// Decode a response as sent by [`Response::to_bytes`]
    pub fn parse(input: &[u8]) -> Result<Self> {
        let line = input
            .strip_suffix(b"\r\n")
            .or_else(|| input.strip_suffix(b"\n"))
            .unwrap_or(input);

        if line == b"OK" {
            return Ok(Response::Ok);
        }
        if line == b"NOT_FOUND" {
            return Ok(Response::NotFound);
        }
        if let Some(content) = line.strip_prefix(b"VALUE ") {
            return Ok(Response::Value(content.to_vec()));
        }
        if let Some(rest) = line.strip_prefix(b"ERROR ") {
            let rest = String::from_utf8_lossy(rest);
            let (code, message) = rest.split_once(' ').unwrap_or((&*rest, ""));
            let code = ErrorCode::from_wire(code).ok_or_else(|| {
                FileVaultError::Protocol(format!("Unknown error code: {}", code))
            })?;
            return Ok(Response::error(code, message));
        }

        Err(FileVaultError::Protocol(format!(
            "Unknown response format: {}",
            String::from_utf8_lossy(line)
        )))
    }
}

impl From<ParseError> for Response {
    fn from(err: ParseError) -> Self {
        Response::error(err.code(), err)
    }
}

impl From<ValidationError> for Response {
    fn from(err: ValidationError) -> Self {
        Response::error(err.code(), err)
    }
}

impl From<StoreError> for Response {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(_) => Response::NotFound,
            err @ StoreError::IoFailure { .. } => Response::error(ErrorCode::IoFailure, err),
        }
    }
}

/// Split a raw request into verb, key and optional payload
pub fn parse_command(input: &[u8]) -> std::result::Result<RawCommand, ParseError> {
    let line = strip_line_ending(input);
    if line.is_empty() {
        return Err(ParseError::Malformed("empty command"));
    }

    let (_, (verb, key, payload)) = command_parser(line)
        .map_err(|_| ParseError::Malformed("expected VERB KEY [PAYLOAD]"))?;

    let verb = str::from_utf8(verb).map_err(|_| ParseError::Malformed("verb is not UTF-8"))?;
    let key = str::from_utf8(key).map_err(|_| ParseError::Malformed("key is not UTF-8"))?;

    Ok(RawCommand {
        verb: verb.to_string(),
        key: key.to_string(),
        payload: payload.filter(|p| !p.is_empty()).map(<[u8]>::to_vec),
    })
}

/// Check a parsed request and turn it into a [`Command`]
pub fn validate_command(raw: RawCommand) -> std::result::Result<Command, ValidationError> {
    let verb = Verb::from_token(&raw.verb).ok_or(ValidationError::UnknownVerb(raw.verb))?;

    if !is_valid_key(&raw.key) {
        return Err(ValidationError::InvalidKey(raw.key));
    }

    match verb {
        Verb::Insert => {
            let content = raw.payload.ok_or(ValidationError::MissingPayload)?;
            Ok(Command::Insert {
                key: raw.key,
                content,
            })
        }
        // Anything after a SELECT key is ignored.
        Verb::Select => Ok(Command::Select { key: raw.key }),
    }
}

/// A key is usable as a file name in the data directory
pub fn is_valid_key(key: &str) -> bool {
    !key.is_empty()
        && key.len() <= MAX_KEY_LEN
        && !key.starts_with('.')
        && !key
            .chars()
            .any(|c| c == '/' || c == '\\' || c.is_control() || c.is_whitespace())
}

fn strip_line_ending(input: &[u8]) -> &[u8] {
    let end = input
        .iter()
        .rposition(|&b| b != b'\r' && b != b'\n')
        .map_or(0, |i| i + 1);
    &input[..end]
}

fn is_delimiter(c: u8) -> bool {
    c == b' ' || c == b'\t'
}

fn token(input: &[u8]) -> IResult<&[u8], &[u8]> {
    take_till1(is_delimiter)(input)
}

fn delimiter(input: &[u8]) -> IResult<&[u8], &[u8]> {
    take_while_m_n(1, 1, is_delimiter)(input)
}

/// VERB <delim> KEY [<delim> PAYLOAD...]
fn command_parser(input: &[u8]) -> IResult<&[u8], (&[u8], &[u8], Option<&[u8]>)> {
    all_consuming(tuple((
        token,
        preceded(delimiter, token),
        opt(preceded(delimiter, rest)),
    )))(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_and_validate(input: &[u8]) -> std::result::Result<Command, String> {
        let raw = parse_command(input).map_err(|e| e.to_string())?;
        validate_command(raw).map_err(|e| e.to_string())
    }

    #[test]
    fn test_parse_insert_keeps_payload_spaces() {
        let raw = parse_command(b"INSERT 12345678 Jane  Doe \r\n").unwrap();
        assert_eq!(raw.verb, "INSERT");
        assert_eq!(raw.key, "12345678");
        assert_eq!(raw.payload, Some(b"Jane  Doe ".to_vec()));
    }

    #[test]
    fn test_parse_select_without_payload() {
        let raw = parse_command(b"select 42\n").unwrap();
        assert_eq!(
            raw,
            RawCommand {
                verb: "select".to_string(),
                key: "42".to_string(),
                payload: None,
            }
        );
    }

    #[test]
    fn test_parse_rejects_missing_fields() {
        assert_eq!(
            parse_command(b"\r\n"),
            Err(ParseError::Malformed("empty command"))
        );
        assert!(parse_command(b"INSERT\n").is_err());
        assert!(parse_command(b"INSERT \n").is_err());
        assert!(parse_command(b" INSERT 42 x\n").is_err());
        assert!(parse_command(b"INSERT  42 x\n").is_err());
    }

    #[test]
    fn test_parse_rejects_non_utf8_key() {
        assert!(parse_command(b"SELECT \xff\xfe\n").is_err());
    }

    #[test]
    fn test_payload_bytes_are_verbatim() {
        let raw = parse_command(b"INSERT k \xff\x00abc\n").unwrap();
        assert_eq!(raw.payload, Some(b"\xff\x00abc".to_vec()));
    }

    #[test]
    fn test_validate_verbs_case_insensitively() {
        assert_eq!(
            parse_and_validate(b"InSeRt 1 a b").unwrap(),
            Command::Insert {
                key: "1".to_string(),
                content: b"a b".to_vec()
            }
        );
        assert_eq!(
            parse_and_validate(b"SELECT 1 ignored").unwrap(),
            Command::Select {
                key: "1".to_string()
            }
        );
    }

    #[test]
    fn test_validate_rejects_unknown_verb() {
        let raw = parse_command(b"DELETE 1").unwrap();
        assert_eq!(
            validate_command(raw),
            Err(ValidationError::UnknownVerb("DELETE".to_string()))
        );
    }

    #[test]
    fn test_validate_rejects_unsafe_keys() {
        for key in ["../etc", "a/b", "a\\b", ".", "..", ".hidden"] {
            let raw = RawCommand {
                verb: "SELECT".to_string(),
                key: key.to_string(),
                payload: None,
            };
            assert_eq!(
                validate_command(raw),
                Err(ValidationError::InvalidKey(key.to_string())),
                "key {:?} should be rejected",
                key
            );
        }
        assert!(!is_valid_key(&"9".repeat(MAX_KEY_LEN + 1)));
        assert!(is_valid_key(&"9".repeat(MAX_KEY_LEN)));
    }

    #[test]
    fn test_validate_requires_insert_payload() {
        let raw = parse_command(b"INSERT 1 \n").unwrap();
        assert_eq!(validate_command(raw), Err(ValidationError::MissingPayload));
    }

    #[test]
    fn test_response_serialization() {
        assert_eq!(Response::Ok.to_bytes(), b"OK\r\n");
        assert_eq!(
            Response::Value(b"Jane Doe".to_vec()).to_bytes(),
            b"VALUE Jane Doe\r\n"
        );
        assert_eq!(Response::NotFound.to_bytes(), b"NOT_FOUND\r\n");
        assert_eq!(
            Response::error(ErrorCode::Timeout, "too slow").to_bytes(),
            b"ERROR TIMEOUT too slow\r\n"
        );
    }

    #[test]
    fn test_response_parse() {
        assert_eq!(Response::parse(b"OK\r\n").unwrap(), Response::Ok);
        assert_eq!(Response::parse(b"NOT_FOUND\r\n").unwrap(), Response::NotFound);
        assert_eq!(
            Response::parse(b"VALUE Jane Doe\r\n").unwrap(),
            Response::Value(b"Jane Doe".to_vec())
        );
        assert_eq!(
            Response::parse(b"ERROR INVALID_KEY invalid key \"a/b\"\r\n").unwrap(),
            Response::error(ErrorCode::InvalidKey, "invalid key \"a/b\"")
        );
        assert!(Response::parse(b"This is a test string from server!\n").is_err());
        assert!(Response::parse(b"ERROR NOPE what\r\n").is_err());
    }

    #[test]
    fn test_rejected_tokens_stay_on_one_line() {
        for request in [&b"SELECT a\rb\n"[..], b"SEL\rECT 1\n", b"INSERT k\r\rx payload\n"] {
            let raw = parse_command(request).unwrap();
            let response = Response::from(validate_command(raw).unwrap_err());

            let bytes = response.to_bytes();
            assert!(bytes.ends_with(b"\r\n"));
            let body = &bytes[..bytes.len() - 2];
            assert!(
                !body.contains(&b'\r') && !body.contains(&b'\n'),
                "reply {:?} spans lines",
                String::from_utf8_lossy(&bytes)
            );
            assert_eq!(Response::parse(&bytes).unwrap(), response);
        }

        let raw = parse_command(b"SELECT a\rb\n").unwrap();
        assert_eq!(
            Response::from(validate_command(raw).unwrap_err()),
            Response::error(ErrorCode::InvalidKey, "invalid key \"a\\rb\"")
        );
    }

    #[test]
    fn test_store_errors_map_to_responses() {
        assert_eq!(
            Response::from(StoreError::NotFound("1".to_string())),
            Response::NotFound
        );
        let io = StoreError::IoFailure {
            key: "1".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        };
        assert!(matches!(
            Response::from(io),
            Response::Error {
                code: ErrorCode::IoFailure,
                ..
            }
        ));
    }
}
