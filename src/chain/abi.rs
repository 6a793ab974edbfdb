//! Minimal ABI encoding for the fact-checker contract
//!
//! Only the handful of shapes the contract uses are supported:
//! `uint256` (values that fit in u128), `address`, `string` and
//! `address[]` in event data.

use sha3::{Digest, Keccak256};

use super::{Address, ChainError, RequestId};

pub const THRESHOLD_REACHED_EVENT: &str = "ThresholdReached(uint256,address[])";
pub const GET_VERIFIER_RESULT: &str = "getVerifierResult(uint256,address)";
pub const SUBMIT_AGGREGATE_RESULT: &str = "submitAggregateResult(uint256,string)";
pub const WITHDRAW_FEES: &str = "withdrawFees()";

const WORD: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Uint(u128),
    Address(Address),
    String(String),
}

pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// 4-byte function selector
pub fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

/// topic0 for an event signature, as a `0x` hex string
pub fn event_topic(signature: &str) -> String {
    format!("0x{}", hex::encode(keccak256(signature.as_bytes())))
}

fn uint_word(value: u128) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[16..].copy_from_slice(&value.to_be_bytes());
    word
}

fn address_word(address: &Address) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[12..].copy_from_slice(&address.to_bytes());
    word
}

/// Encode a call: selector followed by head/tail encoded arguments
pub fn encode_call(signature: &str, tokens: &[Token]) -> Vec<u8> {
    let mut head = Vec::with_capacity(tokens.len() * WORD);
    let mut tail = Vec::new();
    let head_size = tokens.len() * WORD;

    for token in tokens {
        match token {
            Token::Uint(value) => head.extend_from_slice(&uint_word(*value)),
            Token::Address(address) => head.extend_from_slice(&address_word(address)),
            Token::String(text) => {
                head.extend_from_slice(&uint_word((head_size + tail.len()) as u128));
                let bytes = text.as_bytes();
                tail.extend_from_slice(&uint_word(bytes.len() as u128));
                tail.extend_from_slice(bytes);
                let padding = (WORD - bytes.len() % WORD) % WORD;
                tail.extend(std::iter::repeat_n(0u8, padding));
            }
        }
    }

    let mut out = selector(signature).to_vec();
    out.extend(head);
    out.extend(tail);
    out
}

/// `base + extra`, rejecting offsets that overflow
fn offset_add(base: usize, extra: usize) -> Result<usize, ChainError> {
    base.checked_add(extra)
        .ok_or_else(|| ChainError::Decode(format!("offset {} + {} overflows", base, extra)))
}

fn word_at(data: &[u8], offset: usize) -> Result<&[u8], ChainError> {
    let end = offset_add(offset, WORD)?;
    data.get(offset..end)
        .ok_or_else(|| ChainError::Decode(format!("data too short for word at {}", offset)))
}

/// Decode a word as u128, rejecting values that do not fit
pub fn word_to_u128(word: &[u8]) -> Result<u128, ChainError> {
    if word.len() != WORD {
        return Err(ChainError::Decode(format!("word has {} bytes", word.len())));
    }
    if word[..16].iter().any(|b| *b != 0) {
        return Err(ChainError::Decode("uint256 value exceeds u128".to_string()));
    }
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&word[16..]);
    Ok(u128::from_be_bytes(bytes))
}

fn word_to_usize(word: &[u8]) -> Result<usize, ChainError> {
    let value = word_to_u128(word)?;
    usize::try_from(value).map_err(|_| ChainError::Decode("offset out of range".to_string()))
}

fn word_to_address(word: &[u8]) -> Result<Address, ChainError> {
    let mut bytes = [0u8; 20];
    bytes.copy_from_slice(&word[12..]);
    Ok(Address::from_bytes(bytes))
}

/// Decode the return data of a function returning a single `string`
pub fn decode_string(data: &[u8]) -> Result<String, ChainError> {
    let offset = word_to_usize(word_at(data, 0)?)?;
    let len = word_to_usize(word_at(data, offset)?)?;
    let start = offset_add(offset, WORD)?;
    let bytes = data
        .get(start..offset_add(start, len)?)
        .ok_or_else(|| ChainError::Decode("string data truncated".to_string()))?;
    String::from_utf8(bytes.to_vec()).map_err(|e| ChainError::Decode(e.to_string()))
}

fn decode_address_array(data: &[u8], offset: usize) -> Result<Vec<Address>, ChainError> {
    let len = word_to_usize(word_at(data, offset)?)?;
    let mut addresses = Vec::new();
    let mut position = offset;
    for _ in 0..len {
        position = offset_add(position, WORD)?;
        addresses.push(word_to_address(word_at(data, position)?)?);
    }
    Ok(addresses)
}

/// Decode a `ThresholdReached` log.
///
/// `requestId` may be indexed (topics[1]) or carried in the data section.
pub fn decode_threshold_reached(
    topics: &[String],
    data: &[u8],
) -> Result<(RequestId, Vec<Address>), ChainError> {
    if let Some(indexed) = topics.get(1) {
        let word = decode_hex(indexed)?;
        let request_id = RequestId::from_u128(word_to_u128(&word)?);
        let offset = word_to_usize(word_at(data, 0)?)?;
        return Ok((request_id, decode_address_array(data, offset)?));
    }

    let request_id = RequestId::from_u128(word_to_u128(word_at(data, 0)?)?);
    let offset = word_to_usize(word_at(data, WORD)?)?;
    Ok((request_id, decode_address_array(data, offset)?))
}

pub fn decode_hex(raw: &str) -> Result<Vec<u8>, ChainError> {
    let stripped = raw.strip_prefix("0x").unwrap_or(raw);
    hex::decode(stripped).map_err(|e| ChainError::Decode(format!("hex '{}': {}", raw, e)))
}

/// JSON-RPC quantity (`0x`-prefixed, no leading zeros)
pub fn to_quantity(value: u128) -> String {
    format!("0x{:x}", value)
}

pub fn parse_quantity(raw: &str) -> Result<u128, ChainError> {
    let stripped = raw.strip_prefix("0x").unwrap_or(raw);
    if stripped.is_empty() {
        return Ok(0);
    }
    u128::from_str_radix(stripped, 16)
        .map_err(|e| ChainError::Decode(format!("quantity '{}': {}", raw, e)))
}
