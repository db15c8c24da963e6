//! Just enough of the contract ABI to read and write registry event data:
//! static words (addresses, unsigned integers, hashes) and dynamic strings.

use alloy_primitives::{Address, B256, U256};
use incubed_core::keccak256;
use thiserror::Error;

const WORD: usize = 32;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AbiError {
    #[error("ABI data too short: need {need} bytes at offset {offset}, have {len}")]
    OutOfBounds { offset: usize, need: usize, len: usize },

    #[error("ABI word {index} does not fit {ty}: 0x{word}")]
    Overflow {
        index: usize,
        ty: &'static str,
        word: String,
    },

    #[error("ABI string at word {index} is not UTF-8")]
    InvalidString { index: usize },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Token {
    Address(Address),
    Uint(U256),
    Word(B256),
    String(String),
}

impl From<Address> for Token {
    fn from(a: Address) -> Self {
        Token::Address(a)
    }
}

impl From<U256> for Token {
    fn from(v: U256) -> Self {
        Token::Uint(v)
    }
}

impl From<u64> for Token {
    fn from(v: u64) -> Self {
        Token::Uint(U256::from(v))
    }
}

/// topic0 of an event.
pub fn event_topic(signature: &str) -> B256 {
    keccak256(signature.as_bytes())
}

/// Left-pad an address into a topic or word.
pub fn address_word(address: &Address) -> B256 {
    B256::left_padding_from(address.as_slice())
}

/// Encode a tuple: static heads first, string tails after.
pub fn encode(tokens: &[Token]) -> Vec<u8> {
    let mut head = Vec::with_capacity(tokens.len() * WORD);
    let mut tail = Vec::new();
    for token in tokens {
        match token {
            Token::Address(a) => head.extend_from_slice(address_word(a).as_slice()),
            Token::Uint(v) => head.extend_from_slice(&v.to_be_bytes::<32>()),
            Token::Word(w) => head.extend_from_slice(w.as_slice()),
            Token::String(s) => {
                let offset = tokens.len() * WORD + tail.len();
                head.extend_from_slice(&U256::from(offset).to_be_bytes::<32>());
                tail.extend_from_slice(&U256::from(s.len()).to_be_bytes::<32>());
                tail.extend_from_slice(s.as_bytes());
                let padding = (WORD - s.len() % WORD) % WORD;
                tail.extend(std::iter::repeat(0u8).take(padding));
            }
        }
    }
    head.extend_from_slice(&tail);
    head
}

/// Reads head words of ABI-encoded data by position.
pub struct Decoder<'a> {
    data: &'a [u8],
}

impl<'a> Decoder<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    fn slice(&self, offset: usize, need: usize) -> Result<&'a [u8], AbiError> {
        let out_of_bounds = AbiError::OutOfBounds {
            offset,
            need,
            len: self.data.len(),
        };
        let end = offset.checked_add(need).ok_or_else(|| out_of_bounds.clone())?;
        self.data.get(offset..end).ok_or(out_of_bounds)
    }

    fn raw(&self, index: usize) -> Result<&'a [u8], AbiError> {
        self.slice(index * WORD, WORD)
    }

    pub fn word(&self, index: usize) -> Result<B256, AbiError> {
        Ok(B256::from_slice(self.raw(index)?))
    }

    pub fn uint(&self, index: usize) -> Result<U256, AbiError> {
        Ok(U256::from_be_slice(self.raw(index)?))
    }

    pub fn u64(&self, index: usize) -> Result<u64, AbiError> {
        let value = self.uint(index)?;
        u64::try_from(value).map_err(|_| self.overflow(index, "uint64"))
    }

    pub fn address(&self, index: usize) -> Result<Address, AbiError> {
        let raw = self.raw(index)?;
        if raw[..12].iter().any(|b| *b != 0) {
            return Err(self.overflow(index, "address"));
        }
        Ok(Address::from_slice(&raw[12..]))
    }

    pub fn string(&self, index: usize) -> Result<String, AbiError> {
        let offset = usize::try_from(self.uint(index)?).map_err(|_| self.overflow(index, "offset"))?;
        let len_word = U256::from_be_slice(self.slice(offset, WORD)?);
        let len = usize::try_from(len_word).map_err(|_| self.overflow(index, "length"))?;
        let bytes = self.slice(offset + WORD, len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| AbiError::InvalidString { index })
    }

    fn overflow(&self, index: usize, ty: &'static str) -> AbiError {
        let word = self.raw(index).map(hex::encode).unwrap_or_default();
        AbiError::Overflow { index, ty, word }
    }
}
