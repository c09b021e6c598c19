//! Token generation for shared files.
//!
//! A token is the public handle of a file and the key of its blob, so it
//! has to be unguessable: 8 symbols drawn uniformly from base62 using the
//! operating system's CSPRNG. Uniqueness is not guaranteed here; the
//! metadata store's unique constraint catches the rare collision.

use thiserror::Error;

/// Number of symbols in a token.
pub const TOKEN_LEN: usize = 8;

/// Digits, then upper case, then lower case.
pub const TOKEN_ALPHABET: &[u8; 62] =
    b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Bytes at or above this value are rejected so that `byte % 62` stays uniform.
const REJECTION_BOUND: u8 = (256 - 256 % TOKEN_ALPHABET.len()) as u8;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("secure random source unavailable: {0}")]
    RandomSource(getrandom::Error),
}

pub type TokenResult<T> = Result<T, TokenError>;

/// Generate a fresh token from the OS random source.
///
/// Fails instead of falling back to a weaker generator.
pub fn new_token() -> TokenResult<String> {
    token_from_source(getrandom::getrandom)
}

/// Build a token from an arbitrary byte source using rejection sampling.
fn token_from_source<F>(mut fill: F) -> TokenResult<String>
where
    F: FnMut(&mut [u8]) -> Result<(), getrandom::Error>,
{
    let mut token = String::with_capacity(TOKEN_LEN);
    let mut buf = [0u8; TOKEN_LEN * 2];

    while token.len() < TOKEN_LEN {
        fill(&mut buf).map_err(TokenError::RandomSource)?;
        for &byte in buf.iter().filter(|&&b| b < REJECTION_BOUND) {
            if token.len() == TOKEN_LEN {
                break;
            }
            token.push(TOKEN_ALPHABET[byte as usize % TOKEN_ALPHABET.len()] as char);
        }
    }

    Ok(token)
}

/// Cheap shape check: right length, base62 only. Does not imply existence.
pub fn is_well_formed(token: &str) -> bool {
    token.len() == TOKEN_LEN && token.bytes().all(|b| b.is_ascii_alphanumeric())
}
