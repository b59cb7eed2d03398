// This file is part of the bstore blob store.
//
// For the full copyright and license information, please view the LICENSE
// file that was distributed with this source code.

//! Uniform digests: the printable `algorithm:digest` identity of a blob.
//!
//! The grammar is independent of the recognised modules — an audit record
//! must round-trip even when it names an algorithm this build does not
//! carry — so a [`Udig`] stores the algorithm by name and resolves it to a
//! module on demand.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::digest::Algorithm;

pub const MAX_ALGORITHM_LEN: usize = 8;
pub const MIN_DIGEST_LEN: usize = 32;
pub const MAX_DIGEST_LEN: usize = 128;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UdigError {
    #[error("no colon between algorithm and digest")]
    MissingColon,
    #[error("algorithm not [a-z][a-z0-9]{{0,7}}: {0:?}")]
    BadAlgorithm(String),
    #[error("digest length {0} not in {MIN_DIGEST_LEN}..={MAX_DIGEST_LEN}")]
    BadDigestLength(usize),
    #[error("non graphic ascii character in digest: 0x{0:02x}")]
    BadDigestChar(u8),
}

/// Is `name` a well-formed algorithm name?
pub fn is_algorithm_name(name: &str) -> bool {
    let b = name.as_bytes();
    !b.is_empty()
        && b.len() <= MAX_ALGORITHM_LEN
        && b[0].is_ascii_lowercase()
        && b.iter()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
}

fn frisk_digest(digest: &str) -> Result<(), UdigError> {
    if !(MIN_DIGEST_LEN..=MAX_DIGEST_LEN).contains(&digest.len()) {
        return Err(UdigError::BadDigestLength(digest.len()));
    }
    match digest.bytes().find(|c| !c.is_ascii_graphic()) {
        Some(c) => Err(UdigError::BadDigestChar(c)),
        None => Ok(()),
    }
}

/// A parsed, grammatically valid uniform digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Udig {
    algorithm: String,
    digest: String,
}

impl Udig {
    /// Build a udig from already-separated parts, enforcing the grammar.
    pub fn new(algorithm: &str, digest: &str) -> Result<Udig, UdigError> {
        if !is_algorithm_name(algorithm) {
            return Err(UdigError::BadAlgorithm(algorithm.into()));
        }
        frisk_digest(digest)?;
        Ok(Udig {
            algorithm: algorithm.into(),
            digest: digest.into(),
        })
    }

    /// The well-known udig of the empty blob for a module.
    pub fn empty(algorithm: Algorithm) -> Udig {
        Udig {
            algorithm: algorithm.name().into(),
            digest: algorithm.empty_digest().into(),
        }
    }

    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Resolve the algorithm name to an installed module.
    pub fn module(&self) -> Option<Algorithm> {
        Algorithm::from_name(&self.algorithm)
    }

    /// Does the digest satisfy the resolved module's alphabet?
    /// `false` when the module is unknown.
    pub fn is_syntactic(&self) -> bool {
        self.module()
            .is_some_and(|m| m.is_syntactic(&self.digest))
    }

    /// Is this the well-known empty udig of its module?
    pub fn is_empty_blob(&self) -> bool {
        self.module()
            .is_some_and(|m| m.is_empty_digest(&self.digest))
    }
}

impl FromStr for Udig {
    type Err = UdigError;

    fn from_str(s: &str) -> Result<Udig, UdigError> {
        let (algorithm, digest) = s.split_once(':').ok_or(UdigError::MissingColon)?;
        Udig::new(algorithm, digest)
    }
}

impl fmt::Display for Udig {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.digest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHA_EMPTY: &str = "sha:da39a3ee5e6b4b0d3255bfef95601890afd80709";

    #[test]
    fn parse_format_round_trip() {
        let udig: Udig = SHA_EMPTY.parse().unwrap();
        assert_eq!(udig.algorithm(), "sha");
        assert_eq!(udig.module(), Some(Algorithm::Sha));
        assert!(udig.is_syntactic());
        assert!(udig.is_empty_blob());
        assert_eq!(udig.to_string(), SHA_EMPTY);
    }

    #[test]
    fn unknown_algorithm_still_parses() {
        let udig: Udig = "zz9:0123456789abcdef0123456789abcdef".parse().unwrap();
        assert_eq!(udig.module(), None);
        assert!(!udig.is_syntactic());
    }

    #[test]
    fn grammar_violations() {
        assert_eq!(
            "shada39a3ee".parse::<Udig>(),
            Err(UdigError::MissingColon)
        );
        assert!(matches!(
            "Sha:da39a3ee5e6b4b0d3255bfef95601890afd80709".parse::<Udig>(),
            Err(UdigError::BadAlgorithm(_))
        ));
        assert!(matches!(
            "toolongname:da39a3ee5e6b4b0d3255bfef95601890afd80709".parse::<Udig>(),
            Err(UdigError::BadAlgorithm(_))
        ));
        assert_eq!(
            "sha:da39a3ee".parse::<Udig>(),
            Err(UdigError::BadDigestLength(8))
        );
        let long = "a".repeat(129);
        assert_eq!(
            format!("sha:{long}").parse::<Udig>(),
            Err(UdigError::BadDigestLength(129))
        );
        assert_eq!(
            format!("sha:{}", "a".repeat(31) + " ").parse::<Udig>(),
            Err(UdigError::BadDigestChar(b' '))
        );
    }
}
