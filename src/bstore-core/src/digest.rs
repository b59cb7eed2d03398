// This file is part of the bstore blob store.
//
// For the full copyright and license information, please view the LICENSE
// file that was distributed with this source code.

// spell-checker:ignore (crates) ripemd (names) skein (digests) bc btc

//! Digest modules.
//!
//! Every blob is identified by the digest of its bytes under one of the
//! recognised algorithms. A module provides an incremental hashing state
//! whose partial value can be cloned cheaply, so a streamed payload can be
//! probed against a target digest after every chunk, plus the syntactic
//! checks and the directory fan-out used by the on-disk store.
//!
//! Three constructions layer over RustCrypto hashers; `sk` uses the
//! in-crate [`crate::skein`] implementation, since that family carries no
//! Skein.

use std::path::PathBuf;

use digest::Digest as _;
use ripemd::Ripemd160;
use sha1::Sha1;
use sha2::Sha256;

use crate::nab;
use crate::skein::Skein512;

/// Digest of the empty blob under `bc160`.
const BC160_EMPTY: &str = "b472a266d0bd89c13706a4132ccfb16f7c3b9fcb";

/// Digest of the empty blob under `btc20`.
const BTC20_EMPTY: &str = "fd7b15dc5dc2039556693555c2b81b36c8deec15";

/// Digest of the empty blob under `sha`.
const SHA_EMPTY: &str = "da39a3ee5e6b4b0d3255bfef95601890afd80709";

/// Digest of the empty blob under `sk`.
const SK_EMPTY: &str = "7W3GlyqKvCUqLw03HHrwZ63l0DGGfSH3zV0xij24Yk3";

/// A recognised digest algorithm.
///
/// The variant order is the frozen module ordering: lexicographic by name,
/// so enumeration through [`Algorithm::ALL`] is reproducible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Algorithm {
    /// RIPEMD160(SHA256(m)), 40 hex characters. Deprecated.
    Bc160,
    /// RIPEMD160(SHA256(SHA256(m))), 40 hex characters.
    Btc20,
    /// SHA-1, 40 hex characters.
    Sha,
    /// Skein-512 with a 256 bit output, 43 nab characters.
    Sk,
}

impl Algorithm {
    /// All modules in the frozen ordering.
    pub const ALL: [Algorithm; 4] = [
        Algorithm::Bc160,
        Algorithm::Btc20,
        Algorithm::Sha,
        Algorithm::Sk,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Algorithm::Bc160 => "bc160",
            Algorithm::Btc20 => "btc20",
            Algorithm::Sha => "sha",
            Algorithm::Sk => "sk",
        }
    }

    /// Look a module up by name.
    pub fn from_name(name: &str) -> Option<Algorithm> {
        match name {
            "bc160" => Some(Algorithm::Bc160),
            "btc20" => Some(Algorithm::Btc20),
            "sha" => Some(Algorithm::Sha),
            "sk" => Some(Algorithm::Sk),
            _ => None,
        }
    }

    /// The well-known digest of the empty blob.
    pub fn empty_digest(&self) -> &'static str {
        match self {
            Algorithm::Bc160 => BC160_EMPTY,
            Algorithm::Btc20 => BTC20_EMPTY,
            Algorithm::Sha => SHA_EMPTY,
            Algorithm::Sk => SK_EMPTY,
        }
    }

    /// Is `digest` syntactically a digest of this algorithm?
    pub fn is_syntactic(&self, digest: &str) -> bool {
        match self {
            Algorithm::Bc160 | Algorithm::Btc20 | Algorithm::Sha => {
                digest.len() == 40
                    && digest
                        .bytes()
                        .all(|c| c.is_ascii_digit() || (b'a'..=b'f').contains(&c))
            }
            Algorithm::Sk => nab::is_nab(digest),
        }
    }

    /// Is `digest` the well-known digest of the empty blob?
    pub fn is_empty_digest(&self, digest: &str) -> bool {
        digest == self.empty_digest()
    }

    /// Begin an incremental digest.
    pub fn hasher(&self) -> Hasher {
        let state = match self {
            Algorithm::Bc160 => State::Bc160(Sha256::new()),
            Algorithm::Btc20 => State::Btc20(Sha256::new()),
            Algorithm::Sha => State::Sha(Sha1::new()),
            Algorithm::Sk => State::Sk(Skein512::new()),
        };
        Hasher { state }
    }

    /// Relative path of the blob file for `digest`, below `data/<name>/`.
    ///
    /// Hex digests fan out over two three-character directories with the
    /// full digest as the file name:
    ///
    /// ```text
    /// 57cd5957fbc764c5ee9862f76287d09d2170b9ef
    /// -> 57c/d59/57cd5957fbc764c5ee9862f76287d09d2170b9ef
    /// ```
    ///
    /// Nab digests fan out over five directories, each level doubling the
    /// length of its parent, with the remaining twelve characters as the
    /// file name:
    ///
    /// ```text
    /// 7WCGlyqKvCSqLw03HHqwZ6Cl0DGGfSK3zV0xij84Yk3
    /// -> 7/WC/Glyq/KvCSqLw0/3HHqwZ6Cl0DGGfSK/3zV0xij84Yk3
    /// ```
    ///
    /// The caller must have checked `is_syntactic` first.
    pub fn fanout(&self, digest: &str) -> PathBuf {
        let mut path = PathBuf::new();
        match self {
            Algorithm::Bc160 | Algorithm::Btc20 | Algorithm::Sha => {
                path.push(&digest[0..3]);
                path.push(&digest[3..6]);
                path.push(digest);
            }
            Algorithm::Sk => {
                path.push(&digest[0..1]);
                path.push(&digest[1..3]);
                path.push(&digest[3..7]);
                path.push(&digest[7..15]);
                path.push(&digest[15..31]);
                path.push(&digest[31..]);
            }
        }
        path
    }
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone)]
enum State {
    Bc160(Sha256),
    Btc20(Sha256),
    Sha(Sha1),
    Sk(Skein512),
}

/// Incremental digest state. Cloning is cheap, which is what makes the
/// per-chunk [`Hasher::probe`] affordable.
#[derive(Clone)]
pub struct Hasher {
    state: State,
}

impl Hasher {
    pub fn update(&mut self, bytes: &[u8]) {
        match &mut self.state {
            State::Bc160(h) | State::Btc20(h) => h.update(bytes),
            State::Sha(h) => h.update(bytes),
            State::Sk(h) => h.update(bytes),
        }
    }

    /// Finish the digest and render the ascii form.
    pub fn finalize(self) -> String {
        match self.state {
            State::Bc160(h) => hex::encode(Ripemd160::digest(h.finalize())),
            State::Btc20(h) => hex::encode(Ripemd160::digest(Sha256::digest(h.finalize()))),
            State::Sha(h) => hex::encode(h.finalize()),
            State::Sk(h) => nab::encode(&h.finalize()),
        }
    }

    /// Would the bytes seen so far produce `target`?
    ///
    /// Finalizes a clone of the running state, leaving the state itself
    /// ready for more input.
    pub fn probe(&self, target: &str) -> bool {
        self.clone().finalize() == target
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frozen_module_ordering() {
        let names: Vec<&str> = Algorithm::ALL.iter().map(|a| a.name()).collect();
        let mut sorted = names.clone();
        sorted.sort_unstable();
        assert_eq!(names, sorted);
    }

    #[test]
    fn sha_known_vectors() {
        let h = Algorithm::Sha.hasher();
        assert_eq!(h.finalize(), SHA_EMPTY);

        let mut h = Algorithm::Sha.hasher();
        h.update(b"hello\n");
        assert_eq!(h.finalize(), "f572d396fae9206628714fb2ce00f72e94f2258f");
    }

    #[test]
    fn probe_tracks_the_stream() {
        let target = {
            let mut h = Algorithm::Sha.hasher();
            h.update(b"hello\n");
            h.finalize()
        };
        let mut h = Algorithm::Sha.hasher();
        h.update(b"hel");
        assert!(!h.probe(&target));
        h.update(b"lo\n");
        assert!(h.probe(&target));
    }

    #[test]
    fn empty_digests_are_syntactic() {
        for algorithm in Algorithm::ALL {
            assert!(algorithm.is_syntactic(algorithm.empty_digest()));
            assert!(algorithm.is_empty_digest(algorithm.empty_digest()));
        }
    }

    #[test]
    fn syntactic_rejects_wrong_alphabet() {
        assert!(!Algorithm::Sha.is_syntactic("DA39A3EE5E6B4B0D3255BFEF95601890AFD80709"));
        assert!(!Algorithm::Sha.is_syntactic("da39a3ee"));
        assert!(!Algorithm::Sk.is_syntactic(SHA_EMPTY));
        assert!(Algorithm::Sk.is_syntactic(SK_EMPTY));
    }

    #[test]
    fn hex_fanout_shape() {
        let path = Algorithm::Sha.fanout("57cd5957fbc764c5ee9862f76287d09d2170b9ef");
        assert_eq!(
            path,
            PathBuf::from("57c/d59/57cd5957fbc764c5ee9862f76287d09d2170b9ef")
        );
    }

    #[test]
    fn nab_fanout_shape() {
        let path = Algorithm::Sk.fanout("7WCGlyqKvCSqLw03HHqwZ6Cl0DGGfSK3zV0xij84Yk3");
        assert_eq!(
            path,
            PathBuf::from("7/WC/Glyq/KvCSqLw0/3HHqwZ6Cl0DGGfSK/3zV0xij84Yk3")
        );
    }

    #[test]
    fn fanout_is_injective_for_distinct_digests() {
        let a = Algorithm::Sha.fanout("57cd5957fbc764c5ee9862f76287d09d2170b9ef");
        let b = Algorithm::Sha.fanout("57cd5957fbc764c5ee9862f76287d09d2170b9ee");
        assert_ne!(a, b);
    }

    #[test]
    fn layered_construction_differs_from_plain() {
        let mut bc = Algorithm::Bc160.hasher();
        let mut btc = Algorithm::Btc20.hasher();
        bc.update(b"hello\n");
        btc.update(b"hello\n");
        let (bc, btc) = (bc.finalize(), btc.finalize());
        assert_ne!(bc, btc);
        assert_eq!(bc.len(), 40);
        assert_eq!(btc.len(), 40);
    }
}
