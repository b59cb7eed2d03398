// This file is part of the bstore blob store.
//
// For the full copyright and license information, please view the LICENSE
// file that was distributed with this source code.

//! The wire request grammar and its byte-oriented parser.
//!
//! A request is a single line:
//!
//! ```text
//! verb[ algorithm[:digest]]\r?\n
//! ```
//!
//! The parser consumes exactly one request from a byte stream fed to it in
//! arbitrary chunks. Bytes arriving in the same chunk behind the newline —
//! the scan-ahead — are not consumed; they belong to the verb's payload.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::udig::{self, UdigError};

pub const MAX_VERB_LEN: usize = 5;

/// The fixed verb vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Get,
    Put,
    Give,
    Take,
    Eat,
    Wrap,
    Roll,
}

impl Verb {
    pub const ALL: [Verb; 7] = [
        Verb::Get,
        Verb::Put,
        Verb::Give,
        Verb::Take,
        Verb::Eat,
        Verb::Wrap,
        Verb::Roll,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Verb::Get => "get",
            Verb::Put => "put",
            Verb::Give => "give",
            Verb::Take => "take",
            Verb::Eat => "eat",
            Verb::Wrap => "wrap",
            Verb::Roll => "roll",
        }
    }

    /// Bit selecting this verb in the audit record mask.
    ///
    /// Bit 0x80 is reserved for a `cat` verb the wire grammar does not
    /// carry.
    pub fn mask_bit(&self) -> u8 {
        match self {
            Verb::Get => 0x01,
            Verb::Take => 0x02,
            Verb::Put => 0x04,
            Verb::Give => 0x08,
            Verb::Eat => 0x10,
            Verb::Wrap => 0x20,
            Verb::Roll => 0x40,
        }
    }

    /// Does this verb carry a udig on the request line? (`wrap` does not.)
    pub fn wants_udig(&self) -> bool {
        !matches!(self, Verb::Wrap)
    }
}

impl FromStr for Verb {
    type Err = ();

    fn from_str(s: &str) -> Result<Verb, ()> {
        Verb::ALL
            .into_iter()
            .find(|v| v.name() == s)
            .ok_or(())
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A completed request line. The algorithm and digest are raw grammar-level
/// strings; module resolution happens above the parser so an unknown
/// algorithm is reported as a client error, not a parse error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub verb: Verb,
    pub algorithm: Option<String>,
    pub digest: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("verb: non alpha character: 0x{0:02x}")]
    BadVerbChar(u8),
    #[error("too many characters in verb")]
    BigVerb,
    #[error("unknown verb: {0:?}")]
    UnknownVerb(String),
    #[error("algorithm: first character can't be a digit: 0x{0:02x}")]
    BadAlgorithmStart(u8),
    #[error("algorithm: non alphanumeric character: 0x{0:02x}")]
    BadAlgorithmChar(u8),
    #[error("too many characters in algorithm")]
    BigAlgorithm,
    #[error("digest: unprintable character: 0x{0:02x}")]
    BadDigestChar(u8),
    #[error("too many characters in digest")]
    BigDigest,
    #[error("new-line expected after carriage return: 0x{0:02x}")]
    BadCarriageReturn(u8),
    #[error("{0}")]
    BadUdig(#[from] UdigError),
    #[error("verb {0} requires a udig")]
    MissingUdig(Verb),
    #[error("verb {0} takes no udig")]
    UnexpectedUdig(Verb),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    ScanVerb,
    ScanAlgorithm,
    ScanDigest,
    ScanNewLine,
    Halt,
}

/// Incremental parser for one request line.
#[derive(Debug)]
pub struct RequestParser {
    state: State,
    verb: String,
    algorithm: String,
    digest: String,
}

impl Default for RequestParser {
    fn default() -> Self {
        RequestParser::new()
    }
}

impl RequestParser {
    pub fn new() -> RequestParser {
        RequestParser {
            state: State::ScanVerb,
            verb: String::new(),
            algorithm: String::new(),
            digest: String::new(),
        }
    }

    /// Feed a chunk. Returns the number of bytes consumed and, once the
    /// terminating newline has been seen, the completed request. Bytes
    /// beyond the newline are left unconsumed for the caller to hand to
    /// the verb machine.
    pub fn feed(&mut self, buf: &[u8]) -> Result<(usize, Option<Request>), WireError> {
        let mut consumed = 0;
        for &c in buf {
            consumed += 1;
            match self.state {
                State::ScanVerb => match c {
                    b' ' => self.state = State::ScanAlgorithm,
                    b'\n' => self.state = State::Halt,
                    b'\r' => self.state = State::ScanNewLine,
                    c if c.is_ascii_alphabetic() => {
                        if self.verb.len() == MAX_VERB_LEN {
                            return Err(WireError::BigVerb);
                        }
                        self.verb.push(c as char);
                    }
                    c => return Err(WireError::BadVerbChar(c)),
                },
                State::ScanAlgorithm => match c {
                    b':' => self.state = State::ScanDigest,
                    b'\n' => self.state = State::Halt,
                    b'\r' => self.state = State::ScanNewLine,
                    c if c.is_ascii_lowercase() || c.is_ascii_digit() => {
                        if self.algorithm.is_empty() && c.is_ascii_digit() {
                            return Err(WireError::BadAlgorithmStart(c));
                        }
                        if self.algorithm.len() == udig::MAX_ALGORITHM_LEN {
                            return Err(WireError::BigAlgorithm);
                        }
                        self.algorithm.push(c as char);
                    }
                    c => return Err(WireError::BadAlgorithmChar(c)),
                },
                State::ScanDigest => match c {
                    b'\n' => self.state = State::Halt,
                    b'\r' => self.state = State::ScanNewLine,
                    c if c.is_ascii_graphic() => {
                        if self.digest.len() == udig::MAX_DIGEST_LEN {
                            return Err(WireError::BigDigest);
                        }
                        self.digest.push(c as char);
                    }
                    c => return Err(WireError::BadDigestChar(c)),
                },
                State::ScanNewLine => {
                    if c != b'\n' {
                        return Err(WireError::BadCarriageReturn(c));
                    }
                    self.state = State::Halt;
                }
                State::Halt => unreachable!("fed past halt"),
            }
            if self.state == State::Halt {
                return Ok((consumed, Some(self.complete()?)));
            }
        }
        Ok((consumed, None))
    }

    fn complete(&mut self) -> Result<Request, WireError> {
        let verb: Verb = self
            .verb
            .parse()
            .map_err(|()| WireError::UnknownVerb(std::mem::take(&mut self.verb)))?;

        let saw_algorithm = !self.algorithm.is_empty() || !self.digest.is_empty();
        if verb.wants_udig() {
            if !saw_algorithm || self.digest.is_empty() {
                return Err(WireError::MissingUdig(verb));
            }
            // enforce the 32..=128 digest envelope and the algorithm
            // grammar exactly once, through the udig frisker
            udig::Udig::new(&self.algorithm, &self.digest)?;
            Ok(Request {
                verb,
                algorithm: Some(std::mem::take(&mut self.algorithm)),
                digest: Some(std::mem::take(&mut self.digest)),
            })
        } else {
            if saw_algorithm {
                return Err(WireError::UnexpectedUdig(verb));
            }
            Ok(Request {
                verb,
                algorithm: None,
                digest: None,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(input: &[u8]) -> Result<(Request, Vec<u8>), WireError> {
        let mut parser = RequestParser::new();
        let (consumed, request) = parser.feed(input)?;
        let request = request.expect("incomplete request");
        Ok((request, input[consumed..].to_vec()))
    }

    const SHA_EMPTY: &str = "da39a3ee5e6b4b0d3255bfef95601890afd80709";

    #[test]
    fn get_request() {
        let (request, rest) = parse_all(format!("get sha:{SHA_EMPTY}\n").as_bytes()).unwrap();
        assert_eq!(request.verb, Verb::Get);
        assert_eq!(request.algorithm.as_deref(), Some("sha"));
        assert_eq!(request.digest.as_deref(), Some(SHA_EMPTY));
        assert!(rest.is_empty());
    }

    #[test]
    fn crlf_termination() {
        let (request, _) = parse_all(format!("eat sha:{SHA_EMPTY}\r\n").as_bytes()).unwrap();
        assert_eq!(request.verb, Verb::Eat);
    }

    #[test]
    fn wrap_takes_no_udig() {
        let (request, _) = parse_all(b"wrap\n").unwrap();
        assert_eq!(request.verb, Verb::Wrap);
        assert_eq!(request.algorithm, None);
        assert_eq!(
            parse_all(format!("wrap sha:{SHA_EMPTY}\n").as_bytes()),
            Err(WireError::UnexpectedUdig(Verb::Wrap))
        );
    }

    #[test]
    fn scan_ahead_is_preserved() {
        let (request, rest) =
            parse_all(format!("put sha:{SHA_EMPTY}\nhello\n").as_bytes()).unwrap();
        assert_eq!(request.verb, Verb::Put);
        assert_eq!(rest, b"hello\n");
    }

    #[test]
    fn request_split_across_reads() {
        let line = format!("take sha:{SHA_EMPTY}\n");
        let bytes = line.as_bytes();
        let mut parser = RequestParser::new();
        let (n, request) = parser.feed(&bytes[..7]).unwrap();
        assert_eq!(n, 7);
        assert!(request.is_none());
        let (_, request) = parser.feed(&bytes[7..]).unwrap();
        assert_eq!(request.unwrap().verb, Verb::Take);
    }

    #[test]
    fn bad_bytes_name_the_offender() {
        assert_eq!(
            parse_all(b"g3t sha:x\n"),
            Err(WireError::BadVerbChar(b'3'))
        );
        assert_eq!(
            parse_all(format!("get 9ha:{SHA_EMPTY}\n").as_bytes()),
            Err(WireError::BadAlgorithmStart(b'9'))
        );
        assert_eq!(
            parse_all(b"get sha:da39\x07\n"),
            Err(WireError::BadDigestChar(0x07))
        );
        assert_eq!(
            parse_all(b"get sha:da39\rX"),
            Err(WireError::BadCarriageReturn(b'X'))
        );
    }

    #[test]
    fn verb_and_field_limits() {
        assert_eq!(parse_all(b"getget x\n"), Err(WireError::BigVerb));
        assert_eq!(
            parse_all(format!("get abcdefghi:{SHA_EMPTY}\n").as_bytes()),
            Err(WireError::BigAlgorithm)
        );
        let long = "a".repeat(129);
        assert_eq!(
            parse_all(format!("get sha:{long}\n").as_bytes()),
            Err(WireError::BigDigest)
        );
        let short = "a".repeat(31);
        assert!(matches!(
            parse_all(format!("get sha:{short}\n").as_bytes()),
            Err(WireError::BadUdig(_))
        ));
    }

    #[test]
    fn unknown_verb_is_rejected() {
        assert!(matches!(
            parse_all(format!("cat sha:{SHA_EMPTY}\n").as_bytes()),
            Err(WireError::UnknownVerb(_))
        ));
    }

    #[test]
    fn mask_bits_are_distinct() {
        let mut seen = 0u8;
        for verb in Verb::ALL {
            assert_eq!(seen & verb.mask_bit(), 0);
            seen |= verb.mask_bit();
        }
        assert_eq!(seen, 0x7f);
    }
}
