// This file is part of the bstore blob store.
//
// For the full copyright and license information, please view the LICENSE
// file that was distributed with this source code.

//! The service driver seam.
//!
//! A driver mirrors the verb state machines from the initiator side of
//! the protocol. Three implementations exist: `bio4` over TCP, `fs`
//! against a store directory, and `cache4` composing the two for reads.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use thiserror::Error;

use bstore_core::brr::ChatLog;
use bstore_core::digest::Algorithm;
use bstore_core::udig::Udig;

/// Blob files written by the client are read-only for owner and group.
pub const OUTPUT_MODE: u32 = 0o440;

/// Client failures, ordered by exit code.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("{0}")]
    BadArg(String),
    #[error("digest: {0}")]
    Digest(String),
    #[error("service: {0}")]
    Service(String),
    #[error(transparent)]
    Os(#[from] io::Error),
}

impl ClientError {
    /// The documented exit codes: 2 bad argument, 16 digest-module
    /// fault, 17 service fault, 18 OS fault.
    pub fn exit_code(&self) -> u8 {
        match self {
            ClientError::BadArg(_) => 2,
            ClientError::Digest(_) => 16,
            ClientError::Service(_) => 17,
            ClientError::Os(_) => 18,
        }
    }
}

/// Where an incoming blob's bytes go.
pub enum Sink {
    Stdout,
    Path(PathBuf),
    /// Swallow the bytes, verification only.
    Null,
}

impl Sink {
    /// Open the sink for writing. A path sink refuses to clobber an
    /// existing file.
    pub fn open(&self) -> Result<Box<dyn Write>, ClientError> {
        match self {
            Sink::Stdout => Ok(Box::new(io::stdout())),
            Sink::Path(path) => {
                let file = OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .mode(OUTPUT_MODE)
                    .open(path)?;
                Ok(Box::new(file))
            }
            Sink::Null => Ok(Box::new(io::sink())),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            Sink::Path(path) => Some(path),
            _ => None,
        }
    }
}

/// Where an outgoing blob's bytes come from. Standard input is buffered
/// up front so the digest can be probed while streaming to the service.
pub enum Source {
    Path(PathBuf),
    Memory(Vec<u8>),
}

impl Source {
    pub fn open(&self) -> Result<Box<dyn Read + '_>, ClientError> {
        match self {
            Source::Path(path) => Ok(Box::new(File::open(path)?)),
            Source::Memory(bytes) => Ok(Box::new(&bytes[..])),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            Source::Path(path) => Some(path),
            Source::Memory(_) => None,
        }
    }

    /// Digest the source under `algorithm` without consuming it.
    pub fn digest(&self, algorithm: Algorithm) -> Result<String, ClientError> {
        let mut hasher = algorithm.hasher();
        let mut reader = self.open()?;
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hasher.finalize())
    }
}

/// One verb exchange against one service.
pub trait Service {
    /// The scheme and endpoint, for trace lines and the audit record.
    fn describe(&self) -> (String, String);

    fn get(&mut self, udig: &Udig, sink: &Sink) -> Result<bool, ClientError>;
    fn put(&mut self, udig: &Udig, source: &Source) -> Result<bool, ClientError>;
    fn take(&mut self, udig: &Udig, sink: &Sink) -> Result<bool, ClientError>;
    fn give(&mut self, udig: &Udig, source: &Source) -> Result<bool, ClientError>;
    fn eat(&mut self, udig: &Udig) -> Result<bool, ClientError>;
    fn wrap(&mut self) -> Result<Option<Udig>, ClientError>;
    fn roll(&mut self, udig: &Udig) -> Result<bool, ClientError>;

    /// The ok/no acknowledgements observed, for the client audit record.
    fn chat(&self) -> &ChatLog;

    /// Payload bytes moved, for the client audit record.
    fn blob_size(&self) -> u64;
}

/// Resolve the module a udig names, or fail the way the CLI reports it.
pub fn module_of(udig: &Udig) -> Result<Algorithm, ClientError> {
    let module = udig
        .module()
        .ok_or_else(|| ClientError::Digest(format!("unknown algorithm: {}", udig.algorithm())))?;
    if !module.is_syntactic(udig.digest()) {
        return Err(ClientError::Digest(format!(
            "not a {} digest: {}",
            udig.algorithm(),
            udig.digest()
        )));
    }
    Ok(module)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_digest_does_not_consume() {
        let source = Source::Memory(b"hello\n".to_vec());
        let digest = source.digest(Algorithm::Sha).unwrap();
        assert_eq!(digest, "f572d396fae9206628714fb2ce00f72e94f2258f");
        // a second pass sees the same bytes
        assert_eq!(source.digest(Algorithm::Sha).unwrap(), digest);
    }

    #[test]
    fn path_sink_refuses_to_clobber() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out");
        std::fs::write(&path, b"already here").unwrap();
        let sink = Sink::Path(path);
        assert!(matches!(sink.open(), Err(ClientError::Os(_))));
    }

    #[test]
    fn exit_codes_match_the_contract() {
        assert_eq!(ClientError::BadArg("x".into()).exit_code(), 2);
        assert_eq!(ClientError::Digest("x".into()).exit_code(), 16);
        assert_eq!(ClientError::Service("x".into()).exit_code(), 17);
        assert_eq!(
            ClientError::Os(io::Error::other("x")).exit_code(),
            18
        );
    }

    #[test]
    fn module_resolution_checks_syntax() {
        let udig: Udig = "sha:da39a3ee5e6b4b0d3255bfef95601890afd80709"
            .parse()
            .unwrap();
        assert_eq!(module_of(&udig).unwrap(), Algorithm::Sha);

        let unknown: Udig = "zz9:0123456789abcdef0123456789abcdef".parse().unwrap();
        assert!(matches!(module_of(&unknown), Err(ClientError::Digest(_))));

        // well-formed udig grammar, wrong alphabet for the module
        let bad: Udig = format!("sha:{}", "Z".repeat(40)).parse().unwrap();
        assert!(matches!(module_of(&bad), Err(ClientError::Digest(_))));
    }
}
