// This file is part of the bstore blob store.
//
// For the full copyright and license information, please view the LICENSE
// file that was distributed with this source code.

// spell-checker:ignore (names) arborist

//! One accepted connection, one request.
//!
//! The request line is parsed off the stream, the verb's chat protocol is
//! driven against the peer with the payload streamed through an
//! incremental digest, and the result is classified and written to the
//! audit log. Every peer read and write is bounded by the configured
//! timeout; a timeout classifies differently from a peer error and sends
//! nothing.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Instant;

use chrono::Utc;
use log::{error, info, warn};

use bstore_core::brr::{BrrMask, BrrRecord, ChatHistory, ChatLog, Transport, Wall};
use bstore_core::digest::Algorithm;
use bstore_core::udig::Udig;
use bstore_core::wire::{Request, RequestParser, Verb};

use crate::logger::LoggerHandle;
use crate::store::{ArborHandle, Store, StoreError};
use crate::wrap::{self, RollRefusal, WrapError};

const CHUNK_SIZE: usize = 64 * 1024;

/// Outcome class of one request: bits 0-1 of the exit classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success = 0,
    ClientError = 1,
    Timeout = 2,
    Fault = 3,
}

/// What the supervisor needs to classify and count a finished request.
#[derive(Debug)]
pub struct RequestSummary {
    pub verb: Option<Verb>,
    pub chat: ChatHistory,
    pub outcome: Outcome,
}

/// Per-connection knobs handed down from the supervisor.
#[derive(Debug, Clone)]
pub struct ConnConfig {
    pub timeout: std::time::Duration,
    pub trust_fs: bool,
    pub wrap_algorithm: Algorithm,
    pub brr_mask: BrrMask,
}

enum ReqError {
    /// The peer broke the protocol or the transport failed under it.
    Client(String),
    /// A peer read or write exceeded its deadline.
    Timeout,
    /// The daemon could not hold up its own invariants.
    Fault(String),
}

impl ReqError {
    fn outcome(&self) -> Outcome {
        match self {
            ReqError::Client(_) => Outcome::ClientError,
            ReqError::Timeout => Outcome::Timeout,
            ReqError::Fault(_) => Outcome::Fault,
        }
    }
}

impl From<StoreError> for ReqError {
    fn from(e: StoreError) -> ReqError {
        ReqError::Fault(e.to_string())
    }
}

fn classify_io(e: io::Error) -> ReqError {
    match e.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => ReqError::Timeout,
        _ => ReqError::Client(format!("peer i/o failed: {e}")),
    }
}

/// Handle one connection start to finish. Never panics outward; the
/// returned summary is all the supervisor sees.
pub fn handle(
    stream: TcpStream,
    peer: SocketAddr,
    local: SocketAddr,
    store: &Store,
    arborist: &ArborHandle,
    logger: &LoggerHandle,
    config: &ConnConfig,
) -> RequestSummary {
    let start_wall = Utc::now();
    let start = Instant::now();

    let transport = match Transport::new("tcp4", &format!("{peer};{local}")) {
        Ok(transport) => transport,
        Err(e) => {
            error!("transport description: {e}");
            return RequestSummary {
                verb: None,
                chat: ChatHistory::No,
                outcome: Outcome::Fault,
            };
        }
    };

    if stream.set_read_timeout(Some(config.timeout)).is_err()
        || stream.set_write_timeout(Some(config.timeout)).is_err()
    {
        error!("set timeout({}) failed", transport.flow());
        return RequestSummary {
            verb: None,
            chat: ChatHistory::No,
            outcome: Outcome::Fault,
        };
    }

    let mut conn = Conn {
        stream,
        store,
        arborist,
        logger,
        config,
        chat: ChatLog::new(),
        blob_size: 0,
    };

    let (request, scan_ahead) = match conn.read_request() {
        Ok(parsed) => parsed,
        Err(e) => {
            // a grammatical failure gets a terse no; a timeout gets
            // nothing, the peer is presumed gone
            if let ReqError::Client(reason) = &e {
                info!("{}: {reason}", transport.flow());
                conn.write_no_unrecorded();
                conn.chat.push_no();
            }
            return RequestSummary {
                verb: None,
                chat: conn.chat.history(),
                outcome: e.outcome(),
            };
        }
    };

    let verb = request.verb;
    let result = conn.dispatch(&request, scan_ahead);

    let (outcome, udig_override) = match result {
        Ok(udig_override) => (Outcome::Success, udig_override),
        Err(e) => {
            match &e {
                ReqError::Client(reason) => info!("{verb}: {reason}"),
                ReqError::Timeout => info!("{verb}: peer i/o timed out"),
                ReqError::Fault(reason) => error!("{verb}: fault: {reason}"),
            }
            (e.outcome(), None)
        }
    };

    let chat = conn.chat.history();
    let blob_size = conn.blob_size;
    drop(conn);

    // every classified request lands in the audit log, mask permitting
    if config.brr_mask.is_set(verb) {
        let udig = udig_override
            .or_else(|| request_udig(&request))
            .unwrap_or_else(|| Udig::empty(config.wrap_algorithm));
        let record = BrrRecord::new(
            start_wall,
            transport,
            verb,
            udig,
            chat,
            blob_size,
            Wall::from_duration(start.elapsed()),
        );
        if let Err(e) = logger.append(&record) {
            error!("panic: append(brr) failed: {e}");
            return RequestSummary {
                verb: Some(verb),
                chat,
                outcome: Outcome::Fault,
            };
        }
    }

    RequestSummary {
        verb: Some(verb),
        chat,
        outcome,
    }
}

fn request_udig(request: &Request) -> Option<Udig> {
    let algorithm = request.algorithm.as_deref()?;
    let digest = request.digest.as_deref()?;
    Udig::new(algorithm, digest).ok()
}

struct Conn<'a> {
    stream: TcpStream,
    store: &'a Store,
    arborist: &'a ArborHandle,
    logger: &'a LoggerHandle,
    config: &'a ConnConfig,
    chat: ChatLog,
    blob_size: u64,
}

impl Conn<'_> {
    fn read_request(&mut self) -> Result<(Request, Vec<u8>), ReqError> {
        let mut parser = RequestParser::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = self.stream.read(&mut buf).map_err(classify_io)?;
            if n == 0 {
                return Err(ReqError::Client("empty read of request".into()));
            }
            let (consumed, request) = parser
                .feed(&buf[..n])
                .map_err(|e| ReqError::Client(e.to_string()))?;
            if let Some(request) = request {
                return Ok((request, buf[consumed..n].to_vec()));
            }
        }
    }

    /// Resolve the udig against the installed modules and run the verb.
    /// A successful wrap hands back the set udig for the audit record.
    fn dispatch(
        &mut self,
        request: &Request,
        scan_ahead: Vec<u8>,
    ) -> Result<Option<Udig>, ReqError> {
        if request.verb == Verb::Wrap {
            return self.wrap();
        }

        let algorithm = request.algorithm.as_deref().unwrap_or_default();
        let digest = request.digest.as_deref().unwrap_or_default();
        let Some(module) = Algorithm::from_name(algorithm) else {
            self.write_no()?;
            return Err(ReqError::Client(format!(
                "unknown digest algorithm: {algorithm}"
            )));
        };
        if !module.is_syntactic(digest) {
            self.write_no()?;
            return Err(ReqError::Client(format!("not a {algorithm} digest")));
        }

        match request.verb {
            Verb::Get => self.get(module, digest)?,
            Verb::Put => {
                self.put(module, digest, &scan_ahead)?;
            }
            Verb::Give => self.give(module, digest, &scan_ahead)?,
            Verb::Take => self.take(module, digest)?,
            Verb::Eat => self.eat(module, digest)?,
            Verb::Roll => self.roll(module, digest)?,
            Verb::Wrap => unreachable!("handled above"),
        }
        Ok(None)
    }

    //  chat plumbing

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), ReqError> {
        self.stream.write_all(bytes).map_err(classify_io)
    }

    fn write_ok(&mut self) -> Result<(), ReqError> {
        self.write_all(b"ok\n")?;
        self.chat.push_ok();
        Ok(())
    }

    fn write_no(&mut self) -> Result<(), ReqError> {
        self.write_all(b"no\n")?;
        self.chat.push_no();
        Ok(())
    }

    fn write_no_unrecorded(&mut self) {
        let _ = self.stream.write_all(b"no\n");
    }

    fn write_ok_unrecorded(&mut self) -> Result<(), ReqError> {
        self.write_all(b"ok\n")
    }

    /// Read the peer's `ok\r?\n` / `no\r?\n`. True means ok.
    fn read_reply(&mut self, record: bool) -> Result<bool, ReqError> {
        let mut reply = [0u8; 4];
        let mut nread = 0;
        loop {
            let n = self
                .stream
                .read(&mut reply[nread..])
                .map_err(classify_io)?;
            if n == 0 {
                return Err(ReqError::Client(
                    "unexpected end of stream reading reply".into(),
                ));
            }
            nread += n;
            if nread < 3 {
                continue;
            }
            if nread == 3 {
                if reply[2] == b'\r' {
                    continue; // need the trailing new-line
                }
                if reply[2] != b'\n' {
                    return Err(ReqError::Client(
                        "reply missing new-line termination".into(),
                    ));
                }
                break;
            }
            // four bytes: only ok\r\n / no\r\n remain legal
            if reply[2] != b'\r' || reply[3] != b'\n' {
                return Err(ReqError::Client(
                    "corrupted carriage-return new-line termination".into(),
                ));
            }
            break;
        }
        let ok = match &reply[..2] {
            b"ok" => true,
            b"no" => false,
            other => {
                return Err(ReqError::Client(format!(
                    "unexpected reply: 0x{:02x}{:02x}",
                    other[0], other[1]
                )))
            }
        };
        if record {
            if ok {
                self.chat.push_ok();
            } else {
                self.chat.push_no();
            }
        }
        Ok(ok)
    }

    //  verbs

    /// Stream a stored blob to the peer, verifying on the way out.
    /// Shared by get and the byte phase of take. Returns false when the
    /// blob was absent.
    fn send_blob(&mut self, module: Algorithm, digest: &str) -> Result<bool, ReqError> {
        let path = self.store.blob_path(module, digest);
        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.write_no()?;
                return Ok(false);
            }
            Err(e) => return Err(ReqError::Fault(format!("open({}): {e}", path.display()))),
        };

        self.write_ok()?;

        let verify = !self.config.trust_fs;
        let mut hasher = verify.then(|| module.hasher());
        let mut sent: u64 = 0;
        let mut buf = [0u8; CHUNK_SIZE];
        loop {
            let n = file
                .read(&mut buf)
                .map_err(|e| ReqError::Fault(format!("read({}): {e}", path.display())))?;
            if n == 0 {
                break;
            }
            if let Some(hasher) = &mut hasher {
                hasher.update(&buf[..n]);
            }
            self.write_all(&buf[..n])?;
            sent += n as u64;
            self.blob_size += n as u64;
        }

        if let Some(hasher) = hasher {
            let sound = if sent == 0 {
                module.is_empty_digest(digest)
            } else {
                hasher.probe(digest)
            };
            if !sound {
                // the peer already holds bytes that can never match; all
                // that is left is to scream and take the corrupt file out
                // of circulation. The fan-out directories stay put.
                error!("panic: {module}:{digest}: stored blob does not match digest");
                if let Err(e) = fs::remove_file(&path) {
                    if e.kind() != io::ErrorKind::NotFound {
                        return Err(ReqError::Fault(format!(
                            "unlink corrupt {}: {e}",
                            path.display()
                        )));
                    }
                }
            }
        }
        Ok(true)
    }

    fn get(&mut self, module: Algorithm, digest: &str) -> Result<(), ReqError> {
        self.send_blob(module, digest)?;
        Ok(())
    }

    /// Receive a blob of known digest. Returns true when it was accepted.
    fn receive_blob(
        &mut self,
        verb: Verb,
        module: Algorithm,
        digest: &str,
        scan_ahead: &[u8],
    ) -> Result<bool, ReqError> {
        self.write_ok()?;

        // the empty blob is always put; no bytes will follow
        if module.is_empty_digest(digest) {
            let scratch = self.store.open_scratch(verb, module, digest)?;
            scratch.publish(self.store, self.arborist)?;
            self.write_ok()?;
            return Ok(true);
        }

        let mut scratch = self.store.open_scratch(verb, module, digest)?;
        self.blob_size += scan_ahead.len() as u64;
        let mut matched = scratch.write_probe(scan_ahead)?;
        let mut buf = [0u8; CHUNK_SIZE];
        while !matched {
            let n = self.stream.read(&mut buf).map_err(classify_io)?;
            if n == 0 {
                // peer gave up, or the bytes can never form the digest
                scratch.discard();
                self.write_no()?;
                return Ok(false);
            }
            self.blob_size += n as u64;
            matched = scratch.write_probe(&buf[..n])?;
        }
        scratch.publish(self.store, self.arborist)?;
        self.write_ok()?;
        Ok(true)
    }

    fn put(
        &mut self,
        module: Algorithm,
        digest: &str,
        scan_ahead: &[u8],
    ) -> Result<bool, ReqError> {
        self.receive_blob(Verb::Put, module, digest, scan_ahead)
    }

    fn give(
        &mut self,
        module: Algorithm,
        digest: &str,
        scan_ahead: &[u8],
    ) -> Result<(), ReqError> {
        if !self.receive_blob(Verb::Give, module, digest, scan_ahead)? {
            return Ok(());
        }
        // the peer acknowledges it may now forget its copy; that ack
        // belongs to the peer's own audit trail, not this record
        let _ = self.read_reply(false)?;
        Ok(())
    }

    fn take(&mut self, module: Algorithm, digest: &str) -> Result<(), ReqError> {
        // a blob referenced by the unrolled wrap set is pinned until the
        // next roll
        let udig = Udig::new(module.name(), digest)
            .map_err(|e| ReqError::Fault(e.to_string()))?;
        let wrap_path = self.store.wrap_brr_path(&udig);
        match wrap_path.try_exists() {
            Ok(true) => {
                warn!("take {udig}: blob in unrolled wrap set, forbidden until a roll");
                self.write_no()?;
                return Ok(());
            }
            Ok(false) => {}
            Err(e) => {
                return Err(ReqError::Fault(format!(
                    "stat({}): {e}",
                    wrap_path.display()
                )))
            }
        }

        if !self.send_blob(module, digest)? {
            return Ok(());
        }

        if self.read_reply(true)? {
            self.store.remove_blob(self.arborist, module, digest, true)?;
            self.write_ok()?;
        } else {
            // the peer rejected the bytes; the blob stays, the close is
            // still polite
            self.write_ok_unrecorded()?;
        }
        Ok(())
    }

    fn eat(&mut self, module: Algorithm, digest: &str) -> Result<(), ReqError> {
        let path = self.store.blob_path(module, digest);
        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.write_no()?;
                return Ok(());
            }
            Err(e) => return Err(ReqError::Fault(format!("open({}): {e}", path.display()))),
        };

        if self.config.trust_fs {
            return self.write_ok();
        }

        let mut hasher = module.hasher();
        let mut size: u64 = 0;
        let mut buf = [0u8; CHUNK_SIZE];
        loop {
            let n = file
                .read(&mut buf)
                .map_err(|e| ReqError::Fault(format!("read({}): {e}", path.display())))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            size += n as u64;
        }
        let sound = if size == 0 {
            module.is_empty_digest(digest)
        } else {
            hasher.probe(digest)
        };
        if sound {
            self.write_ok()
        } else {
            error!("panic: eat {module}:{digest}: stored blob does not match digest");
            self.write_no()
        }
    }

    fn wrap(&mut self) -> Result<Option<Udig>, ReqError> {
        match wrap::wrap(
            self.store,
            self.arborist,
            self.logger,
            self.config.wrap_algorithm,
        ) {
            Ok(set_udig) => {
                self.write_ok()?;
                self.write_all(format!("{set_udig}\n").as_bytes())?;
                // delivery of the set udig is the second acknowledgement
                self.chat.push_ok();
                Ok(Some(set_udig))
            }
            Err(WrapError::NoLog) => {
                self.write_no()?;
                Ok(None)
            }
            Err(e) => Err(ReqError::Fault(e.to_string())),
        }
    }

    fn roll(&mut self, module: Algorithm, digest: &str) -> Result<(), ReqError> {
        let set = match wrap::load_roll_set(self.store, module, digest)
            .map_err(|e| ReqError::Fault(e.to_string()))?
        {
            Ok(set) => set,
            Err(RollRefusal::NoSuchBlob) | Err(RollRefusal::BadSet(_)) => {
                self.write_no()?;
                return Ok(());
            }
        };
        // set accepted; the second ok follows the unlink pass
        self.write_ok()?;
        wrap::dissolve_set(self.store, &set).map_err(|e| ReqError::Fault(e.to_string()))?;
        self.write_ok()?;
        Ok(())
    }
}
