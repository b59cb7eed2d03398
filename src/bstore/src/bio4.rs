// This file is part of the bstore blob store.
//
// For the full copyright and license information, please view the LICENSE
// file that was distributed with this source code.

//! The `bio4` driver: the wire protocol over TCP, initiator side.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use log::debug;

use bstore_core::brr::ChatLog;
use bstore_core::digest::Hasher;
use bstore_core::service::QueryArgs;
use bstore_core::udig::Udig;

use crate::driver::{module_of, ClientError, Service, Sink, Source};

const CHUNK_SIZE: usize = 64 * 1024;

pub struct Bio4 {
    host: String,
    port: u16,
    timeout: Duration,
    trust_fs: bool,
    chat: ChatLog,
    blob_size: u64,
}

impl Bio4 {
    pub fn new(host: &str, port: u16, query: &QueryArgs) -> Bio4 {
        Bio4 {
            host: host.to_string(),
            port,
            timeout: query.timeout_duration(),
            trust_fs: query.trust_fs,
            chat: ChatLog::new(),
            blob_size: 0,
        }
    }

    fn connect(&self) -> Result<TcpStream, ClientError> {
        let addrs = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| ClientError::Service(format!("resolve {}: {e}", self.host)))?;
        let mut last = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.timeout) {
                Ok(stream) => {
                    stream.set_read_timeout(Some(self.timeout))?;
                    stream.set_write_timeout(Some(self.timeout))?;
                    debug!("bio4: connected to {addr}");
                    return Ok(stream);
                }
                Err(e) => last = Some(e),
            }
        }
        Err(ClientError::Service(format!(
            "connect {}:{}: {}",
            self.host,
            self.port,
            last.map_or_else(|| "no addresses".to_string(), |e| e.to_string())
        )))
    }

    /// Read `ok\n` or `no\n`. True means ok.
    fn read_ok_no(&mut self, stream: &mut TcpStream) -> Result<bool, ClientError> {
        let mut reply = [0u8; 3];
        stream
            .read_exact(&mut reply)
            .map_err(|e| ClientError::Service(format!("read reply: {e}")))?;
        if reply[2] != b'\n' {
            return Err(ClientError::Service("reply missing new-line".into()));
        }
        match &reply[..2] {
            b"ok" => {
                debug!("bio4: < ok");
                self.chat.push_ok();
                Ok(true)
            }
            b"no" => {
                debug!("bio4: < no");
                self.chat.push_no();
                Ok(false)
            }
            other => Err(ClientError::Service(format!(
                "reply not ok or no: 0x{:02x}{:02x}",
                other[0], other[1]
            ))),
        }
    }

    /// Send the request line and read the first reply.
    fn request(&mut self, stream: &mut TcpStream, line: &str) -> Result<bool, ClientError> {
        debug!("bio4: > {}", line.trim_end());
        stream
            .write_all(line.as_bytes())
            .map_err(|e| ClientError::Service(format!("write request: {e}")))?;
        self.read_ok_no(stream)
    }

    /// Read the blob bytes after a server ok, incrementally verifying
    /// against the udig unless the service is trusted. With `stop_on_match`
    /// the read stops as soon as the digest matches (the take flow, where
    /// the server waits for our acknowledgement instead of closing).
    fn read_blob(
        &mut self,
        stream: &mut TcpStream,
        udig: &Udig,
        sink: &Sink,
        stop_on_match: bool,
    ) -> Result<(), ClientError> {
        let module = module_of(udig)?;
        let mut out = sink.open()?;
        // a take must always verify: the digest match is what frames the
        // stream, since the server waits for our acknowledgement rather
        // than closing
        let verify = !self.trust_fs || stop_on_match;
        let mut hasher: Option<Hasher> = verify.then(|| module.hasher());
        let mut matched = udig.is_empty_blob();
        let mut buf = [0u8; CHUNK_SIZE];
        while !(stop_on_match && matched) {
            let n = stream
                .read(&mut buf)
                .map_err(|e| ClientError::Service(format!("read blob: {e}")))?;
            if n == 0 {
                break;
            }
            if let Some(hasher) = &mut hasher {
                hasher.update(&buf[..n]);
                if hasher.probe(udig.digest()) {
                    matched = true;
                }
            }
            out.write_all(&buf[..n])?;
            self.blob_size += n as u64;
        }
        out.flush()?;
        if hasher.is_some() && !matched {
            let _ = stream.write_all(b"no\n");
            return Err(ClientError::Digest(format!(
                "{udig}: blob does not match digest"
            )));
        }
        Ok(())
    }

    /// Stream the source to the server, probing the digest locally so a
    /// wrong input fails here instead of spinning against the service.
    fn write_blob(
        &mut self,
        stream: &mut TcpStream,
        udig: &Udig,
        source: &Source,
    ) -> Result<(), ClientError> {
        let module = module_of(udig)?;
        let mut reader = source.open()?;
        let mut hasher: Option<Hasher> = (!self.trust_fs).then(|| module.hasher());
        let mut matched = udig.is_empty_blob();
        let mut buf = [0u8; CHUNK_SIZE];
        while !matched {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                if hasher.is_none() {
                    return Ok(()); // trusted: the stream is the blob
                }
                return Err(ClientError::Digest(format!(
                    "{udig}: input does not match digest"
                )));
            }
            if let Some(hasher) = &mut hasher {
                hasher.update(&buf[..n]);
                if hasher.probe(udig.digest()) {
                    matched = true;
                }
            }
            stream
                .write_all(&buf[..n])
                .map_err(|e| ClientError::Service(format!("write blob: {e}")))?;
            self.blob_size += n as u64;
        }
        Ok(())
    }

    /// The put exchange; give layers its third round trip on top.
    fn put_exchange(&mut self, udig: &Udig, source: &Source) -> Result<(TcpStream, bool), ClientError> {
        let mut stream = self.connect()?;
        if !self.request(&mut stream, &format!("put {udig}\n"))? {
            return Ok((stream, false));
        }
        self.write_blob(&mut stream, udig, source)?;
        let accepted = self.read_ok_no(&mut stream)?;
        Ok((stream, accepted))
    }
}

impl Service for Bio4 {
    fn describe(&self) -> (String, String) {
        ("bio4".into(), format!("{}:{}", self.host, self.port))
    }

    fn get(&mut self, udig: &Udig, sink: &Sink) -> Result<bool, ClientError> {
        let mut stream = self.connect()?;
        if !self.request(&mut stream, &format!("get {udig}\n"))? {
            return Ok(false);
        }
        self.read_blob(&mut stream, udig, sink, false)?;
        Ok(true)
    }

    fn put(&mut self, udig: &Udig, source: &Source) -> Result<bool, ClientError> {
        let (_stream, accepted) = self.put_exchange(udig, source)?;
        Ok(accepted)
    }

    fn take(&mut self, udig: &Udig, sink: &Sink) -> Result<bool, ClientError> {
        let mut stream = self.connect()?;
        if !self.request(&mut stream, &format!("take {udig}\n"))? {
            return Ok(false);
        }
        self.read_blob(&mut stream, udig, sink, true)?;

        // the bytes verified; tell the server it may forget the blob
        debug!("bio4: > ok");
        stream
            .write_all(b"ok\n")
            .map_err(|e| ClientError::Service(format!("write take ack: {e}")))?;
        self.chat.push_ok();
        self.read_ok_no(&mut stream)
    }

    fn give(&mut self, udig: &Udig, source: &Source) -> Result<bool, ClientError> {
        let (mut stream, accepted) = self.put_exchange(udig, source)?;
        if !accepted {
            return Ok(false);
        }

        // the server holds the blob; we may now forget our copy
        if let Some(path) = source.path() {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    let _ = stream.write_all(b"no\n");
                    return Err(ClientError::Os(e));
                }
            }
            debug!("bio4: gave and forgot {}", path.display());
        }
        stream
            .write_all(b"ok\n")
            .map_err(|e| ClientError::Service(format!("write give ack: {e}")))?;
        self.chat.push_ok();
        Ok(true)
    }

    fn eat(&mut self, udig: &Udig) -> Result<bool, ClientError> {
        let mut stream = self.connect()?;
        self.request(&mut stream, &format!("eat {udig}\n"))
    }

    fn wrap(&mut self) -> Result<Option<Udig>, ClientError> {
        let mut stream = self.connect()?;
        if !self.request(&mut stream, "wrap\n")? {
            return Ok(None);
        }
        // the set udig follows on its own line
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            let n = stream
                .read(&mut byte)
                .map_err(|e| ClientError::Service(format!("read wrap udig: {e}")))?;
            if n == 0 {
                return Err(ClientError::Service(
                    "end of stream reading wrap udig".into(),
                ));
            }
            if byte[0] == b'\n' {
                break;
            }
            if line.len() > 8 + 1 + 128 {
                return Err(ClientError::Service("wrap udig line too long".into()));
            }
            line.push(byte[0]);
        }
        let text = String::from_utf8(line)
            .map_err(|_| ClientError::Service("wrap udig not ascii".into()))?;
        let udig: Udig = text
            .parse()
            .map_err(|e| ClientError::Service(format!("wrap udig: {e}")))?;
        self.chat.push_ok();
        Ok(Some(udig))
    }

    fn roll(&mut self, udig: &Udig) -> Result<bool, ClientError> {
        let mut stream = self.connect()?;
        if !self.request(&mut stream, &format!("roll {udig}\n"))? {
            return Ok(false);
        }
        // the set was accepted; the second ok closes the unlink pass
        self.read_ok_no(&mut stream)
    }

    fn chat(&self) -> &ChatLog {
        &self.chat
    }

    fn blob_size(&self) -> u64 {
        self.blob_size
    }
}
