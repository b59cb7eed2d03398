// This file is part of the bstore blob store.
//
// For the full copyright and license information, please view the LICENSE
// file that was distributed with this source code.

//! The `fs` driver: a store directory tree worked in place, no daemon.
//!
//! Reads prefer a hard link into the caller's output path when the
//! service is trusted and the filesystems allow it, falling back to a
//! copy. Writes go through the same scratch-then-rename discipline the
//! daemon uses, so a crashed client never leaves a half-written blob
//! under `data/`.

use std::fs::{self, File, OpenOptions, Permissions};
use std::io::{self, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use log::debug;

use bstore_core::brr::ChatLog;
use bstore_core::digest::Algorithm;
use bstore_core::service::QueryArgs;
use bstore_core::udig::Udig;

use crate::driver::{module_of, ClientError, Service, Sink, Source, OUTPUT_MODE};

const CHUNK_SIZE: usize = 64 * 1024;

pub struct Fs {
    root: PathBuf,
    trust_fs: bool,
    chat: ChatLog,
    blob_size: u64,
}

impl Fs {
    pub fn new(root: &str, query: &QueryArgs) -> Fs {
        Fs {
            root: PathBuf::from(root),
            trust_fs: query.trust_fs,
            chat: ChatLog::new(),
            blob_size: 0,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, module: Algorithm, digest: &str) -> PathBuf {
        self.root
            .join("data")
            .join(module.name())
            .join(module.fanout(digest))
    }

    fn wrap_brr_path(&self, udig: &Udig) -> PathBuf {
        self.root
            .join("spool")
            .join("wrap")
            .join(format!("{udig}.brr"))
    }

    /// Deliver a stored blob to the sink. A trusted service may hard
    /// link; otherwise the bytes are verified on the way through.
    fn deliver(&mut self, udig: &Udig, sink: &Sink) -> Result<bool, ClientError> {
        let module = module_of(udig)?;
        let path = self.blob_path(module, udig.digest());

        if !path.is_file() {
            self.chat.push_no();
            return Ok(false);
        }

        if self.trust_fs {
            if let Some(out) = sink.path() {
                match fs::hard_link(&path, out) {
                    Ok(()) => {
                        debug!("fs: linked {} -> {}", path.display(), out.display());
                        self.blob_size += fs::metadata(&path)?.len();
                        self.chat.push_ok();
                        return Ok(true);
                    }
                    Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                        return Err(ClientError::Os(e));
                    }
                    // cross-device or unsupported: fall through to copy
                    Err(e) => debug!("fs: link fallback for {}: {e}", out.display()),
                }
            }
        }

        let mut out = sink.open()?;
        let mut file = File::open(&path)?;
        let mut hasher = (!self.trust_fs).then(|| module.hasher());
        let mut size: u64 = 0;
        let mut buf = [0u8; CHUNK_SIZE];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            if let Some(hasher) = &mut hasher {
                hasher.update(&buf[..n]);
            }
            out.write_all(&buf[..n])?;
            size += n as u64;
        }
        out.flush()?;
        self.blob_size += size;

        if let Some(hasher) = hasher {
            let sound = if size == 0 {
                udig.is_empty_blob()
            } else {
                hasher.probe(udig.digest())
            };
            if !sound {
                return Err(ClientError::Digest(format!(
                    "{udig}: stored blob does not match digest"
                )));
            }
        }
        self.chat.push_ok();
        Ok(true)
    }

    /// Scratch-then-rename a source into the store.
    fn store(&mut self, udig: &Udig, source: &Source) -> Result<(), ClientError> {
        let module = module_of(udig)?;
        let target = self.blob_path(module, udig.digest());
        if target.is_file() {
            // content-addressed storage is idempotent; verify the input
            // matches before claiming success
            if !self.trust_fs && source.digest(module)? != udig.digest() {
                return Err(ClientError::Digest(format!(
                    "{udig}: input does not match digest"
                )));
            }
            return Ok(());
        }

        let tmp_dir = self.root.join("tmp");
        fs::create_dir_all(&tmp_dir)?;
        let epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let scratch = tmp_dir.join(format!(
            "put-{}-{}-{}",
            epoch,
            std::process::id(),
            udig.digest()
        ));

        let result = self.write_scratch(&scratch, udig, module, source, &target);
        if result.is_err() {
            let _ = fs::remove_file(&scratch);
        }
        result
    }

    fn write_scratch(
        &mut self,
        scratch: &Path,
        udig: &Udig,
        module: Algorithm,
        source: &Source,
        target: &Path,
    ) -> Result<(), ClientError> {
        let mut out = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(scratch)?;
        let mut reader = source.open()?;
        let mut hasher = module.hasher();
        let mut size: u64 = 0;
        let mut buf = [0u8; CHUNK_SIZE];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            out.write_all(&buf[..n])?;
            size += n as u64;
        }
        drop(out);

        let sound = if size == 0 {
            udig.is_empty_blob()
        } else {
            hasher.probe(udig.digest())
        };
        if !sound && !self.trust_fs {
            return Err(ClientError::Digest(format!(
                "{udig}: input does not match digest"
            )));
        }

        let parent = target
            .parent()
            .ok_or_else(|| ClientError::Service("blob path has no parent".into()))?;
        fs::create_dir_all(parent)?;
        fs::rename(scratch, target)?;
        fs::set_permissions(target, Permissions::from_mode(OUTPUT_MODE))?;
        self.blob_size += size;
        Ok(())
    }
}

impl Service for Fs {
    fn describe(&self) -> (String, String) {
        ("fs".into(), self.root.display().to_string())
    }

    fn get(&mut self, udig: &Udig, sink: &Sink) -> Result<bool, ClientError> {
        self.deliver(udig, sink)
    }

    fn put(&mut self, udig: &Udig, source: &Source) -> Result<bool, ClientError> {
        self.chat.push_ok();
        self.store(udig, source)?;
        self.chat.push_ok();
        Ok(true)
    }

    fn take(&mut self, udig: &Udig, sink: &Sink) -> Result<bool, ClientError> {
        // parity with the daemon: a blob named by the unrolled wrap set
        // cannot be taken
        if self.wrap_brr_path(udig).is_file() {
            self.chat.push_no();
            return Ok(false);
        }
        if !self.deliver(udig, sink)? {
            return Ok(false);
        }
        let module = module_of(udig)?;
        match fs::remove_file(self.blob_path(module, udig.digest())) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(ClientError::Os(e)),
        }
        self.chat.push_ok();
        self.chat.push_ok();
        Ok(true)
    }

    fn give(&mut self, udig: &Udig, source: &Source) -> Result<bool, ClientError> {
        self.chat.push_ok();
        self.store(udig, source)?;
        self.chat.push_ok();
        if let Some(path) = source.path() {
            match fs::remove_file(path) {
                Ok(()) => debug!("fs: gave and forgot {}", path.display()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(ClientError::Os(e)),
            }
        }
        self.chat.push_ok();
        Ok(true)
    }

    fn eat(&mut self, udig: &Udig) -> Result<bool, ClientError> {
        let module = module_of(udig)?;
        let path = self.blob_path(module, udig.digest());
        if !path.is_file() {
            self.chat.push_no();
            return Ok(false);
        }
        if self.trust_fs {
            self.chat.push_ok();
            return Ok(true);
        }
        let mut hasher = module.hasher();
        let mut file = File::open(&path)?;
        let mut size: u64 = 0;
        let mut buf = [0u8; CHUNK_SIZE];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            size += n as u64;
        }
        let sound = if size == 0 {
            udig.is_empty_blob()
        } else {
            hasher.probe(udig.digest())
        };
        if sound {
            self.chat.push_ok();
        } else {
            self.chat.push_no();
        }
        Ok(sound)
    }

    fn wrap(&mut self) -> Result<Option<Udig>, ClientError> {
        Err(ClientError::Service(
            "wrap is not supported by the fs service".into(),
        ))
    }

    fn roll(&mut self, _udig: &Udig) -> Result<bool, ClientError> {
        Err(ClientError::Service(
            "roll is not supported by the fs service".into(),
        ))
    }

    fn chat(&self) -> &ChatLog {
        &self.chat
    }

    fn blob_size(&self) -> u64 {
        self.blob_size
    }
}
