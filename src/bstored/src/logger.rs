// This file is part of the bstore blob store.
//
// For the full copyright and license information, please view the LICENSE
// file that was distributed with this source code.

//! The blob request record logger.
//!
//! One thread exclusively owns the append descriptor for
//! `spool/<name>.brr`. Request threads send it tagged messages: an
//! `Append` carrying one whole record line, or a `Freeze` carrying a reply
//! channel. A freeze closes the log, renames it to
//! `spool/FROZEN-<name>-<epoch>-<pid>.brr` read-only, answers with the
//! frozen path and leaves the live log to be recreated by the next append.
//! Nothing can interleave with that window because no other thread ever
//! holds the descriptor.

use std::fs::{self, File, OpenOptions, Permissions};
use std::io::{self, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{error, info};

use bstore_core::brr::BrrRecord;

/// Live log: owner read/write, group read.
const LOG_MODE: u32 = 0o640;

/// Frozen logs are immutable.
const FROZEN_MODE: u32 = 0o400;

enum LogMsg {
    Append(String),
    Freeze(mpsc::SyncSender<Option<PathBuf>>),
}

/// Sending side of the logger. Cheap to clone into request threads.
#[derive(Clone)]
pub struct LoggerHandle {
    tx: mpsc::Sender<LogMsg>,
}

impl LoggerHandle {
    /// Queue one record. An unreachable logger is a daemon-level fault.
    pub fn append(&self, record: &BrrRecord) -> io::Result<()> {
        self.tx
            .send(LogMsg::Append(record.to_line()))
            .map_err(|_| io::Error::other("brr logger is gone"))
    }

    /// Freeze the live log. Returns the frozen path, or `None` when no
    /// log exists (nothing was ever appended since the last freeze).
    pub fn freeze(&self) -> io::Result<Option<PathBuf>> {
        let (reply, rx) = mpsc::sync_channel(1);
        self.tx
            .send(LogMsg::Freeze(reply))
            .map_err(|_| io::Error::other("brr logger is gone"))?;
        rx.recv()
            .map_err(|_| io::Error::other("brr logger is gone"))
    }
}

/// The logger thread.
pub struct BrrLogger {
    handle: LoggerHandle,
    thread: Option<thread::JoinHandle<()>>,
}

impl BrrLogger {
    /// Spawn the logger for `spool/<name>.brr`.
    pub fn spawn(spool_dir: PathBuf, name: &str) -> BrrLogger {
        let (tx, rx) = mpsc::channel();
        let name = name.to_string();
        let thread = thread::Builder::new()
            .name("brr-logger".into())
            .spawn(move || logger_loop(rx, spool_dir, &name))
            .expect("spawn brr logger");
        BrrLogger {
            handle: LoggerHandle { tx },
            thread: Some(thread),
        }
    }

    pub fn handle(&self) -> LoggerHandle {
        self.handle.clone()
    }

    /// Drain queued records and stop. Blocks until every cloned
    /// [`LoggerHandle`] has been dropped.
    pub fn shutdown(self) {
        let BrrLogger { handle, thread } = self;
        drop(handle);
        if let Some(thread) = thread {
            let _ = thread.join();
        }
    }
}

struct LogFile {
    path: PathBuf,
    file: Option<File>,
}

impl LogFile {
    fn append(&mut self, line: &str) -> io::Result<()> {
        let file = match &mut self.file {
            Some(file) => file,
            none => none.insert(
                OpenOptions::new()
                    .append(true)
                    .create(true)
                    .mode(LOG_MODE)
                    .open(&self.path)?,
            ),
        };
        // one whole record per write: a reader of the live log never
        // observes a torn line
        file.write_all(line.as_bytes())
    }

    fn freeze(&mut self, spool_dir: &Path, name: &str) -> io::Result<Option<PathBuf>> {
        self.file.take(); // close before rename
        if !self.path.exists() {
            return Ok(None);
        }
        let epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let pid = std::process::id();
        let mut frozen = spool_dir.join(format!("FROZEN-{name}-{epoch}-{pid}.brr"));
        // a second freeze in the same second must not clobber a frozen
        // log the wrap engine has not yet moved away
        let mut seq = 0u32;
        while frozen.exists() {
            seq += 1;
            frozen = spool_dir.join(format!("FROZEN-{name}-{epoch}-{pid}-{seq}.brr"));
        }
        fs::rename(&self.path, &frozen)?;
        fs::set_permissions(&frozen, Permissions::from_mode(FROZEN_MODE))?;
        Ok(Some(frozen))
    }
}

fn logger_loop(rx: mpsc::Receiver<LogMsg>, spool_dir: PathBuf, name: &str) {
    info!("brr logger started");
    let mut log = LogFile {
        path: spool_dir.join(format!("{name}.brr")),
        file: None,
    };
    while let Ok(msg) = rx.recv() {
        match msg {
            LogMsg::Append(line) => {
                // a failed audit write is a fault the daemon cannot paper
                // over; scream and stop accepting records
                if let Err(e) = log.append(&line) {
                    error!("panic: write(brr) failed: {e}");
                    break;
                }
            }
            LogMsg::Freeze(reply) => {
                let frozen = match log.freeze(&spool_dir, name) {
                    Ok(frozen) => frozen,
                    Err(e) => {
                        error!("panic: freeze(brr) failed: {e}");
                        let _ = reply.send(None);
                        break;
                    }
                };
                let _ = reply.send(frozen);
            }
        }
    }
    info!("brr logger shut down");
}
