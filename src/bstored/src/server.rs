// This file is part of the bstore blob store.
//
// For the full copyright and license information, please view the LICENSE
// file that was distributed with this source code.

// spell-checker:ignore (names) arborist bstored pidfile

//! The connection supervisor.
//!
//! Accepts connections, hands each one to its own request thread, and
//! reduces every finished request to a seven bit classification:
//!
//! - bits 0-1: outcome — success, client error, timeout, fault
//! - bits 2-4: verb — get=1 .. roll=7
//! - bits 5-6: chat — ok, no, ok-no, ok-ok-no
//!
//! Counters indexed by that taxonomy feed the heartbeat line. A request
//! thread that panics is contained: its classification becomes a fault
//! and the logger and store are untouched by the unwinding.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::{error, info, warn};
use thiserror::Error;

use bstore_core::brr::{BrrMask, ChatHistory};
use bstore_core::digest::Algorithm;
use bstore_core::wire::Verb;

use crate::conn::{self, ConnConfig, Outcome, RequestSummary};
use crate::logger::BrrLogger;
use crate::store::{Arborist, Store, StoreError};

/// How long the accept loop sleeps when nothing is arriving.
const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// Bounded wait for request threads during shutdown.
const DRAIN_DEADLINE: Duration = Duration::from_secs(10);

/// The daemon's name, used for the audit log and the pidfile.
const DAEMON_NAME: &str = "bstored";

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("bind {0}: {1}")]
    Bind(SocketAddr, io::Error),
    #[error("pidfile {0} exists; is another daemon running?")]
    PidfileExists(PathBuf),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Everything the daemon needs to run.
#[derive(Debug, Clone)]
pub struct Config {
    pub root: PathBuf,
    pub bind: SocketAddr,
    pub timeout: Duration,
    pub wrap_algorithm: Algorithm,
    pub brr_mask: BrrMask,
    pub trust_fs: bool,
    /// Heartbeat cadence; `None` disables the line.
    pub heartbeat: Option<Duration>,
}

/// Encode one finished request as the seven bit classification.
pub fn exit_class(summary: &RequestSummary) -> u8 {
    let outcome = summary.outcome as u8;
    let verb = summary.verb.map_or(0, verb_bits);
    let chat = summary.chat.outcome_bits();
    outcome | (verb << 2) | (chat << 5)
}

fn verb_bits(verb: Verb) -> u8 {
    match verb {
        Verb::Get => 1,
        Verb::Put => 2,
        Verb::Give => 3,
        Verb::Take => 4,
        Verb::Eat => 5,
        Verb::Wrap => 6,
        Verb::Roll => 7,
    }
}

/// Decode a classification back into its parts, for reporting.
pub fn describe_class(class: u8) -> (Outcome, Option<Verb>, u8) {
    let outcome = match class & 0x3 {
        0 => Outcome::Success,
        1 => Outcome::ClientError,
        2 => Outcome::Timeout,
        _ => Outcome::Fault,
    };
    let verb = match (class >> 2) & 0x7 {
        1 => Some(Verb::Get),
        2 => Some(Verb::Put),
        3 => Some(Verb::Give),
        4 => Some(Verb::Take),
        5 => Some(Verb::Eat),
        6 => Some(Verb::Wrap),
        7 => Some(Verb::Roll),
        _ => None,
    };
    (outcome, verb, (class >> 5) & 0x3)
}

#[derive(Default)]
struct Counters {
    by_class: HashMap<u8, u64>,
    requests: u64,
}

impl Counters {
    fn record(&mut self, class: u8) {
        self.requests += 1;
        *self.by_class.entry(class).or_insert(0) += 1;
    }

    fn heartbeat_line(&self) -> String {
        let mut success = 0;
        let mut client_error = 0;
        let mut timeout = 0;
        let mut fault = 0;
        for (&class, &count) in &self.by_class {
            match describe_class(class).0 {
                Outcome::Success => success += count,
                Outcome::ClientError => client_error += count,
                Outcome::Timeout => timeout += count,
                Outcome::Fault => fault += count,
            }
        }
        format!(
            "requests={} success={success} client-error={client_error} \
             timeout={timeout} fault={fault}",
            self.requests
        )
    }
}

/// A bound, not yet serving, daemon. Binding is split from running so a
/// caller can learn the ephemeral port before the accept loop starts.
pub struct Server {
    listener: TcpListener,
    store: Store,
    config: Config,
    pidfile: PathBuf,
}

impl Server {
    pub fn bind(config: Config) -> Result<Server, ServerError> {
        let store = Store::open(&config.root)?;

        let listener =
            TcpListener::bind(config.bind).map_err(|e| ServerError::Bind(config.bind, e))?;
        listener.set_nonblocking(true)?;

        let pidfile = store.run_dir().join(format!("{DAEMON_NAME}.pid"));
        if pidfile.exists() {
            return Err(ServerError::PidfileExists(pidfile));
        }
        fs::write(&pidfile, format!("{}\n", std::process::id()))?;

        Ok(Server {
            listener,
            store,
            config,
            pidfile,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until `shutdown` goes true, then drain in two phases: stop
    /// accepting, give request threads a bounded wait, close the logger
    /// and arborist.
    pub fn run(self, shutdown: Arc<AtomicBool>) -> Result<(), ServerError> {
        let Server {
            listener,
            store,
            config,
            pidfile,
        } = self;

        info!(
            "{DAEMON_NAME} listening on {} root {}",
            listener.local_addr()?,
            store.root().display()
        );
        info!("wrap digest algorithm: {}", config.wrap_algorithm);

        let arborist = Arborist::spawn();
        let logger = BrrLogger::spawn(store.spool_dir(), DAEMON_NAME);
        let counters = Arc::new(Mutex::new(Counters::default()));
        let conn_config = ConnConfig {
            timeout: config.timeout,
            trust_fs: config.trust_fs,
            wrap_algorithm: config.wrap_algorithm,
            brr_mask: config.brr_mask,
        };

        let mut workers: Vec<thread::JoinHandle<()>> = Vec::new();
        let mut last_heartbeat = Instant::now();

        while !shutdown.load(Ordering::SeqCst) {
            workers.retain(|w| !w.is_finished());

            if let Some(every) = config.heartbeat {
                if last_heartbeat.elapsed() >= every {
                    last_heartbeat = Instant::now();
                    let counters = counters.lock().expect("counters poisoned");
                    info!("alive: {} open={}", counters.heartbeat_line(), workers.len());
                }
            }

            let (stream, peer) = match listener.accept() {
                Ok(accepted) => accepted,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL);
                    continue;
                }
                Err(e) => {
                    error!("accept() failed: {e}");
                    continue;
                }
            };
            let local = stream.local_addr().unwrap_or(config.bind);

            let store = store.clone();
            let arborist = arborist.handle();
            let logger = logger.handle();
            let conn_config = conn_config.clone();
            let counters = Arc::clone(&counters);
            let worker = thread::Builder::new()
                .name(format!("request-{peer}"))
                .spawn(move || {
                    // contain a panicking request: the thread dies, the
                    // descriptors and the store do not
                    let summary = panic::catch_unwind(AssertUnwindSafe(|| {
                        conn::handle(
                            stream,
                            peer,
                            local,
                            &store,
                            &arborist,
                            &logger,
                            &conn_config,
                        )
                    }))
                    .unwrap_or_else(|_| {
                        error!("panic: request thread for {peer} panicked");
                        RequestSummary {
                            verb: None,
                            chat: ChatHistory::No,
                            outcome: Outcome::Fault,
                        }
                    });
                    let class = exit_class(&summary);
                    counters
                        .lock()
                        .expect("counters poisoned")
                        .record(class);
                });
            match worker {
                Ok(worker) => workers.push(worker),
                Err(e) => error!("spawn request thread: {e}"),
            }
        }

        info!("shutdown: draining {} request thread(s)", workers.len());
        let deadline = Instant::now() + DRAIN_DEADLINE;
        while workers.iter().any(|w| !w.is_finished()) && Instant::now() < deadline {
            thread::sleep(ACCEPT_POLL);
        }
        for worker in workers {
            if worker.is_finished() {
                let _ = worker.join();
            } else {
                warn!("shutdown: abandoning a request thread still running");
            }
        }

        // abandoned stragglers still hold logger and arborist handles;
        // both close once the per-read timeouts run those threads out
        logger.shutdown();
        arborist.shutdown();

        if let Err(e) = fs::remove_file(&pidfile) {
            warn!("remove pidfile {}: {e}", pidfile.display());
        }
        {
            let counters = counters.lock().expect("counters poisoned");
            info!("final: {}", counters.heartbeat_line());
        }
        info!("{DAEMON_NAME} shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(verb: Option<Verb>, chat: ChatHistory, outcome: Outcome) -> RequestSummary {
        RequestSummary {
            verb,
            chat,
            outcome,
        }
    }

    #[test]
    fn classification_round_trips() {
        let verbs = [
            None,
            Some(Verb::Get),
            Some(Verb::Put),
            Some(Verb::Give),
            Some(Verb::Take),
            Some(Verb::Eat),
            Some(Verb::Wrap),
            Some(Verb::Roll),
        ];
        let chats = [
            ChatHistory::Ok,
            ChatHistory::No,
            ChatHistory::OkOk,
            ChatHistory::OkNo,
            ChatHistory::OkOkOk,
            ChatHistory::OkOkNo,
        ];
        let outcomes = [
            Outcome::Success,
            Outcome::ClientError,
            Outcome::Timeout,
            Outcome::Fault,
        ];
        for verb in verbs {
            for chat in chats {
                for outcome in outcomes {
                    let class = exit_class(&summary(verb, chat, outcome));
                    assert!(class < 0x80, "seven bits only: {class:#x}");
                    let (got_outcome, got_verb, got_chat) = describe_class(class);
                    assert_eq!(got_outcome, outcome);
                    assert_eq!(got_verb, verb);
                    assert_eq!(got_chat, chat.outcome_bits());
                }
            }
        }
    }

    #[test]
    fn take_failure_is_distinct_from_success() {
        let ok = exit_class(&summary(
            Some(Verb::Take),
            ChatHistory::OkOkOk,
            Outcome::Success,
        ));
        let no = exit_class(&summary(
            Some(Verb::Take),
            ChatHistory::OkOkNo,
            Outcome::Success,
        ));
        assert_ne!(ok, no);
    }

    #[test]
    fn counters_summarise_by_outcome() {
        let mut counters = Counters::default();
        counters.record(exit_class(&summary(
            Some(Verb::Get),
            ChatHistory::Ok,
            Outcome::Success,
        )));
        counters.record(exit_class(&summary(
            Some(Verb::Put),
            ChatHistory::OkNo,
            Outcome::ClientError,
        )));
        counters.record(exit_class(&summary(None, ChatHistory::No, Outcome::Timeout)));
        let line = counters.heartbeat_line();
        assert!(line.contains("requests=3"));
        assert!(line.contains("success=1"));
        assert!(line.contains("client-error=1"));
        assert!(line.contains("timeout=1"));
        assert!(line.contains("fault=0"));
    }
}
