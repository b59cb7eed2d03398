// This file is part of the bstore blob store.
//
// For the full copyright and license information, please view the LICENSE
// file that was distributed with this source code.

// spell-checker:ignore (names) bstore bstored

//! The bio4 driver against an in-process daemon: the initiator and the
//! responder sides of the verb state machines, end to end.

use std::fs;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bstore_core::brr::BrrMask;
use bstore_core::digest::Algorithm;
use bstore_core::service::QueryArgs;
use bstore_core::udig::Udig;

use bstore::bio4::Bio4;
use bstore::cache4::Cache4;
use bstore::driver::{ClientError, Service, Sink, Source};

use bstored::server::{Config, Server};

const HELLO_SHA: &str = "f572d396fae9206628714fb2ce00f72e94f2258f";

struct Daemon {
    root: tempfile::TempDir,
    addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Daemon {
    fn start() -> Daemon {
        let root = tempfile::tempdir().unwrap();
        let config = Config {
            root: root.path().to_path_buf(),
            bind: "127.0.0.1:0".parse().unwrap(),
            timeout: Duration::from_secs(5),
            wrap_algorithm: Algorithm::Sha,
            brr_mask: BrrMask::ALL,
            trust_fs: false,
            heartbeat: None,
        };
        let server = Server::bind(config).unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let thread = thread::spawn(move || server.run(flag).unwrap());
        Daemon {
            root,
            addr,
            shutdown,
            thread: Some(thread),
        }
    }

    fn driver(&self) -> Bio4 {
        Bio4::new("127.0.0.1", self.addr.port(), &QueryArgs::default())
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn hello_udig() -> Udig {
    Udig::new("sha", HELLO_SHA).unwrap()
}

/// A request's audit record is appended after its replies, so a wrap
/// right after a put must wait for the live log to appear.
fn wait_for_live_log(daemon: &Daemon) {
    let path = daemon.root.path().join("spool").join("bstored.brr");
    for _ in 0..250 {
        if path.exists() {
            return;
        }
        thread::sleep(Duration::from_millis(20));
    }
    panic!("live brr log never appeared");
}

#[test]
fn put_get_eat_take_through_the_driver() {
    let daemon = Daemon::start();

    let mut driver = daemon.driver();
    assert!(driver
        .put(&hello_udig(), &Source::Memory(b"hello\n".to_vec()))
        .unwrap());
    assert_eq!(driver.chat().history().as_str(), "ok,ok");
    assert_eq!(driver.blob_size(), 6);

    let out = daemon.root.path().join("fetched");
    let mut driver = daemon.driver();
    assert!(driver
        .get(&hello_udig(), &Sink::Path(out.clone()))
        .unwrap());
    assert_eq!(fs::read(&out).unwrap(), b"hello\n");

    let mut driver = daemon.driver();
    assert!(driver.eat(&hello_udig()).unwrap());

    let mut driver = daemon.driver();
    assert!(driver.take(&hello_udig(), &Sink::Null).unwrap());
    assert_eq!(driver.chat().history().as_str(), "ok,ok,ok");

    let mut driver = daemon.driver();
    assert!(!driver.eat(&hello_udig()).unwrap());
}

#[test]
fn wrong_local_bytes_fail_before_the_wire_does() {
    let daemon = Daemon::start();
    let mut driver = daemon.driver();
    let result = driver.put(&hello_udig(), &Source::Memory(b"junk".to_vec()));
    assert!(matches!(result, Err(ClientError::Digest(_))));
}

#[test]
fn give_forgets_the_input_file() {
    let daemon = Daemon::start();
    let input = daemon.root.path().join("outgoing");
    fs::write(&input, b"hello\n").unwrap();

    let mut driver = daemon.driver();
    assert!(driver
        .give(&hello_udig(), &Source::Path(input.clone()))
        .unwrap());
    assert!(!input.exists());
    assert_eq!(driver.chat().history().as_str(), "ok,ok,ok");
}

#[test]
fn wrap_then_roll_through_the_driver() {
    let daemon = Daemon::start();

    let mut driver = daemon.driver();
    driver
        .put(&hello_udig(), &Source::Memory(b"hello\n".to_vec()))
        .unwrap();
    wait_for_live_log(&daemon);

    let mut driver = daemon.driver();
    let set_udig = driver.wrap().unwrap().expect("a set udig");
    assert_eq!(set_udig.algorithm(), "sha");
    assert_eq!(driver.chat().history().as_str(), "ok,ok");

    let mut driver = daemon.driver();
    assert!(driver.roll(&set_udig).unwrap());
    assert_eq!(driver.chat().history().as_str(), "ok,ok");
    assert_eq!(
        fs::read_dir(daemon.root.path().join("spool/wrap"))
            .unwrap()
            .count(),
        0
    );

    // a roll of a udig that names no set is refused
    let mut driver = daemon.driver();
    let bogus = Udig::new("sha", &"b".repeat(40)).unwrap();
    assert!(!driver.roll(&bogus).unwrap());
}

#[test]
fn the_empty_blob_through_the_driver() {
    let daemon = Daemon::start();
    let empty = Udig::empty(Algorithm::Sha);

    let mut driver = daemon.driver();
    assert!(driver.put(&empty, &Source::Memory(Vec::new())).unwrap());

    let mut driver = daemon.driver();
    assert!(driver.get(&empty, &Sink::Null).unwrap());
    assert_eq!(driver.blob_size(), 0);
}

#[test]
fn cache4_populates_on_miss_and_hits_after() {
    let daemon = Daemon::start();
    let mut origin = daemon.driver();
    origin
        .put(&hello_udig(), &Source::Memory(b"hello\n".to_vec()))
        .unwrap();

    let cache_root = tempfile::tempdir().unwrap();
    let mut cache = Cache4::new(
        "127.0.0.1",
        daemon.addr.port(),
        cache_root.path().to_str().unwrap(),
        &QueryArgs::default(),
    );

    let out = cache_root.path().join("first");
    assert!(cache.get(&hello_udig(), &Sink::Path(out.clone())).unwrap());
    assert_eq!(fs::read(&out).unwrap(), b"hello\n");
    // the miss populated the cache store
    assert!(cache_root
        .path()
        .join(format!("data/sha/f57/2d3/{HELLO_SHA}"))
        .exists());

    // a second read is served without the origin: prove it by stopping
    // the daemon first
    drop(daemon);
    let second = cache_root.path().join("second");
    assert!(cache
        .get(&hello_udig(), &Sink::Path(second.clone()))
        .unwrap());
    assert_eq!(fs::read(&second).unwrap(), b"hello\n");
}
