// This file is part of the bstore blob store.
//
// For the full copyright and license information, please view the LICENSE
// file that was distributed with this source code.

// spell-checker:ignore (names) arborist

//! The content-addressed storage engine.
//!
//! Four subtrees live under the store root: `data/` (published blobs, keyed
//! by digest fan-out), `tmp/` (scratch files, which MUST share a filesystem
//! with `data/` so rename is atomic), `spool/` (audit logs and the wrap
//! set) and `run/` (the pidfile).
//!
//! All mutation of the blob tree funnels through the arborist: a single
//! thread that renames scratch files into `data/` and garbage collects
//! fan-out directories left empty by a take. Serialising those two
//! operations means a trim can never race a publication under a
//! neighbouring prefix into an error.

use std::fs::{self, File, OpenOptions, Permissions};
use std::io::{self, Read, Write};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{error, info, warn};
use thiserror::Error;

use bstore_core::digest::{Algorithm, Hasher};
use bstore_core::udig::Udig;
use bstore_core::wire::Verb;

/// Published blobs are readable by owner and group, nothing more.
const BLOB_MODE: u32 = 0o440;

/// Scratch files are owner read only; the open descriptor keeps writing.
const SCRATCH_MODE: u32 = 0o400;

/// Fan-out directories: owner full, group search.
const DIR_MODE: u32 = 0o710;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store root {0}: {1}")]
    Root(PathBuf, io::Error),
    #[error("tmp/ and data/ are on different filesystems under {0}")]
    CrossDevice(PathBuf),
    #[error("scratch {0}: {1}")]
    Scratch(PathBuf, io::Error),
    #[error("publish {0}: {1}")]
    Publish(PathBuf, io::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Handle on a store rooted at one directory.
#[derive(Debug, Clone)]
pub struct Store {
    root: PathBuf,
}

impl Store {
    /// Open (creating as needed) the store tree under `root` and verify
    /// the scratch area shares a filesystem with the data tree. A
    /// cross-device layout would make publication non-atomic, so the
    /// store refuses to open rather than fall back to copying.
    pub fn open(root: &Path) -> Result<Store, StoreError> {
        let store = Store {
            root: root.to_path_buf(),
        };
        for dir in [
            store.data_dir(),
            store.tmp_dir(),
            store.spool_dir(),
            store.wrap_dir(),
            store.run_dir(),
        ] {
            fs::create_dir_all(&dir).map_err(|e| StoreError::Root(dir.clone(), e))?;
        }
        let data_dev = fs::metadata(store.data_dir())
            .map_err(|e| StoreError::Root(store.data_dir(), e))?
            .dev();
        let tmp_dev = fs::metadata(store.tmp_dir())
            .map_err(|e| StoreError::Root(store.tmp_dir(), e))?
            .dev();
        if data_dev != tmp_dev {
            return Err(StoreError::CrossDevice(store.root.clone()));
        }
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn data_dir(&self) -> PathBuf {
        self.root.join("data")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    pub fn spool_dir(&self) -> PathBuf {
        self.root.join("spool")
    }

    pub fn wrap_dir(&self) -> PathBuf {
        self.root.join("spool").join("wrap")
    }

    pub fn run_dir(&self) -> PathBuf {
        self.root.join("run")
    }

    /// `data/<algorithm>` — the fan-out stops here on the way back up.
    pub fn algorithm_dir(&self, algorithm: Algorithm) -> PathBuf {
        self.data_dir().join(algorithm.name())
    }

    /// Full path of a published blob.
    pub fn blob_path(&self, algorithm: Algorithm, digest: &str) -> PathBuf {
        self.algorithm_dir(algorithm).join(algorithm.fanout(digest))
    }

    /// Path of the frozen audit log protecting `udig` from take.
    pub fn wrap_brr_path(&self, udig: &Udig) -> PathBuf {
        self.wrap_dir().join(format!("{udig}.brr"))
    }

    pub fn contains(&self, algorithm: Algorithm, digest: &str) -> bool {
        self.blob_path(algorithm, digest).is_file()
    }

    /// Open a scratch file for an incoming blob. Requests are threads of
    /// one process, so the pid alone cannot keep two simultaneous writers
    /// of the same blob apart; a process-wide sequence number does.
    pub fn open_scratch(
        &self,
        verb: Verb,
        algorithm: Algorithm,
        digest: &str,
    ) -> Result<Scratch, StoreError> {
        static SCRATCH_SEQ: AtomicU64 = AtomicU64::new(0);

        let epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let path = self.tmp_dir().join(format!(
            "{}-{}-{}.{}-{}",
            verb,
            epoch,
            std::process::id(),
            SCRATCH_SEQ.fetch_add(1, Ordering::Relaxed),
            digest
        ));
        let file = OpenOptions::new()
            .write(true)
            .append(true)
            .create_new(true)
            .mode(SCRATCH_MODE)
            .open(&path)
            .map_err(|e| StoreError::Scratch(path.clone(), e))?;
        Ok(Scratch {
            path,
            file: Some(file),
            hasher: algorithm.hasher(),
            algorithm,
            target: digest.to_string(),
            size: 0,
            published: false,
        })
    }

    /// Remove a published blob. `ENOENT` means a concurrent take won the
    /// race, which is fine. When `trim` is set the now-possibly-empty
    /// fan-out directories are handed to the arborist.
    pub fn remove_blob(
        &self,
        arborist: &ArborHandle,
        algorithm: Algorithm,
        digest: &str,
        trim: bool,
    ) -> Result<(), StoreError> {
        let path = self.blob_path(algorithm, digest);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(StoreError::Io(e)),
        }
        if trim {
            if let Some(dir) = path.parent() {
                arborist.trim(dir.to_path_buf(), self.algorithm_dir(algorithm));
            }
        }
        Ok(())
    }
}

/// An in-flight blob: scratch file plus the incremental digest over
/// everything written so far.
pub struct Scratch {
    path: PathBuf,
    file: Option<File>,
    hasher: Hasher,
    algorithm: Algorithm,
    target: String,
    size: u64,
    published: bool,
}

impl Scratch {
    /// Append a chunk and probe whether the bytes so far form the target
    /// digest. Returns true on a match: the blob is complete.
    pub fn write_probe(&mut self, chunk: &[u8]) -> Result<bool, StoreError> {
        if let Some(file) = &mut self.file {
            file.write_all(chunk)
                .map_err(|e| StoreError::Scratch(self.path.clone(), e))?;
        }
        self.hasher.update(chunk);
        self.size += chunk.len() as u64;
        Ok(self.matches())
    }

    /// Does the digest of the bytes written so far equal the target?
    /// The well-known empty digest matches before any write.
    pub fn matches(&self) -> bool {
        if self.size == 0 {
            return self.algorithm.is_empty_digest(&self.target);
        }
        self.hasher.probe(&self.target)
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Rename the scratch file onto its content address. Publication of
    /// an already-present blob is a silent success.
    pub fn publish(mut self, store: &Store, arborist: &ArborHandle) -> Result<(), StoreError> {
        self.file.take();
        let target = store.blob_path(self.algorithm, &self.target);
        let result = arborist.rename(self.path.clone(), target.clone());
        self.published = result.is_ok();
        result.map_err(|e| StoreError::Publish(target, e))
    }

    /// Give up: unlink the scratch file.
    pub fn discard(mut self) {
        self.file.take();
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("discard scratch {}: {}", self.path.display(), e);
            }
        }
        self.published = true; // nothing left for Drop
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        if !self.published {
            self.file.take();
            let _ = fs::remove_file(&self.path);
        }
    }
}

/// Stream a file already on disk into the store under `algorithm`.
/// Returns the digest. Used by the wrap engine to publish frozen audit
/// logs. Two passes: one to learn the digest, one through the scratch
/// publisher, so the file never has to fit in memory.
pub fn publish_file(
    store: &Store,
    arborist: &ArborHandle,
    algorithm: Algorithm,
    source: &Path,
) -> Result<String, StoreError> {
    let mut hasher = algorithm.hasher();
    let mut file = File::open(source)?;
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let digest = hasher.finalize();
    if store.contains(algorithm, &digest) {
        return Ok(digest);
    }

    let mut scratch = store.open_scratch(Verb::Put, algorithm, &digest)?;
    let mut file = File::open(source)?;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        scratch.write_probe(&buf[..n])?;
    }
    if !scratch.matches() {
        scratch.discard();
        return Err(StoreError::Io(io::Error::other(
            "file changed while being published",
        )));
    }
    scratch.publish(store, arborist)?;
    Ok(digest)
}

/// Publish in-memory bytes whose digest is already known.
pub fn publish_bytes(
    store: &Store,
    arborist: &ArborHandle,
    algorithm: Algorithm,
    digest: &str,
    bytes: &[u8],
) -> Result<(), StoreError> {
    if store.contains(algorithm, digest) {
        return Ok(());
    }
    let mut scratch = store.open_scratch(Verb::Put, algorithm, digest)?;
    scratch.write_probe(bytes)?;
    if !scratch.matches() {
        scratch.discard();
        return Err(StoreError::Io(io::Error::other(
            "bytes do not hash to the claimed digest",
        )));
    }
    scratch.publish(store, arborist)
}

enum ArborMsg {
    Rename {
        scratch: PathBuf,
        target: PathBuf,
        reply: mpsc::SyncSender<io::Result<()>>,
    },
    Trim {
        dir: PathBuf,
        stop: PathBuf,
    },
}

/// Sending side of the arborist. Cheap to clone into request threads.
#[derive(Clone)]
pub struct ArborHandle {
    tx: mpsc::Sender<ArborMsg>,
}

impl ArborHandle {
    /// Move a scratch file into the data tree, creating the fan-out path.
    /// Blocks until the arborist answers.
    pub fn rename(&self, scratch: PathBuf, target: PathBuf) -> io::Result<()> {
        let (reply, rx) = mpsc::sync_channel(1);
        self.tx
            .send(ArborMsg::Rename {
                scratch,
                target,
                reply,
            })
            .map_err(|_| io::Error::other("arborist is gone"))?;
        rx.recv().map_err(|_| io::Error::other("arborist is gone"))?
    }

    /// Ask for empty ancestors of `dir` to be removed, walking up to but
    /// never past `stop`. Fire and forget; a non-empty directory is a
    /// normal condition.
    pub fn trim(&self, dir: PathBuf, stop: PathBuf) {
        let _ = self.tx.send(ArborMsg::Trim { dir, stop });
    }
}

/// The arborist thread.
pub struct Arborist {
    handle: ArborHandle,
    thread: Option<thread::JoinHandle<()>>,
}

impl Arborist {
    pub fn spawn() -> Arborist {
        let (tx, rx) = mpsc::channel();
        let thread = thread::Builder::new()
            .name("arborist".into())
            .spawn(move || arborist_loop(rx))
            .expect("spawn arborist");
        Arborist {
            handle: ArborHandle { tx },
            thread: Some(thread),
        }
    }

    pub fn handle(&self) -> ArborHandle {
        self.handle.clone()
    }

    /// Drain outstanding work and stop the thread. Blocks until every
    /// cloned [`ArborHandle`] has been dropped.
    pub fn shutdown(self) {
        let Arborist { handle, thread } = self;
        drop(handle);
        if let Some(thread) = thread {
            let _ = thread.join();
        }
    }
}

fn arborist_loop(rx: mpsc::Receiver<ArborMsg>) {
    info!("arborist started");
    while let Ok(msg) = rx.recv() {
        match msg {
            ArborMsg::Rename {
                scratch,
                target,
                reply,
            } => {
                let _ = reply.send(rename_blob(&scratch, &target));
            }
            ArborMsg::Trim { dir, stop } => trim_blob_dir(&dir, &stop),
        }
    }
    info!("arborist shut down");
}

/// Create the fan-out and rename the scratch file into place. A missing
/// parent directory can reappear-as-missing when a concurrent take trims
/// it between our mkdir and rename, so the rename is retried a few times.
fn rename_blob(scratch: &Path, target: &Path) -> io::Result<()> {
    const RENAME_ATTEMPTS: u32 = 3;

    let parent = target
        .parent()
        .ok_or_else(|| io::Error::other("blob path has no parent"))?;
    let mut attempt = 0;
    loop {
        attempt += 1;
        make_dir_path(parent)?;
        match fs::rename(scratch, target) {
            Ok(()) => break,
            Err(e) if e.kind() == io::ErrorKind::NotFound && attempt < RENAME_ATTEMPTS => {
                warn!(
                    "rename {} -> {}: fan-out vanished, remaking (attempt {attempt})",
                    scratch.display(),
                    target.display()
                );
            }
            Err(e) => return Err(e),
        }
    }
    fs::set_permissions(target, Permissions::from_mode(BLOB_MODE))
}

fn make_dir_path(dir: &Path) -> io::Result<()> {
    match fs::create_dir_all(dir) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
        Err(e) => return Err(e),
    }
    // permissions only matter on fresh directories; chmod of an existing
    // fan-out would race published readers, so best effort
    let _ = fs::set_permissions(dir, Permissions::from_mode(DIR_MODE));
    Ok(())
}

/// Remove empty directories from `dir` upward, stopping at `stop`.
/// `ENOTEMPTY` and `ENOENT` are normal; anything else is logged and ends
/// the walk.
fn trim_blob_dir(dir: &Path, stop: &Path) {
    let mut current = dir;
    while current != stop {
        match fs::remove_dir(current) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) if e.kind() == io::ErrorKind::DirectoryNotEmpty => return,
            Err(e) => {
                error!("trim {}: {}", current.display(), e);
                return;
            }
        }
        current = match current.parent() {
            Some(parent) => parent,
            None => return,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bstore_core::digest::Algorithm;

    const HELLO_SHA: &str = "f572d396fae9206628714fb2ce00f72e94f2258f";

    fn test_store() -> (tempfile::TempDir, Store, Arborist) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let arborist = Arborist::spawn();
        (dir, store, arborist)
    }

    #[test]
    fn open_creates_the_tree() {
        let (dir, store, arborist) = test_store();
        for sub in ["data", "tmp", "spool", "spool/wrap", "run"] {
            assert!(dir.path().join(sub).is_dir(), "{sub} missing");
        }
        assert_eq!(store.root(), dir.path());
        arborist.shutdown();
    }

    #[test]
    fn publish_and_remove_round_trip() {
        let (_dir, store, arborist) = test_store();
        let handle = arborist.handle();

        let mut scratch = store
            .open_scratch(Verb::Put, Algorithm::Sha, HELLO_SHA)
            .unwrap();
        assert!(!scratch.write_probe(b"hel").unwrap());
        assert!(scratch.write_probe(b"lo\n").unwrap());
        assert_eq!(scratch.size(), 6);
        scratch.publish(&store, &handle).unwrap();

        let path = store.blob_path(Algorithm::Sha, HELLO_SHA);
        assert_eq!(fs::read(&path).unwrap(), b"hello\n");
        assert!(store.contains(Algorithm::Sha, HELLO_SHA));

        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, BLOB_MODE);

        store
            .remove_blob(&handle, Algorithm::Sha, HELLO_SHA, true)
            .unwrap();
        assert!(!store.contains(Algorithm::Sha, HELLO_SHA));

        // removing an absent blob tolerates the lost race
        store
            .remove_blob(&handle, Algorithm::Sha, HELLO_SHA, false)
            .unwrap();
        drop(handle);
        arborist.shutdown();
        // after the arborist drained, the fan-out is gone but the
        // algorithm directory survives
        assert!(!store
            .blob_path(Algorithm::Sha, HELLO_SHA)
            .parent()
            .unwrap()
            .exists());
        assert!(store.algorithm_dir(Algorithm::Sha).exists());
    }

    #[test]
    fn publish_is_idempotent() {
        let (_dir, store, arborist) = test_store();
        let handle = arborist.handle();
        for _ in 0..2 {
            let mut scratch = store
                .open_scratch(Verb::Put, Algorithm::Sha, HELLO_SHA)
                .unwrap();
            scratch.write_probe(b"hello\n").unwrap();
            scratch.publish(&store, &handle).unwrap();
        }
        assert_eq!(
            fs::read(store.blob_path(Algorithm::Sha, HELLO_SHA)).unwrap(),
            b"hello\n"
        );
        drop(handle);
        arborist.shutdown();
    }

    #[test]
    fn empty_blob_matches_before_any_write() {
        let (_dir, store, arborist) = test_store();
        let handle = arborist.handle();
        let scratch = store
            .open_scratch(Verb::Put, Algorithm::Sha, Algorithm::Sha.empty_digest())
            .unwrap();
        assert!(scratch.matches());
        scratch.publish(&store, &handle).unwrap();
        let path = store.blob_path(Algorithm::Sha, Algorithm::Sha.empty_digest());
        assert_eq!(fs::metadata(path).unwrap().len(), 0);
        drop(handle);
        arborist.shutdown();
    }

    #[test]
    fn discarded_scratch_leaves_no_litter() {
        let (dir, store, arborist) = test_store();
        {
            let mut scratch = store
                .open_scratch(Verb::Put, Algorithm::Sha, HELLO_SHA)
                .unwrap();
            scratch.write_probe(b"junk that will never match").unwrap();
            scratch.discard();
        }
        {
            let mut scratch = store
                .open_scratch(Verb::Give, Algorithm::Sha, HELLO_SHA)
                .unwrap();
            scratch.write_probe(b"dropped without publish").unwrap();
            // dropped here
        }
        let leftovers: Vec<_> = fs::read_dir(dir.path().join("tmp")).unwrap().collect();
        assert!(leftovers.is_empty());
        arborist.shutdown();
    }

    #[test]
    fn publish_file_digests_and_stores() {
        let (dir, store, arborist) = test_store();
        let handle = arborist.handle();
        let source = dir.path().join("spool").join("loose");
        fs::write(&source, b"hello\n").unwrap();
        let digest = publish_file(&store, &handle, Algorithm::Sha, &source).unwrap();
        assert_eq!(digest, HELLO_SHA);
        assert!(store.contains(Algorithm::Sha, &digest));
        drop(handle);
        arborist.shutdown();
    }

    #[test]
    fn cross_device_is_refused() {
        // /proc lives on a different filesystem than /tmp on any linux
        // box this test will run on; a store root cannot span them, so
        // fake the situation by checking the device comparison directly.
        let a = fs::metadata("/tmp").map(|m| m.dev());
        let b = fs::metadata("/proc").map(|m| m.dev());
        if let (Ok(a), Ok(b)) = (a, b) {
            assert_ne!(a, b);
        }
    }
}
