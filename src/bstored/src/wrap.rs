// This file is part of the bstore blob store.
//
// For the full copyright and license information, please view the LICENSE
// file that was distributed with this source code.

//! Wrap and roll: log rotation through content-addressed self-reference.
//!
//! A `wrap` freezes the live audit log, publishes the frozen file as a
//! blob, files it under `spool/wrap/<udig>.brr`, and publishes the set of
//! every udig currently in `spool/wrap/` as a second blob — the wrap set —
//! whose udig is handed back to the client. A later `roll` of that set
//! udig dissolves it: every frozen log the set names is unlinked from
//! `spool/wrap/`, which is what re-arms `take` for the blobs those logs
//! mention. The frozen logs themselves stay published in `data/`.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::Path;

use log::{info, warn};
use thiserror::Error;

use bstore_core::digest::Algorithm;
use bstore_core::udig::Udig;

use crate::logger::LoggerHandle;
use crate::store::{self, ArborHandle, Store, StoreError};

#[derive(Debug, Error)]
pub enum WrapError {
    /// Nothing to wrap: no record has been appended since the last freeze.
    #[error("no audit log to wrap")]
    NoLog,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Freeze the audit log and snapshot the wrap set. Returns the udig of
/// the published set blob.
pub fn wrap(
    store: &Store,
    arborist: &ArborHandle,
    logger: &LoggerHandle,
    algorithm: Algorithm,
) -> Result<Udig, WrapError> {
    let frozen = logger.freeze()?.ok_or(WrapError::NoLog)?;
    info!("frozen brr log: {}", frozen.display());

    // the frozen log becomes an ordinary blob, then takes its place in
    // the wrap set under its own udig
    let digest = store::publish_file(store, arborist, algorithm, &frozen)?;
    let frozen_udig = Udig::new(algorithm.name(), &digest)
        .map_err(|e| StoreError::Io(io::Error::other(e.to_string())))?;
    let wrap_path = store.wrap_brr_path(&frozen_udig);
    fs::rename(&frozen, &wrap_path)?;
    info!("udig of frozen brr log: {frozen_udig}");

    // snapshot spool/wrap/: the fresh udig leads, the remainder follows
    // byte-lexicographically so the set bytes are reproducible
    let mut others = Vec::new();
    for entry in fs::read_dir(store.wrap_dir())? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            warn!(
                "non regular file in spool/wrap: {}",
                entry.path().display()
            );
            continue;
        }
        let name = entry.file_name();
        let Some(udig) = wrap_file_udig(Path::new(&name)) else {
            warn!(
                "file in spool/wrap does not match <udig>.brr: {}",
                entry.path().display()
            );
            continue;
        };
        if udig != frozen_udig {
            others.push(udig);
        }
    }
    others.sort_by(|a, b| a.to_string().cmp(&b.to_string()));

    let mut set = String::new();
    set.push_str(&frozen_udig.to_string());
    set.push('\n');
    for udig in &others {
        set.push_str(&udig.to_string());
        set.push('\n');
    }
    info!("{} udig(s) in wrap set of frozen brr logs", 1 + others.len());

    let mut hasher = algorithm.hasher();
    hasher.update(set.as_bytes());
    let set_digest = hasher.finalize();
    store::publish_bytes(store, arborist, algorithm, &set_digest, set.as_bytes())?;

    let set_udig = Udig::new(algorithm.name(), &set_digest)
        .map_err(|e| StoreError::Io(io::Error::other(e.to_string())))?;
    info!("udig of wrapped set: {set_udig}");
    Ok(set_udig)
}

/// Why a roll was refused. The connection answers `no` and moves on.
#[derive(Debug, PartialEq, Eq)]
pub enum RollRefusal {
    /// The named set blob is not in the store.
    NoSuchBlob,
    /// The blob is not a well-formed udig set.
    BadSet(String),
}

/// Fetch and parse the udig-set blob a roll names. The refusal is the
/// caller's cue to answer `no`.
pub fn load_roll_set(
    store: &Store,
    algorithm: Algorithm,
    digest: &str,
) -> Result<Result<Vec<Udig>, RollRefusal>, WrapError> {
    let path = store.blob_path(algorithm, digest);
    let bytes = match fs::read(&path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Ok(Err(RollRefusal::NoSuchBlob))
        }
        Err(e) => return Err(e.into()),
    };

    match parse_udig_set(&bytes) {
        Ok(set) => Ok(Ok(set)),
        Err(reason) => {
            warn!("roll {algorithm}:{digest}: blob not a udig set: {reason}");
            Ok(Err(RollRefusal::BadSet(reason)))
        }
    }
}

/// Unlink every frozen log in `spool/wrap/` the set names. Returns how
/// many were removed.
pub fn dissolve_set(store: &Store, set: &[Udig]) -> Result<usize, WrapError> {
    let mut removed = 0;
    for udig in set {
        match fs::remove_file(store.wrap_brr_path(udig)) {
            Ok(()) => removed += 1,
            // a simultaneous roll already unlinked it
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    if removed > 0 {
        info!("removed {removed} brr log file(s) in roll set");
    } else {
        info!("no frozen brr logs in spool/wrap/ matched the roll set");
    }
    Ok(removed)
}

/// Both roll phases back to back.
pub fn roll(
    store: &Store,
    algorithm: Algorithm,
    digest: &str,
) -> Result<Result<usize, RollRefusal>, WrapError> {
    match load_roll_set(store, algorithm, digest)? {
        Ok(set) => Ok(Ok(dissolve_set(store, &set)?)),
        Err(refusal) => Ok(Err(refusal)),
    }
}

/// Extract the udig from a `spool/wrap` file name of the form `<udig>.brr`.
fn wrap_file_udig(name: &Path) -> Option<Udig> {
    let name = name.to_str()?;
    let stem = name.strip_suffix(".brr")?;
    let udig: Udig = stem.parse().ok()?;
    // only names whose digest matches an installed module protect blobs
    if !udig.is_syntactic() {
        return None;
    }
    Some(udig)
}

/// Parse a udig-set blob: `(algorithm:digest\n)*`, graphic ascii,
/// no duplicate lines. The empty set is legal.
pub fn parse_udig_set(bytes: &[u8]) -> Result<Vec<Udig>, String> {
    if bytes.is_empty() {
        return Ok(Vec::new());
    }
    if *bytes.last().expect("non empty") != b'\n' {
        return Err("last character of blob is not newline".into());
    }
    let text = std::str::from_utf8(bytes).map_err(|e| format!("not ascii text: {e}"))?;

    let mut set = Vec::new();
    let mut seen = HashSet::new();
    for (number, line) in text.lines().enumerate() {
        let udig: Udig = line
            .parse()
            .map_err(|e| format!("line {}: {e}", number + 1))?;
        if !seen.insert(udig.clone()) {
            return Err(format!("duplicate udig in set: {udig}"));
        }
        set.push(udig);
    }
    Ok(set)
}
