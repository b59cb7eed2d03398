// This file is part of the bstore blob store.
//
// For the full copyright and license information, please view the LICENSE
// file that was distributed with this source code.

//! The `cache4` driver: a `bio4` origin fronted by an `fs` cache.
//!
//! Only reads are supported. A hit is served straight from the cache
//! store; a miss fetches the blob from the origin into the cache's
//! scratch area, publishes it, and serves the caller from the cache.

use std::fs;
use std::time::{SystemTime, UNIX_EPOCH};

use log::debug;

use bstore_core::brr::ChatLog;
use bstore_core::service::QueryArgs;
use bstore_core::udig::Udig;

use crate::bio4::Bio4;
use crate::driver::{ClientError, Service, Sink, Source};
use crate::fs::Fs;

pub struct Cache4 {
    origin: Bio4,
    cache: Fs,
    chat: ChatLog,
}

impl Cache4 {
    pub fn new(host: &str, port: u16, root: &str, query: &QueryArgs) -> Cache4 {
        Cache4 {
            origin: Bio4::new(host, port, query),
            cache: Fs::new(root, query),
            chat: ChatLog::new(),
        }
    }

    fn unsupported(verb: &str) -> ClientError {
        ClientError::Service(format!("{verb} is not supported by the cache4 service"))
    }
}

impl Service for Cache4 {
    fn describe(&self) -> (String, String) {
        let (_, origin) = self.origin.describe();
        let (_, root) = self.cache.describe();
        ("cache4".into(), format!("{origin}:{root}"))
    }

    fn get(&mut self, udig: &Udig, sink: &Sink) -> Result<bool, ClientError> {
        if self.cache.get(udig, sink)? {
            debug!("cache4: hit for {udig}");
            self.chat.push_ok();
            return Ok(true);
        }
        debug!("cache4: miss for {udig}, asking origin");

        // fetch through the verifying bio4 path into the cache's scratch
        // area, publish, then serve the caller from the cache
        let tmp_dir = self.cache.root().join("tmp");
        fs::create_dir_all(&tmp_dir)?;
        let epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let fetched = tmp_dir.join(format!(
            "cache4-{}-{}-{}",
            epoch,
            std::process::id(),
            udig.digest()
        ));

        let hit = self.origin.get(udig, &Sink::Path(fetched.clone()))?;
        if !hit {
            let _ = fs::remove_file(&fetched);
            self.chat.push_no();
            return Ok(false);
        }
        let stored = self.cache.put(udig, &Source::Path(fetched.clone()));
        let _ = fs::remove_file(&fetched);
        stored?;

        let served = self.cache.get(udig, sink)?;
        if served {
            self.chat.push_ok();
        } else {
            self.chat.push_no();
        }
        Ok(served)
    }

    fn put(&mut self, _udig: &Udig, _source: &Source) -> Result<bool, ClientError> {
        Err(Cache4::unsupported("put"))
    }

    fn take(&mut self, _udig: &Udig, _sink: &Sink) -> Result<bool, ClientError> {
        Err(Cache4::unsupported("take"))
    }

    fn give(&mut self, _udig: &Udig, _source: &Source) -> Result<bool, ClientError> {
        Err(Cache4::unsupported("give"))
    }

    fn eat(&mut self, udig: &Udig) -> Result<bool, ClientError> {
        // presence in the cache answers without touching the origin
        let present = if self.cache.eat(udig)? {
            true
        } else {
            self.origin.eat(udig)?
        };
        if present {
            self.chat.push_ok();
        } else {
            self.chat.push_no();
        }
        Ok(present)
    }

    fn wrap(&mut self) -> Result<Option<Udig>, ClientError> {
        Err(Cache4::unsupported("wrap"))
    }

    fn roll(&mut self, _udig: &Udig) -> Result<bool, ClientError> {
        Err(Cache4::unsupported("roll"))
    }

    fn chat(&self) -> &ChatLog {
        &self.chat
    }

    fn blob_size(&self) -> u64 {
        self.origin.blob_size() + self.cache.blob_size()
    }
}
