// This file is part of the bstore blob store.
//
// For the full copyright and license information, please view the LICENSE
// file that was distributed with this source code.

// spell-checker:ignore (names) bstored

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{crate_version, Arg, ArgAction, Command};
use log::error;

use bstore_core::brr::BrrMask;
use bstore_core::digest::Algorithm;

use bstored::server::{Config, Server};

const ABOUT: &str = "bstored ~ content-addressed blob store daemon";
const DEFAULT_BIND: &str = "0.0.0.0:1797";

mod options {
    pub const ROOT: &str = "root";
    pub const BIND: &str = "bind";
    pub const TIMEOUT: &str = "timeout";
    pub const WRAP_ALGORITHM: &str = "wrap-algorithm";
    pub const BRR_MASK: &str = "brr-mask";
    pub const HEARTBEAT: &str = "heartbeat";
    pub const TRUST_FS: &str = "trust-fs";
}

fn app() -> Command {
    Command::new("bstored")
        .version(crate_version!())
        .about(ABOUT)
        .infer_long_args(true)
        .arg(
            Arg::new(options::ROOT)
                .long(options::ROOT)
                .value_name("DIR")
                .value_parser(clap::value_parser!(PathBuf))
                .default_value(".")
                .help("store root holding data/, tmp/, spool/ and run/"),
        )
        .arg(
            Arg::new(options::BIND)
                .long(options::BIND)
                .value_name("ADDR:PORT")
                .default_value(DEFAULT_BIND)
                .help("listen address"),
        )
        .arg(
            Arg::new(options::TIMEOUT)
                .long(options::TIMEOUT)
                .value_name("SECONDS")
                .value_parser(clap::value_parser!(u8).range(1..))
                .default_value("20")
                .help("peer read/write timeout, 1..=255 seconds"),
        )
        .arg(
            Arg::new(options::WRAP_ALGORITHM)
                .long(options::WRAP_ALGORITHM)
                .value_name("ALGORITHM")
                .default_value("sha")
                .help("digest algorithm for wrapped audit logs"),
        )
        .arg(
            Arg::new(options::BRR_MASK)
                .long(options::BRR_MASK)
                .value_name("HEX")
                .default_value("0xff")
                .help("bitmask of verbs that produce audit records"),
        )
        .arg(
            Arg::new(options::HEARTBEAT)
                .long(options::HEARTBEAT)
                .value_name("SECONDS")
                .value_parser(clap::value_parser!(u64))
                .default_value("60")
                .help("cadence of the heartbeat log line; 0 disables it"),
        )
        .arg(
            Arg::new(options::TRUST_FS)
                .long(options::TRUST_FS)
                .action(ArgAction::SetTrue)
                .help("trust the filesystem: skip read-back digest verification"),
        )
}

fn parse_mask(text: &str) -> Option<BrrMask> {
    let hex = text.strip_prefix("0x").unwrap_or(text);
    u8::from_str_radix(hex, 16).ok().map(BrrMask)
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let matches = app().get_matches();

    let bind: SocketAddr = match matches
        .get_one::<String>(options::BIND)
        .expect("bind has a default")
        .parse()
    {
        Ok(bind) => bind,
        Err(e) => {
            error!("--bind: {e}");
            return ExitCode::from(2);
        }
    };

    let wrap_name = matches
        .get_one::<String>(options::WRAP_ALGORITHM)
        .expect("wrap algorithm has a default");
    let Some(wrap_algorithm) = Algorithm::from_name(wrap_name) else {
        error!("--wrap-algorithm: unknown digest algorithm: {wrap_name}");
        return ExitCode::from(2);
    };

    let mask_text = matches
        .get_one::<String>(options::BRR_MASK)
        .expect("brr mask has a default");
    let Some(brr_mask) = parse_mask(mask_text) else {
        error!("--brr-mask: not a hex byte: {mask_text}");
        return ExitCode::from(2);
    };

    let heartbeat = match matches
        .get_one::<u64>(options::HEARTBEAT)
        .copied()
        .expect("heartbeat has a default")
    {
        0 => None,
        secs => Some(Duration::from_secs(secs)),
    };

    let config = Config {
        root: matches
            .get_one::<PathBuf>(options::ROOT)
            .expect("root has a default")
            .clone(),
        bind,
        timeout: Duration::from_secs(u64::from(
            *matches.get_one::<u8>(options::TIMEOUT).expect("default"),
        )),
        wrap_algorithm,
        brr_mask,
        trust_fs: matches.get_flag(options::TRUST_FS),
        heartbeat,
    };

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        if let Err(e) = ctrlc::set_handler(move || {
            shutdown.store(true, Ordering::SeqCst);
        }) {
            error!("signal handler: {e}");
            return ExitCode::FAILURE;
        }
    }

    let server = match Server::bind(config) {
        Ok(server) => server,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };
    match server.run(shutdown) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse() {
        let matches = app().get_matches_from(["bstored"]);
        assert_eq!(
            matches.get_one::<String>(options::BIND).unwrap(),
            DEFAULT_BIND
        );
        assert_eq!(*matches.get_one::<u8>(options::TIMEOUT).unwrap(), 20);
    }

    #[test]
    fn mask_accepts_prefixed_and_bare_hex() {
        assert_eq!(parse_mask("0xff"), Some(BrrMask(0xff)));
        assert_eq!(parse_mask("6e"), Some(BrrMask(0x6e)));
        assert_eq!(parse_mask("zz"), None);
    }

    #[test]
    fn timeout_range_is_enforced() {
        assert!(app()
            .try_get_matches_from(["bstored", "--timeout", "0"])
            .is_err());
        assert!(app()
            .try_get_matches_from(["bstored", "--timeout", "300"])
            .is_err());
    }
}
