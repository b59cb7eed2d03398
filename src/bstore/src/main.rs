// This file is part of the bstore blob store.
//
// For the full copyright and license information, please view the LICENSE
// file that was distributed with this source code.

// spell-checker:ignore (names) bstore bstored

use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use chrono::Utc;
use clap::{crate_version, Arg, ArgAction, ArgMatches, Command};
use log::{debug, warn};

use bstore_core::brr::{BrrRecord, Transport, Wall};
use bstore_core::digest::Algorithm;
use bstore_core::service::{Endpoint, ServiceUri};
use bstore_core::udig::Udig;
use bstore_core::wire::Verb;

use bstore::bio4::Bio4;
use bstore::cache4::Cache4;
use bstore::driver::{ClientError, Service, Sink, Source};
use bstore::fs::Fs;

const ABOUT: &str = "bstore ~ client for the content-addressed blob store";

mod options {
    pub const SERVICE: &str = "service";
    pub const UDIG: &str = "udig";
    pub const ALGORITHM: &str = "algorithm";
    pub const INPUT_PATH: &str = "input-path";
    pub const OUTPUT_PATH: &str = "output-path";
    pub const BRR_PATH: &str = "brr-path";
    pub const TRACE: &str = "trace";
}

fn verb_command(name: &'static str, about: &'static str) -> Command {
    Command::new(name)
        .about(about)
        .arg(
            Arg::new(options::SERVICE)
                .long(options::SERVICE)
                .value_name("URI")
                .help("service to talk to: bio4:host:port, fs:dir or cache4:host:port:dir"),
        )
        .arg(
            Arg::new(options::UDIG)
                .long(options::UDIG)
                .value_name("ALGORITHM:DIGEST")
                .conflicts_with(options::ALGORITHM)
                .help("uniform digest naming the blob"),
        )
        .arg(
            Arg::new(options::ALGORITHM)
                .long(options::ALGORITHM)
                .value_name("NAME")
                .help("digest algorithm, when the udig is to be computed from the input"),
        )
        .arg(
            Arg::new(options::INPUT_PATH)
                .long(options::INPUT_PATH)
                .value_name("PATH")
                .value_parser(clap::value_parser!(PathBuf))
                .conflicts_with(options::OUTPUT_PATH)
                .help("read the blob from this file instead of standard input"),
        )
        .arg(
            Arg::new(options::OUTPUT_PATH)
                .long(options::OUTPUT_PATH)
                .value_name("PATH")
                .value_parser(clap::value_parser!(PathBuf))
                .help("write the blob to this file instead of standard output"),
        )
        .arg(
            Arg::new(options::BRR_PATH)
                .long(options::BRR_PATH)
                .value_name("PATH")
                .value_parser(clap::value_parser!(PathBuf))
                .help("append a blob request record for this request"),
        )
        .arg(
            Arg::new(options::TRACE)
                .long(options::TRACE)
                .action(ArgAction::SetTrue)
                .help("trace the exchange on standard error"),
        )
}

fn app() -> Command {
    Command::new("bstore")
        .version(crate_version!())
        .about(ABOUT)
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(verb_command("get", "read a blob"))
        .subcommand(verb_command("put", "store a blob"))
        .subcommand(verb_command("give", "store a blob, then forget the local copy"))
        .subcommand(verb_command("take", "read a blob, then remove it from the service"))
        .subcommand(verb_command("eat", "verify a blob exists, or digest local input"))
        .subcommand(verb_command("wrap", "freeze the audit log into the wrap set"))
        .subcommand(verb_command("roll", "dissolve a wrap set by its udig"))
}

fn main() -> ExitCode {
    let matches = app().get_matches();
    let (verb_name, sub) = matches.subcommand().expect("subcommand is required");

    let mut builder = env_logger::Builder::from_env(env_logger::Env::default());
    if sub.get_flag(options::TRACE) {
        builder.filter_level(log::LevelFilter::Debug);
    }
    builder.init();

    let verb: Verb = verb_name.parse().expect("subcommands are the verbs");
    match run(verb, sub) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            eprintln!("bstore: {verb}: {e}");
            ExitCode::from(e.exit_code())
        }
    }
}

fn run(verb: Verb, sub: &ArgMatches) -> Result<bool, ClientError> {
    let service_uri = sub
        .get_one::<String>(options::SERVICE)
        .map(|uri| {
            uri.parse::<ServiceUri>()
                .map_err(|e| ClientError::BadArg(format!("--service: {e}")))
        })
        .transpose()?;

    // an eat with no service digests local input instead
    let Some(uri) = service_uri else {
        if verb == Verb::Eat {
            return eat_local(sub);
        }
        return Err(ClientError::BadArg(format!(
            "{verb} requires --service"
        )));
    };

    let mut driver: Box<dyn Service> = match &uri.endpoint {
        Endpoint::Bio4 { host, port } => Box::new(Bio4::new(host, *port, &uri.query)),
        Endpoint::Fs { root } => Box::new(Fs::new(root, &uri.query)),
        Endpoint::Cache4 { host, port, root } => {
            Box::new(Cache4::new(host, *port, root, &uri.query))
        }
    };

    let udig = parse_udig(sub)?;
    let start_wall = Utc::now();
    let start = Instant::now();

    let (ok, brr_udig) = match verb {
        Verb::Get | Verb::Take => {
            let udig = require_udig(verb, udig)?;
            let sink = output_sink(sub);
            let ok = if verb == Verb::Get {
                driver.get(&udig, &sink)?
            } else {
                driver.take(&udig, &sink)?
            };
            (ok, udig)
        }
        Verb::Put | Verb::Give => {
            let source = input_source(sub)?;
            let udig = match udig {
                Some(udig) => udig,
                // no udig given: digest the input first
                None => {
                    let algorithm = algorithm_arg(sub)?;
                    let digest = source.digest(algorithm)?;
                    Udig::new(algorithm.name(), &digest)
                        .map_err(|e| ClientError::Digest(e.to_string()))?
                }
            };
            let ok = if verb == Verb::Put {
                driver.put(&udig, &source)?
            } else {
                driver.give(&udig, &source)?
            };
            (ok, udig)
        }
        Verb::Eat => {
            let udig = require_udig(verb, udig)?;
            (driver.eat(&udig)?, udig)
        }
        Verb::Wrap => match driver.wrap()? {
            Some(set_udig) => {
                let sink = output_sink(sub);
                let mut out = sink.open()?;
                out.write_all(format!("{set_udig}\n").as_bytes())?;
                (true, set_udig)
            }
            None => {
                // nothing was wrapped; nothing meaningful to audit
                debug!("wrap: service replied no");
                return Ok(false);
            }
        },
        Verb::Roll => {
            let udig = require_udig(verb, udig)?;
            (driver.roll(&udig)?, udig)
        }
    };

    if let Some(brr_path) = sub.get_one::<PathBuf>(options::BRR_PATH) {
        append_brr(
            brr_path,
            start_wall,
            start.elapsed(),
            verb,
            &brr_udig,
            driver.as_ref(),
        );
    }
    Ok(ok)
}

fn parse_udig(sub: &ArgMatches) -> Result<Option<Udig>, ClientError> {
    sub.get_one::<String>(options::UDIG)
        .map(|text| {
            text.parse::<Udig>()
                .map_err(|e| ClientError::BadArg(format!("--udig: {e}")))
        })
        .transpose()
}

fn require_udig(verb: Verb, udig: Option<Udig>) -> Result<Udig, ClientError> {
    udig.ok_or_else(|| ClientError::BadArg(format!("{verb} requires --udig")))
}

fn algorithm_arg(sub: &ArgMatches) -> Result<Algorithm, ClientError> {
    let name = sub
        .get_one::<String>(options::ALGORITHM)
        .ok_or_else(|| ClientError::BadArg("--udig or --algorithm is required".into()))?;
    Algorithm::from_name(name)
        .ok_or_else(|| ClientError::Digest(format!("unknown algorithm: {name}")))
}

fn output_sink(sub: &ArgMatches) -> Sink {
    match sub.get_one::<PathBuf>(options::OUTPUT_PATH) {
        Some(path) => Sink::Path(path.clone()),
        None => Sink::Stdout,
    }
}

/// Standard input is buffered so the digest can be probed while the blob
/// streams to the service.
fn input_source(sub: &ArgMatches) -> Result<Source, ClientError> {
    match sub.get_one::<PathBuf>(options::INPUT_PATH) {
        Some(path) => Ok(Source::Path(path.clone())),
        None => {
            let mut bytes = Vec::new();
            std::io::stdin().read_to_end(&mut bytes)?;
            Ok(Source::Memory(bytes))
        }
    }
}

/// `eat` with no service: digest local input and print the udig.
fn eat_local(sub: &ArgMatches) -> Result<bool, ClientError> {
    let algorithm = algorithm_arg(sub)?;
    let source = input_source(sub)?;
    let digest = source.digest(algorithm)?;
    println!("{}:{digest}", algorithm.name());
    Ok(true)
}

fn append_brr(
    path: &PathBuf,
    start_wall: chrono::DateTime<Utc>,
    elapsed: std::time::Duration,
    verb: Verb,
    udig: &Udig,
    driver: &dyn Service,
) {
    let (proto, flow) = driver.describe();
    let transport = match Transport::new(&proto, &flow) {
        Ok(transport) => transport,
        Err(e) => {
            warn!("brr: transport for {proto}:{flow}: {e}");
            return;
        }
    };
    let record = BrrRecord::new(
        start_wall,
        transport,
        verb,
        udig.clone(),
        driver.chat().history(),
        driver.blob_size(),
        Wall::from_duration(elapsed),
    );
    let line = record.to_line();
    let result = std::fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)
        .and_then(|mut file| std::io::Write::write_all(&mut file, line.as_bytes()));
    if let Err(e) = result {
        warn!("brr: append {}: {e}", path.display());
    }
}
