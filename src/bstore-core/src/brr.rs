// This file is part of the bstore blob store.
//
// For the full copyright and license information, please view the LICENSE
// file that was distributed with this source code.

//! Blob request records.
//!
//! One request, one tab-separated line:
//!
//! ```text
//! start-time \t transport \t verb \t udig \t chat \t size \t duration \n
//! ```
//!
//! The field grammars are bit-exact: a line accepted by [`BrrRecord::frisk`]
//! re-serialises through [`BrrRecord::to_line`] to the identical bytes.
//! The start time is therefore kept in its ascii form; calendar arithmetic
//! happens on the way in, not on the way out.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use thiserror::Error;

use crate::udig::{Udig, UdigError};
use crate::wire::Verb;

/// Smallest accepted record, newline included.
pub const MIN_BRR_LEN: usize = 35;

/// Largest accepted record, newline included.
pub const MAX_BRR_LEN: usize = 419;

/// Transport flow description is at most this many graphic characters.
pub const MAX_FLOW_LEN: usize = 128;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BrrError {
    #[error("record length {0} not in {MIN_BRR_LEN}..={MAX_BRR_LEN}")]
    BadLength(usize),
    #[error("record not newline terminated")]
    NoNewline,
    #[error("expected 7 tab separated fields, got {0}")]
    BadFieldCount(usize),
    #[error("start time: {0}")]
    BadStartTime(String),
    #[error("transport: {0}")]
    BadTransport(String),
    #[error("not a verb: {0:?}")]
    BadVerb(String),
    #[error("udig: {0}")]
    BadUdig(#[from] UdigError),
    #[error("not a chat history: {0:?}")]
    BadChatHistory(String),
    #[error("blob size: {0}")]
    BadBlobSize(String),
    #[error("wall duration: {0}")]
    BadWallDuration(String),
}

/// The comma-joined ok/no acknowledgement sequence of one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatHistory {
    Ok,
    No,
    OkOk,
    OkNo,
    OkOkOk,
    OkOkNo,
}

impl ChatHistory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatHistory::Ok => "ok",
            ChatHistory::No => "no",
            ChatHistory::OkOk => "ok,ok",
            ChatHistory::OkNo => "ok,no",
            ChatHistory::OkOkOk => "ok,ok,ok",
            ChatHistory::OkOkNo => "ok,ok,no",
        }
    }

    /// Chat outcome bits of the request exit classification.
    pub fn outcome_bits(&self) -> u8 {
        match self {
            ChatHistory::Ok | ChatHistory::OkOk | ChatHistory::OkOkOk => 0,
            ChatHistory::No => 1,
            ChatHistory::OkNo => 2,
            ChatHistory::OkOkNo => 3,
        }
    }
}

impl FromStr for ChatHistory {
    type Err = ();

    fn from_str(s: &str) -> Result<ChatHistory, ()> {
        match s {
            "ok" => Ok(ChatHistory::Ok),
            "no" => Ok(ChatHistory::No),
            "ok,ok" => Ok(ChatHistory::OkOk),
            "ok,no" => Ok(ChatHistory::OkNo),
            "ok,ok,ok" => Ok(ChatHistory::OkOkOk),
            "ok,ok,no" => Ok(ChatHistory::OkOkNo),
            _ => Err(()),
        }
    }
}

impl fmt::Display for ChatHistory {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accumulates directional acknowledgements while a request runs and
/// renders them as the record's chat history on completion.
#[derive(Debug, Default, Clone)]
pub struct ChatLog {
    acks: Vec<bool>,
}

impl ChatLog {
    pub fn new() -> ChatLog {
        ChatLog::default()
    }

    pub fn push_ok(&mut self) {
        self.acks.push(true);
    }

    pub fn push_no(&mut self) {
        self.acks.push(false);
    }

    /// The legal history for the acks seen so far.
    ///
    /// An aborted request that exchanged nothing reports `no`: the peer
    /// observed a failure.
    pub fn history(&self) -> ChatHistory {
        match self.acks.as_slice() {
            [] | [false] => ChatHistory::No,
            [true] => ChatHistory::Ok,
            [true, true] => ChatHistory::OkOk,
            [true, false] => ChatHistory::OkNo,
            [true, true, true] => ChatHistory::OkOkOk,
            [true, true, false] => ChatHistory::OkOkNo,
            other => unreachable!("illegal chat sequence: {other:?}"),
        }
    }
}

/// `<proto>~<flow>`: how the peer reached us, for the audit trail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transport {
    proto: String,
    flow: String,
}

impl Transport {
    pub fn new(proto: &str, flow: &str) -> Result<Transport, BrrError> {
        if !crate::udig::is_algorithm_name(proto) {
            return Err(BrrError::BadTransport(format!(
                "protocol not [a-z][a-z0-9]{{0,7}}: {proto:?}"
            )));
        }
        if flow.is_empty() || flow.len() > MAX_FLOW_LEN {
            return Err(BrrError::BadTransport(format!(
                "flow length {} not in 1..={MAX_FLOW_LEN}",
                flow.len()
            )));
        }
        if let Some(c) = flow.bytes().find(|c| !c.is_ascii_graphic()) {
            return Err(BrrError::BadTransport(format!("flow: bad char 0x{c:02x}")));
        }
        Ok(Transport {
            proto: proto.into(),
            flow: flow.into(),
        })
    }

    pub fn proto(&self) -> &str {
        &self.proto
    }

    pub fn flow(&self) -> &str {
        &self.flow
    }
}

impl FromStr for Transport {
    type Err = BrrError;

    fn from_str(s: &str) -> Result<Transport, BrrError> {
        let (proto, flow) = s
            .split_once('~')
            .ok_or_else(|| BrrError::BadTransport("tilde not seen".into()))?;
        Transport::new(proto, flow)
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}~{}", self.proto, self.flow)
    }
}

/// Wall clock duration of the request as `sec.ns9`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Wall {
    pub sec: u64,
    pub nsec: u32,
}

impl Wall {
    pub fn from_duration(d: Duration) -> Wall {
        Wall {
            sec: d.as_secs(),
            nsec: d.subsec_nanos(),
        }
    }
}

impl fmt::Display for Wall {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{:09}", self.sec, self.nsec)
    }
}

/// Render `t` in the record's RFC3339Nano form: always nine fractional
/// digits, always the explicit `+00:00` offset.
pub fn format_start_time(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, false)
}

fn frisk_start_time(field: &str) -> Result<(), BrrError> {
    let b = field.as_bytes();
    if b.len() < 26 || b.len() > 35 {
        return Err(BrrError::BadStartTime(format!(
            "length {} not in 26..=35",
            b.len()
        )));
    }
    for (pos, want) in [(4, b'-'), (7, b'-'), (10, b'T'), (13, b':'), (16, b':'), (19, b'.')] {
        if b[pos] != want {
            return Err(BrrError::BadStartTime(format!(
                "{:?} not at position {}",
                want as char,
                pos + 1
            )));
        }
    }
    if let Some(&c) = b
        .iter()
        .find(|&&c| !c.is_ascii_digit() && !matches!(c, b'-' | b'T' | b':' | b'.' | b'+'))
    {
        return Err(BrrError::BadStartTime(format!("bad char 0x{c:02x}")));
    }
    Ok(())
}

/// Decimal with no redundant leading zero, so the parse re-serialises to
/// the identical bytes.
fn frisk_decimal(field: &str, max_len: usize) -> Result<u64, String> {
    if field.is_empty() || field.len() > max_len {
        return Err(format!("length {} not in 1..={max_len}", field.len()));
    }
    if field.bytes().any(|c| !c.is_ascii_digit()) {
        return Err(format!("non digit in {field:?}"));
    }
    if field.len() > 1 && field.starts_with('0') {
        return Err(format!("leading zero in {field:?}"));
    }
    field.parse::<u64>().map_err(|e| e.to_string())
}

/// One blob request record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrrRecord {
    start_time: String,
    pub transport: Transport,
    pub verb: Verb,
    pub udig: Udig,
    pub chat: ChatHistory,
    pub blob_size: u64,
    pub wall: Wall,
}

impl BrrRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        start_time: DateTime<Utc>,
        transport: Transport,
        verb: Verb,
        udig: Udig,
        chat: ChatHistory,
        blob_size: u64,
        wall: Wall,
    ) -> BrrRecord {
        BrrRecord {
            start_time: format_start_time(start_time),
            transport,
            verb,
            udig,
            chat,
            blob_size,
            wall,
        }
    }

    pub fn start_time(&self) -> &str {
        &self.start_time
    }

    /// The full record line, newline terminated.
    pub fn to_line(&self) -> String {
        format!(
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\n",
            self.start_time,
            self.transport,
            self.verb,
            self.udig,
            self.chat,
            self.blob_size,
            self.wall,
        )
    }

    /// Validate one record line, newline included, against the bit-exact
    /// field grammars.
    pub fn frisk(line: &str) -> Result<BrrRecord, BrrError> {
        if !(MIN_BRR_LEN..=MAX_BRR_LEN).contains(&line.len()) {
            return Err(BrrError::BadLength(line.len()));
        }
        let body = line.strip_suffix('\n').ok_or(BrrError::NoNewline)?;
        if body.contains('\n') {
            return Err(BrrError::NoNewline);
        }

        let fields: Vec<&str> = body.split('\t').collect();
        let [start_time, transport, verb, udig, chat, blob_size, wall] = fields.as_slice() else {
            return Err(BrrError::BadFieldCount(fields.len()));
        };

        frisk_start_time(start_time)?;
        let transport: Transport = transport.parse()?;
        let verb: Verb = verb
            .parse()
            .map_err(|()| BrrError::BadVerb((*verb).into()))?;
        let udig: Udig = udig.parse()?;
        let chat: ChatHistory = chat
            .parse()
            .map_err(|()| BrrError::BadChatHistory((*chat).into()))?;

        let blob_size = frisk_decimal(blob_size, 19).map_err(BrrError::BadBlobSize)?;
        if blob_size > i64::MAX as u64 {
            return Err(BrrError::BadBlobSize(format!("{blob_size} > 2^63-1")));
        }

        let (sec, nsec) = wall
            .split_once('.')
            .ok_or_else(|| BrrError::BadWallDuration("dot not seen".into()))?;
        let sec = frisk_decimal(sec, 10).map_err(BrrError::BadWallDuration)?;
        if nsec.len() != 9 || nsec.bytes().any(|c| !c.is_ascii_digit()) {
            return Err(BrrError::BadWallDuration(format!(
                "nanoseconds not 9 digits: {nsec:?}"
            )));
        }
        let nsec: u32 = nsec
            .parse()
            .map_err(|_| BrrError::BadWallDuration(format!("bad nanoseconds {nsec:?}")))?;

        Ok(BrrRecord {
            start_time: (*start_time).into(),
            transport,
            verb,
            udig,
            chat,
            blob_size,
            wall: Wall { sec, nsec },
        })
    }
}

/// Which verbs produce records. One bit per verb, `0xff` logs everything;
/// bit `0x80` is reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrrMask(pub u8);

impl BrrMask {
    pub const ALL: BrrMask = BrrMask(0xff);

    pub fn is_set(&self, verb: Verb) -> bool {
        self.0 & verb.mask_bit() != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::Algorithm;

    fn sample_line() -> String {
        format!(
            "2024-07-02T18:22:45.987654321+00:00\ttcp4~10.0.0.7:40968;10.0.0.2:1797\
             \tput\t{}\tok,ok\t0\t0.000481276\n",
            Udig::empty(Algorithm::Sha)
        )
    }

    #[test]
    fn frisk_round_trips_bit_exact() {
        let line = sample_line();
        let record = BrrRecord::frisk(&line).unwrap();
        assert_eq!(record.to_line(), line);
        assert_eq!(record.verb, Verb::Put);
        assert_eq!(record.chat, ChatHistory::OkOk);
        assert_eq!(record.blob_size, 0);
        assert_eq!(record.wall, Wall { sec: 0, nsec: 481_276 });
    }

    #[test]
    fn built_records_frisk() {
        let record = BrrRecord::new(
            Utc::now(),
            Transport::new("fs", "/var/lib/bstore").unwrap(),
            Verb::Get,
            Udig::empty(Algorithm::Sk),
            ChatHistory::Ok,
            42,
            Wall { sec: 1, nsec: 999_999_999 },
        );
        let line = record.to_line();
        assert_eq!(BrrRecord::frisk(&line).unwrap().to_line(), line);
    }

    #[test]
    fn start_time_has_nine_fraction_digits() {
        let t = format_start_time(Utc::now());
        assert_eq!(t.len(), 35);
        assert!(t.ends_with("+00:00"));
        frisk_start_time(&t).unwrap();
    }

    #[test]
    fn max_length_record_round_trips() {
        let line = format!(
            "2024-07-02T18:22:45.987654321+00:00\ttcp4~{}\ttake\tsha20:{}\tok,ok,no\t{}\t{}.{:09}\n",
            "f".repeat(MAX_FLOW_LEN),
            "e".repeat(128),
            i64::MAX,
            4_294_967_295u64,
            999_999_999u32,
        );
        assert!(line.len() <= MAX_BRR_LEN);
        let record = BrrRecord::frisk(&line).unwrap();
        assert_eq!(record.to_line(), line);
    }

    #[test]
    fn length_envelope_enforced() {
        assert_eq!(
            BrrRecord::frisk("short\n"),
            Err(BrrError::BadLength(6))
        );
        let oversize = format!("{}\n", "x".repeat(MAX_BRR_LEN + 10));
        assert!(matches!(
            BrrRecord::frisk(&oversize),
            Err(BrrError::BadLength(_))
        ));
    }

    #[test]
    fn field_grammar_violations() {
        let good = sample_line();

        let bad = good.replace("put", "cat");
        assert!(matches!(BrrRecord::frisk(&bad), Err(BrrError::BadVerb(_))));

        let bad = good.replace("ok,ok", "ok,ok,ok,ok");
        assert!(matches!(
            BrrRecord::frisk(&bad),
            Err(BrrError::BadChatHistory(_))
        ));

        let bad = good.replace("tcp4~", "tcp4-");
        assert!(matches!(
            BrrRecord::frisk(&bad),
            Err(BrrError::BadTransport(_))
        ));

        let bad = good.replace("\t0\t", "\t007\t");
        assert!(matches!(
            BrrRecord::frisk(&bad),
            Err(BrrError::BadBlobSize(_))
        ));

        let bad = good.replace("0.000481276", "0.481276");
        assert!(matches!(
            BrrRecord::frisk(&bad),
            Err(BrrError::BadWallDuration(_))
        ));

        let bad = good.replacen("2024-", "2024:", 1);
        assert!(matches!(
            BrrRecord::frisk(&bad),
            Err(BrrError::BadStartTime(_))
        ));
    }

    #[test]
    fn chat_log_histories() {
        let mut log = ChatLog::new();
        assert_eq!(log.history(), ChatHistory::No);
        log.push_ok();
        assert_eq!(log.history(), ChatHistory::Ok);
        log.push_ok();
        assert_eq!(log.history(), ChatHistory::OkOk);
        log.push_no();
        assert_eq!(log.history(), ChatHistory::OkOkNo);

        let mut log = ChatLog::new();
        log.push_ok();
        log.push_no();
        assert_eq!(log.history(), ChatHistory::OkNo);
    }

    #[test]
    fn mask_selects_verbs() {
        let mask = BrrMask(0x01 | 0x20);
        assert!(mask.is_set(Verb::Get));
        assert!(mask.is_set(Verb::Wrap));
        assert!(!mask.is_set(Verb::Put));
        assert!(BrrMask::ALL.is_set(Verb::Roll));
    }
}
