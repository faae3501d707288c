//! The append-only, daily-rotating journal. Availability
//! is deliberately traded for durability: any write error is fatal to the
//! process (the explicit carve-out from ordinary error recovery).

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::Utc;
use payproc_tokio::NotifyOnce;
use tracing::error;

/// One of the five record types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    System,
    ExchangeRate,
    Charge,
    Refund,
    Manual,
}

impl RecordType {
    fn code(self) -> char {
        match self {
            RecordType::System | RecordType::ExchangeRate => '$',
            RecordType::Charge => 'C',
            RecordType::Refund => 'R',
            RecordType::Manual => 'M',
        }
    }
}

/// The 15 data fields of a journal record, in wire order, plus the leading
/// type code emitted separately by [`format_record`].
#[derive(Debug, Clone, Default)]
pub struct JournalFields {
    pub date: String,
    pub live: String,
    pub currency: String,
    pub amount: String,
    pub desc: String,
    pub mail: String,
    pub meta: String,
    pub last4: String,
    pub service: String,
    pub account: String,
    pub chargeid: String,
    pub txid: String,
    pub rtxid: String,
    pub euro: String,
    pub recur: String,
}

fn percent_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            ':' | '&' | '\n' | '\r' | '%' => out.push_str(&format!("%{:02X}", c as u32)),
            _ => out.push(c),
        }
    }
    out
}

fn percent_unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '%' {
            let hex: String = chars.by_ref().take(2).collect();
            if let Ok(byte) = u8::from_str_radix(&hex, 16) {
                out.push(byte as char);
                continue;
            }
            out.push('%');
            out.push_str(&hex);
        } else {
            out.push(c);
        }
    }
    out
}

/// Formats one journal line: `type` + colon-delimited fields, percent-escaped.
/// Returns the line without its trailing LF.
pub fn format_record(record_type: RecordType, fields: &JournalFields) -> String {
    let parts = [
        fields.date.as_str(),
        fields.live.as_str(),
        fields.currency.as_str(),
        fields.amount.as_str(),
        fields.desc.as_str(),
        fields.mail.as_str(),
        fields.meta.as_str(),
        fields.last4.as_str(),
        fields.service.as_str(),
        fields.account.as_str(),
        fields.chargeid.as_str(),
        fields.txid.as_str(),
        fields.rtxid.as_str(),
        fields.euro.as_str(),
        fields.recur.as_str(),
    ];
    let escaped: Vec<String> = parts.iter().map(|p| percent_escape(p)).collect();
    format!("{}:{}", record_type.code(), escaped.join(":"))
}

/// Parses a journal line back into its 16 colon-delimited fields. The
/// `type` field is returned separately from the other 15.
pub fn parse_record(line: &str) -> Option<(char, Vec<String>)> {
    let (type_str, rest) = line.split_once(':')?;
    let record_type = type_str.chars().next()?;
    let fields: Vec<String> = rest.split(':').map(percent_unescape).collect();
    if fields.len() != 15 {
        return None;
    }
    Some((record_type, fields))
}

fn today_date_field() -> String {
    Utc::now().format("%Y%m%dT%H%M%S").to_string()
}

struct OpenFile {
    file: File,
    suffix: String,
}

/// A handle to the rotating journal file. Writes are synchronous and
/// blocking -- journal I/O is rare relative to gateway round-trips, and
/// this is the one place the daemon deliberately blocks the executor
/// thread.
pub struct Journal {
    basename: PathBuf,
    current: Mutex<Option<OpenFile>>,
}

impl Journal {
    pub fn new(basename: impl Into<PathBuf>) -> Self {
        Self { basename: basename.into(), current: Mutex::new(None) }
    }

    /// Appends `record_type`/`fields` to today's file, rotating if the date
    /// suffix (taken from `fields.date`, not wall-clock -- concurrent
    /// connections can build records slightly out of timestamp order) has
    /// changed. On any I/O failure this calls [`fatal`] and never returns.
    pub fn append(&self, shutdown: &NotifyOnce, record_type: RecordType, fields: &JournalFields) {
        let line = format_record(record_type, fields);
        let suffix = date_suffix(&fields.date);

        let mut guard = self.current.lock().expect("journal lock poisoned");
        let needs_rotate = match &guard.as_ref() {
            Some(open) => open.suffix != suffix,
            None => true,
        };
        if needs_rotate {
            if let Some(mut open) = guard.take() {
                if let Err(e) = open.file.flush() {
                    drop(guard);
                    fatal(shutdown, &format!("flushing journal before rotation: {e}"));
                }
            }
            let path = PathBuf::from(format!("{}-{}.log", self.basename.display(), suffix));
            match OpenOptions::new().create(true).append(true).open(&path) {
                Ok(file) => *guard = Some(OpenFile { file, suffix: suffix.clone() }),
                Err(e) => {
                    drop(guard);
                    fatal(shutdown, &format!("opening journal file {path:?}: {e}"));
                }
            }
        }

        let open = guard.as_mut().expect("journal file opened above");
        // trailing NUL lets ancillary tooling treat each record as a C-style string
        let with_terminator = format!("{line}\n\0");
        if let Err(e) = open.file.write_all(with_terminator.as_bytes()) {
            drop(guard);
            fatal(shutdown, &format!("writing journal record: {e}"));
        }
        if let Err(e) = open.file.flush() {
            drop(guard);
            fatal(shutdown, &format!("flushing journal record: {e}"));
        }
    }
}

fn date_suffix(date_field: &str) -> String {
    // `date_field` is `YYYYMMDDThhmmss`; the suffix is its first 8 bytes.
    if date_field.len() >= 8 {
        date_field[..8].to_owned()
    } else {
        Utc::now().format("%Y%m%d").to_string()
    }
}

/// Builds the date field for a fresh record, matching `^\d{8}T\d{6}$`.
pub fn new_timestamp() -> String {
    today_date_field()
}

/// Logs at `error!`, asks in-flight connections to wind down via `shutdown`,
/// then exits with status 4 -- the propagation-policy exit code.
/// Journal integrity outranks availability.
pub fn fatal(shutdown: &NotifyOnce, message: &str) -> ! {
    error!("fatal journal error: {message}");
    shutdown.send();
    std::process::exit(4);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_round_trips() {
        let fields = JournalFields {
            date: "20260726T120000".to_owned(),
            live: "f".to_owned(),
            currency: "EUR".to_owned(),
            amount: "10.00".to_owned(),
            desc: "a:b&c\nd".to_owned(),
            mail: "a@b.com".to_owned(),
            meta: "k=v".to_owned(),
            last4: "4242".to_owned(),
            service: "stripe".to_owned(),
            account: "A12345".to_owned(),
            chargeid: "ch_1".to_owned(),
            txid: "txn_1".to_owned(),
            rtxid: "".to_owned(),
            euro: "10.00".to_owned(),
            recur: "".to_owned(),
        };
        let line = format_record(RecordType::Charge, &fields);
        let (ty, parsed) = parse_record(&line).unwrap();
        assert_eq!(ty, 'C');
        assert_eq!(parsed.len(), 15);
        assert_eq!(parsed[3], "10.00");
        assert_eq!(parsed[4], "a:b&c\nd");
    }

    #[test]
    fn date_field_matches_pattern() {
        let date = new_timestamp();
        assert_eq!(date.len(), 15);
        assert!(date.as_bytes()[8] == b'T');
        assert!(date[..8].bytes().all(|b| b.is_ascii_digit()));
        assert!(date[9..].bytes().all(|b| b.is_ascii_digit()));
    }
}
