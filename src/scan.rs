use std::thread;
use std::time::Duration;

use lazy_static::lazy_static;
use log::{info, warn};
use regex::Regex;

use crate::errors::ScanError;
use crate::nmcli::ControlTool;

/// Fields requested from the control tool, in order. Only the trailing
/// structure is fixed; the SSID may span several delimiter-separated
/// segments when it contains the delimiter itself.
pub const LIST_FIELDS: &str = "SSID,BSSID,FREQ,SIGNAL,SECURITY,IN-USE";

pub const DELIMITER: char = ':';
const ESCAPE: char = '\\';
const BSSID_SEGMENTS: usize = 6;

/// Settle time before the single automatic retry when a scan comes back empty.
const RESCAN_SETTLE: Duration = Duration::from_secs(2);

lazy_static! {
    static ref BSSID_RE: Regex = Regex::new(r"^([0-9A-Fa-f]{2}:){5}[0-9A-Fa-f]{2}$").unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Band {
    Band24,
    Band5,
    Band6,
    Unknown,
}

impl Band {
    pub fn from_frequency(frequency_mhz: Option<u32>) -> Self {
        match frequency_mhz {
            Some(f) if (2400..=2500).contains(&f) => Band::Band24,
            Some(f) if (4900..=5895).contains(&f) => Band::Band5,
            Some(f) if (5925..=7125).contains(&f) => Band::Band6,
            _ => Band::Unknown,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Band::Band24 => "2.4",
            Band::Band5 => "5",
            Band::Band6 => "6",
            Band::Unknown => "unknown",
        }
    }
}

/// One visible network. Rebuilt from scratch on every scan; nothing here
/// survives a rescan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkRecord {
    pub ssid: String,
    pub bssid: Option<String>,
    pub frequency_mhz: Option<u32>,
    pub band: Band,
    pub signal: u8,
    pub security: String,
    pub in_use: bool,
}

/// Scan the given interface and return records sorted for display. An empty
/// first result triggers one rescan-and-retry to absorb cold-radio latency.
pub fn scan(tool: &dyn ControlTool, interface: &str) -> Result<Vec<NetworkRecord>, ScanError> {
    let records = list_once(tool, interface)?;
    if !records.is_empty() {
        return Ok(records);
    }

    info!("scan on {} returned nothing, requesting a rescan", interface);
    if let Err(err) = tool.run(&["device", "wifi", "rescan", "ifname", interface]) {
        warn!("rescan request failed: {}", err);
    }
    thread::sleep(RESCAN_SETTLE);
    list_once(tool, interface)
}

fn list_once(tool: &dyn ControlTool, interface: &str) -> Result<Vec<NetworkRecord>, ScanError> {
    let raw = tool
        .run(&[
            "-t", "-f", LIST_FIELDS, "device", "wifi", "list", "ifname", interface,
        ])
        .map_err(|source| ScanError {
            interface: interface.to_string(),
            source,
        })?;
    Ok(parse_output(&raw))
}

/// Parse the tool's terse output into sorted records. Lines that do not
/// carry the expected trailing structure, and records whose SSID is empty
/// after unescaping, are dropped.
pub fn parse_output(raw: &str) -> Vec<NetworkRecord> {
    let mut records: Vec<NetworkRecord> = raw
        .lines()
        .filter_map(parse_line)
        .filter(|record| !record.ssid.is_empty())
        .collect();
    sort_records(&mut records);
    records
}

/// Signal descending, then SSID ascending, then BSSID ascending, so menu
/// numbering is reproducible across identical scans.
pub fn sort_records(records: &mut [NetworkRecord]) {
    records.sort_by(|a, b| {
        b.signal
            .cmp(&a.signal)
            .then_with(|| a.ssid.cmp(&b.ssid))
            .then_with(|| a.bssid.cmp(&b.bssid))
    });
}

pub fn parse_line(line: &str) -> Option<NetworkRecord> {
    if line.is_empty() {
        return None;
    }
    let segments: Vec<&str> = line.split(DELIMITER).collect();
    // Our own invocation always asks for the in-use column, but the trailing
    // marker stays optional so output without it still parses. The strict
    // passes use the numeric slots to disambiguate the anchoring; when no
    // strict reading fits, a lenient retry accepts the record anyway with
    // the numeric defaults, so a digit-free signal or frequency does not
    // cost the whole line.
    parse_anchored(&segments, true, true)
        .or_else(|| parse_anchored(&segments, false, true))
        .or_else(|| parse_anchored(&segments, true, false))
        .or_else(|| parse_anchored(&segments, false, false))
}

/// Right-anchored parse: the field count is not fixed because the SSID may
/// contain escaped delimiters, so the fixed trailing fields are consumed
/// from the right and whatever remains on the left is the SSID.
fn parse_anchored(segments: &[&str], with_marker: bool, strict: bool) -> Option<NetworkRecord> {
    let mut end = segments.len();

    let mut in_use = false;
    if with_marker {
        if end == 0 {
            return None;
        }
        in_use = match segments[end - 1].trim() {
            "*" => true,
            "" => false,
            _ => return None,
        };
        end -= 1;
    }

    // security + signal + freq + at least one BSSID segment + an SSID.
    if end < 5 {
        return None;
    }

    let security = segments[end - 1];
    let signal_raw = segments[end - 2];
    let freq_raw = segments[end - 3];
    if ends_with_escape(security) || ends_with_escape(signal_raw) || ends_with_escape(freq_raw) {
        return None;
    }
    if strict {
        if !signal_raw.trim().is_empty() && digits(signal_raw).is_none() {
            return None;
        }
        if !freq_raw.trim().is_empty() && digits(freq_raw).is_none() {
            return None;
        }
    }
    end -= 3;

    let (bssid, end) = take_bssid(segments, end)?;
    if end == 0 {
        return None;
    }

    let ssid = unescape(&segments[..end].join(&DELIMITER.to_string()));
    let frequency_mhz = digits(freq_raw);

    Some(NetworkRecord {
        band: Band::from_frequency(frequency_mhz),
        signal: digits(signal_raw).map(|s| s.min(100) as u8).unwrap_or(0),
        security: security.trim().to_string(),
        ssid,
        bssid,
        frequency_mhz,
        in_use,
    })
}

/// Consume the BSSID from the right end: either six hardware-address
/// segments (the separator inside them arrives escaped) or a single empty
/// segment when the tool has no address to report.
fn take_bssid(segments: &[&str], end: usize) -> Option<(Option<String>, usize)> {
    if end >= BSSID_SEGMENTS {
        let candidate = &segments[end - BSSID_SEGMENTS..end];
        if let Some(mac) = normalize_bssid(candidate) {
            return Some((Some(mac), end - BSSID_SEGMENTS));
        }
    }
    let lone = segments[end - 1];
    if lone.trim().is_empty() && !ends_with_escape(lone) {
        Some((None, end - 1))
    } else {
        None
    }
}

/// Normalize candidate segments to hex digits and separators only; anything
/// that does not reduce to a well-formed hardware address is rejected.
fn normalize_bssid(candidate: &[&str]) -> Option<String> {
    let (head, tail) = candidate.split_at(BSSID_SEGMENTS - 1);
    if !head.iter().all(|segment| ends_with_escape(segment)) || ends_with_escape(tail[0]) {
        return None;
    }
    let joined = unescape(&candidate.join(&DELIMITER.to_string()));
    let cleaned: String = joined
        .chars()
        .filter(|c| c.is_ascii_hexdigit() || *c == DELIMITER)
        .collect();
    if BSSID_RE.is_match(&cleaned) {
        Some(cleaned.to_ascii_uppercase())
    } else {
        None
    }
}

/// True when the segment ends in an odd number of escape characters, i.e.
/// the delimiter that followed it in the raw line was escaped.
fn ends_with_escape(segment: &str) -> bool {
    segment.chars().rev().take_while(|c| *c == ESCAPE).count() % 2 == 1
}

/// Strip non-digit characters (unit suffixes like "MHz") before reading.
fn digits(raw: &str) -> Option<u32> {
    let filtered: String = raw.chars().filter(char::is_ascii_digit).collect();
    if filtered.is_empty() {
        None
    } else {
        filtered.parse().ok()
    }
}

pub fn unescape(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars();
    while let Some(c) = chars.next() {
        if c == ESCAPE {
            match chars.next() {
                Some(next) => out.push(next),
                None => out.push(ESCAPE),
            }
        } else {
            out.push(c);
        }
    }
    out
}
