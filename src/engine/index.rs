//! Directory Listing Index
//!
//! Turns an autoindex-style listing page into candidate artifacts and picks
//! the newest one.
//!
//! Parsing is deliberately forgiving: a row with a malformed size or date is
//! dropped on its own, and a page with nothing recognisable simply yields no
//! rows. "No candidates" is a normal, retryable outcome for callers.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use regex::Regex;
use std::sync::OnceLock;
use url::Url;

use crate::engine::config::ListingConfig;
use crate::engine::error::ParseError;

/// Raw date and time columns as they appear in the listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTimestamp {
    pub date: String,
    pub time: String,
}

/// One artifact row from the listing, not yet resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingRow {
    pub relative_href: String,
    pub size_bytes: u64,
    pub published_raw: RawTimestamp,
}

/// A resolved artifact candidate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub version_label: String,
    /// Fetch URL, keeps the listing's percent-encoding
    pub artifact_url: String,
    /// Display name, percent-decoded
    pub file_name: String,
    pub published_at: DateTime<Utc>,
    pub size_bytes: u64,
}

fn anchor_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)<a\s[^>]*?href\s*=\s*["']([^"']+)["'][^>]*>.*?</a>"#)
            .expect("anchor pattern")
    })
}

fn tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<[^>]*>").expect("tag pattern"))
}

fn columns_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*(\S+)\s+(\S+)\s+(\S+)").expect("columns pattern")
    })
}

fn date_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(\d{1,2}-[A-Za-z]{3}-\d{4}|\d{4}-\d{2}-\d{2})$").expect("date pattern")
    })
}

fn time_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d{2}:\d{2}(:\d{2})?$").expect("time pattern"))
}

/// Parse a listing document into artifact rows, in document order.
pub fn parse_listing(document: &str, listing: &ListingConfig) -> Vec<ListingRow> {
    let suffix = listing.artifact_suffix.to_ascii_lowercase();
    let mut rows = Vec::new();

    for line in document.lines() {
        for caps in anchor_re().captures_iter(line) {
            let (Some(whole), Some(href)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            let href = href.as_str();
            if !href.to_ascii_lowercase().ends_with(&suffix) {
                continue;
            }

            let tail = &line[whole.end()..];
            match parse_columns(tail) {
                Ok((published_raw, size_bytes)) => rows.push(ListingRow {
                    relative_href: href.to_string(),
                    size_bytes,
                    published_raw,
                }),
                Err(e) => tracing::debug!(href, error = %e, "Dropping listing row"),
            }
        }
    }

    rows
}

/// The text after an anchor holds "date time size", possibly wrapped in table cells.
fn parse_columns(tail: &str) -> Result<(RawTimestamp, u64), ParseError> {
    let text = tag_re().replace_all(tail, " ");
    let caps = columns_re()
        .captures(&text)
        .ok_or_else(|| ParseError::Date(text.trim().to_string()))?;

    let date = &caps[1];
    let time = &caps[2];
    let size = &caps[3];

    if !date_re().is_match(date) {
        return Err(ParseError::Date(date.to_string()));
    }
    if !time_re().is_match(time) {
        return Err(ParseError::Date(time.to_string()));
    }
    let size_bytes = size
        .parse::<u64>()
        .map_err(|_| ParseError::Size(size.to_string()))?;

    Ok((
        RawTimestamp {
            date: date.to_string(),
            time: time.to_string(),
        },
        size_bytes,
    ))
}

/// Interpret listing date/time columns as UTC.
pub fn to_utc(raw: &RawTimestamp) -> Result<DateTime<Utc>, ParseError> {
    let date = NaiveDate::parse_from_str(&raw.date, "%d-%b-%Y")
        .or_else(|_| NaiveDate::parse_from_str(&raw.date, "%Y-%m-%d"))
        .map_err(|_| ParseError::Date(raw.date.clone()))?;
    let time = NaiveTime::parse_from_str(&raw.time, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(&raw.time, "%H:%M:%S"))
        .map_err(|_| ParseError::Date(raw.time.clone()))?;
    Ok(Utc.from_utc_datetime(&NaiveDateTime::new(date, time)))
}

/// Human version label: strip path, extension and the publisher prefix.
pub fn version_label(file_name: &str, listing: &ListingConfig) -> String {
    let base = file_name.rsplit('/').next().unwrap_or(file_name);

    let suffix = &listing.artifact_suffix;
    let stem = if !suffix.is_empty()
        && base.len() > suffix.len()
        && base.to_ascii_lowercase().ends_with(&suffix.to_ascii_lowercase())
    {
        &base[..base.len() - suffix.len()]
    } else {
        base
    };

    let prefix = &listing.publisher_prefix;
    if !prefix.is_empty()
        && stem.len() > prefix.len()
        && stem.is_char_boundary(prefix.len())
        && stem[..prefix.len()].eq_ignore_ascii_case(prefix)
    {
        stem[prefix.len()..].to_string()
    } else {
        stem.to_string()
    }
}

/// Resolve a row against the listing URL.
pub fn resolve(row: &ListingRow, source: &Url, listing: &ListingConfig) -> Result<Candidate, ParseError> {
    let artifact_url = source
        .join(&row.relative_href)
        .map_err(|_| ParseError::Href(row.relative_href.clone()))?;

    let encoded_name = artifact_url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|s| !s.is_empty())
        .unwrap_or(row.relative_href.as_str());
    let file_name = urlencoding::decode(encoded_name)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| encoded_name.to_string());

    Ok(Candidate {
        version_label: version_label(&file_name, listing),
        published_at: to_utc(&row.published_raw)?,
        size_bytes: row.size_bytes,
        file_name,
        artifact_url: artifact_url.to_string(),
    })
}

/// Resolve every row and keep the newest.
///
/// Ties on `published_at` go to the row encountered last; callers must not
/// rely on that order.
pub fn select_latest(rows: &[ListingRow], source: &Url, listing: &ListingConfig) -> Option<Candidate> {
    rows.iter()
        .filter_map(|row| match resolve(row, source, listing) {
            Ok(candidate) => Some(candidate),
            Err(e) => {
                tracing::debug!(href = %row.relative_href, error = %e, "Dropping candidate");
                None
            }
        })
        .fold(None, |best: Option<Candidate>, candidate| match best {
            Some(current) if current.published_at > candidate.published_at => Some(current),
            _ => Some(candidate),
        })
}
