//! Locate embedded XML documents inside arbitrary JSON envelopes.
//!
//! Upstream responses wrap each document in some JSON field, usually as a
//! base64 string of gzip-compressed XML (`ArquivoXml`), but the exact shape
//! varies. [`embedded_documents`] walks every string leaf of the value and
//! yields whatever decodes to markup. [`document_in_period`] then decides
//! whether a document belongs to the reporting period by scanning its date
//! elements.

use std::io::Read;

use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig};
use base64::engine::DecodePaddingMode;
use base64::Engine;
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use flate2::read::GzDecoder;
use quick_xml::events::Event;
use quick_xml::Reader;
use serde_json::Value;

use crate::period::Period;

/// Element-name fragments that mark a date field (`dhEmi`, `DataEmissao`, `dCompet`, ...).
const DATE_NAME_TOKENS: [&str; 3] = ["data", "date", "compet"];

const LENIENT_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Lazy depth-first iterator over the documents embedded in a JSON value.
///
/// Holds only borrowed state; calling [`embedded_documents`] again restarts
/// the walk from scratch.
pub struct EmbeddedDocuments<'a> {
    stack: Vec<&'a Value>,
}

/// Iterate over every string leaf of `value` that decodes to a document.
pub fn embedded_documents(value: &Value) -> EmbeddedDocuments<'_> {
    EmbeddedDocuments { stack: vec![value] }
}

impl Iterator for EmbeddedDocuments<'_> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        while let Some(value) = self.stack.pop() {
            match value {
                // Reverse push keeps document order equal to source order.
                Value::Object(map) => self.stack.extend(map.values().rev()),
                Value::Array(items) => self.stack.extend(items.iter().rev()),
                Value::String(s) => {
                    if let Some(doc) = decode_document(s) {
                        return Some(doc);
                    }
                }
                Value::Null | Value::Bool(_) | Value::Number(_) => {}
            }
        }
        None
    }
}

/// Interpret one string field as a document.
///
/// Markup is accepted as-is. Anything else is base64-decoded, gunzipped when
/// it is gzip, and decoded as UTF-8; the result is kept only if it is markup.
pub fn decode_document(raw: &str) -> Option<String> {
    if raw.is_empty() {
        return None;
    }
    if raw.trim_start().starts_with('<') {
        return Some(raw.to_string());
    }

    let compact: String = raw.split_whitespace().collect();
    let bytes = LENIENT_BASE64.decode(compact.as_bytes()).ok()?;

    let mut inflated = Vec::new();
    let text = match GzDecoder::new(bytes.as_slice()).read_to_end(&mut inflated) {
        Ok(_) => String::from_utf8_lossy(&inflated).into_owned(),
        Err(_) => String::from_utf8_lossy(&bytes).into_owned(),
    };

    if text.trim_start().starts_with('<') {
        Some(text)
    } else {
        None
    }
}

/// Whether any date-like element of `xml` falls inside `period`.
///
/// Unparseable or missing dates and malformed XML all count as "not in
/// period"; this never fails.
pub fn document_in_period(xml: &str, period: &Period) -> bool {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    // One flag per open element: does its local name look like a date field?
    let mut open: Vec<bool> = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).to_lowercase();
                open.push(is_date_name(&name));
            }
            Ok(Event::End(_)) => {
                open.pop();
            }
            Ok(Event::Text(e)) => {
                if open.last().copied().unwrap_or(false) {
                    let text = e.unescape().unwrap_or_default();
                    if parse_document_date(&text).is_some_and(|dt| period.contains(dt)) {
                        return true;
                    }
                }
            }
            Ok(Event::CData(e)) => {
                if open.last().copied().unwrap_or(false) {
                    let text = String::from_utf8_lossy(&e).into_owned();
                    if parse_document_date(&text).is_some_and(|dt| period.contains(dt)) {
                        return true;
                    }
                }
            }
            Ok(Event::Eof) | Err(_) => return false,
            _ => {}
        }
        buf.clear();
    }
}

fn is_date_name(lowercase_name: &str) -> bool {
    DATE_NAME_TOKENS
        .iter()
        .any(|token| lowercase_name.contains(token))
}

/// Parse the date formats found in NFS-e documents.
///
/// A leading `YYYY-MM-DD` wins and is read as midnight, so the period check is
/// by calendar day. Timestamps with `T`, optional fractional seconds and an
/// optional offset are accepted as a fallback; offsets are dropped and the
/// wall-clock time kept.
pub fn parse_document_date(text: &str) -> Option<NaiveDateTime> {
    let t = text.trim();
    if t.is_empty() {
        return None;
    }

    if let Some(prefix) = t.get(..10) {
        let bytes = prefix.as_bytes();
        if bytes[4] == b'-' && bytes[7] == b'-' {
            if let Ok(date) = NaiveDate::parse_from_str(prefix, "%Y-%m-%d") {
                return date.and_hms_opt(0, 0, 0);
            }
        }
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(t) {
        return Some(dt.naive_local());
    }
    if let Ok(dt) = DateTime::parse_from_str(t, "%Y-%m-%dT%H:%M:%S%.f%z") {
        return Some(dt.naive_local());
    }
    NaiveDateTime::parse_from_str(t, "%Y-%m-%dT%H:%M:%S%.f").ok()
}
