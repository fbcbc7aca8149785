use std::collections::BTreeMap;
use std::path::Path;

use tracing::debug;

use crate::domain::{BIB_FIELDS, BibEntry, BibEntryRaw, Record, records_sorted};
use crate::error::RegistryError;
use crate::fs_util::write_bytes_atomic;
use crate::normalize::normalize_whitespace;

/// Parses every entry in `text`, keyed by citekey. A later entry with the same
/// key replaces an earlier one.
pub fn parse_bib(text: &str) -> BTreeMap<String, BibEntryRaw> {
    let mut entries = BTreeMap::new();
    for entry in scan_entries(text) {
        entries.insert(entry.key.clone(), entry);
    }
    entries
}

/// First entry of a pasted snippet, mapped onto a [`BibEntry`].
pub fn parse_bib_paste(text: &str) -> Result<(String, BibEntry), RegistryError> {
    let raw = scan_entries(text)
        .into_iter()
        .next()
        .ok_or(RegistryError::NoBibEntry)?;
    Ok((raw.key.clone(), BibEntry::from_raw(&raw)))
}

/// Entries in text order. Blocks without a key or with a malformed header are
/// skipped rather than aborting the scan.
pub fn scan_entries(text: &str) -> Vec<BibEntryRaw> {
    let bytes = text.as_bytes();
    let mut entries = Vec::new();
    let mut cursor = 0;

    while let Some(at) = find_byte(bytes, b'@', cursor) {
        let Some(open) = find_byte(bytes, b'{', at) else {
            break;
        };
        let entry_type = text[at + 1..open].trim().to_lowercase();
        if entry_type.is_empty() || !entry_type.chars().all(|ch| ch.is_ascii_alphanumeric()) {
            cursor = at + 1;
            continue;
        }

        let close = matching_brace(bytes, open + 1);
        let body = &text[open + 1..close];
        cursor = close + 1;

        let Some((key, fields_blob)) = body.split_once(',') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }

        let mut entry = BibEntryRaw {
            entry_type,
            key: key.to_string(),
            fields: Vec::new(),
        };
        for (name, value) in parse_fields(fields_blob) {
            entry.set_field(name, value);
        }
        entries.push(entry);
    }

    entries
}

/// Index of the brace closing the block whose body starts at `start`, or the
/// end of input when the block is unterminated.
fn matching_brace(bytes: &[u8], start: usize) -> usize {
    let mut depth = 1usize;
    let mut idx = start;
    while idx < bytes.len() {
        match bytes[idx] {
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return idx;
                }
            }
            _ => {}
        }
        idx += 1;
    }
    bytes.len()
}

fn parse_fields(blob: &str) -> Vec<(String, String)> {
    let bytes = blob.as_bytes();
    let n = bytes.len();
    let mut fields = Vec::new();
    let mut p = 0;

    while p < n {
        while p < n && matches!(bytes[p], b' ' | b'\n' | b'\r' | b'\t' | b',') {
            p += 1;
        }
        if p >= n {
            break;
        }
        let Some(eq) = find_byte(bytes, b'=', p) else {
            break;
        };
        let name = blob[p..eq].trim().to_lowercase();
        p = eq + 1;
        while p < n && matches!(bytes[p], b' ' | b'\n' | b'\r' | b'\t') {
            p += 1;
        }
        if p >= n {
            break;
        }

        let value = match bytes[p] {
            b'{' => {
                let start = p + 1;
                let end = matching_brace(bytes, start);
                p = (end + 1).min(n);
                &blob[start..end]
            }
            b'"' => {
                p += 1;
                let start = p;
                while p < n && bytes[p] != b'"' {
                    if bytes[p] == b'\\' {
                        p += 1;
                    }
                    p += 1;
                }
                let end = p.min(n);
                p = (end + 1).min(n);
                &blob[start..end]
            }
            _ => {
                let start = p;
                while p < n && !matches!(bytes[p], b',' | b'\n' | b'\r') {
                    p += 1;
                }
                &blob[start..p]
            }
        };

        if !name.is_empty() {
            fields.push((name, value.trim().to_string()));
        }

        match find_byte(bytes, b',', p) {
            Some(comma) => p = comma + 1,
            None => break,
        }
    }

    fields
}

fn find_byte(bytes: &[u8], needle: u8, from: usize) -> Option<usize> {
    bytes
        .get(from..)?
        .iter()
        .position(|b| *b == needle)
        .map(|pos| from + pos)
}

fn format_value(value: &str) -> String {
    let flattened = value.replace("\r\n", " ").replace(['\n', '\r'], " ");
    format!("{{{}}}", flattened.trim())
}

/// Renders one entry. Blank fields are never emitted; recognized fields come
/// first in canonical order, then `extra_fields` by name.
pub fn render_bib(key: &str, record: &Record) -> String {
    let bib = &record.bib;
    let entry_type = match bib.entry_type.trim().to_lowercase() {
        t if t.is_empty() => "misc".to_string(),
        t => t,
    };

    let mut fields: Vec<(&str, String)> = Vec::new();
    for name in BIB_FIELDS {
        let value = bib.field(name).unwrap_or_default();
        if !normalize_whitespace(value).is_empty() {
            fields.push((name, value.to_string()));
        }
    }
    for (name, value) in &bib.extra_fields {
        let value = normalize_whitespace(value);
        if !value.is_empty() {
            fields.push((name.as_str(), value));
        }
    }

    let mut lines = vec![format!("@{entry_type}{{{key},")];
    let last = fields.len().saturating_sub(1);
    for (idx, (name, value)) in fields.iter().enumerate() {
        let tail = if idx == last { "" } else { "," };
        lines.push(format!("  {name} = {}{tail}", format_value(value)));
    }
    lines.push("}".to_string());
    lines.join("\n")
}

/// Full bibliography for a record set, in registry sort order.
pub fn render_bib_document(records: &[Record]) -> String {
    let entries = records_sorted(records)
        .into_iter()
        .filter_map(|rec| {
            let key = rec.bib_key();
            (!key.is_empty()).then(|| render_bib(&key, rec))
        })
        .collect::<Vec<_>>();
    format!("{}\n", entries.join("\n\n").trim())
}

pub fn write_bib(path: &Path, records: &[Record]) -> Result<(), RegistryError> {
    let document = render_bib_document(records);
    debug!(path = %path.display(), bytes = document.len(), "writing bibliography");
    write_bytes_atomic(path, document.as_bytes())
}
