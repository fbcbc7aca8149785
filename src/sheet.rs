use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::io::{BufRead, Read, Seek, Write};
use std::path::Path;

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use tracing::debug;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::domain::{SHEET_COLUMNS, WorksheetRow, sheet_headers};
use crate::error::RegistryError;
use crate::fs_util::{open_package, persist, read_zip_entry, require_zip_entry, sibling_tempfile};

pub const WORKBOOK_PART: &str = "xl/workbook.xml";
pub const WORKBOOK_RELS_PART: &str = "xl/_rels/workbook.xml.rels";
pub const SHARED_STRINGS_PART: &str = "xl/sharedStrings.xml";

const FILTER_DATABASE: &str = "_xlnm._FilterDatabase";
const LAST_COLUMN: &str = "R";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetLocation {
    pub name: String,
    pub part: String,
}

/// Resolves a sheet name to its worksheet part via the workbook relationships.
pub fn locate_sheet<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
    sheet_name: &str,
) -> Result<SheetLocation, RegistryError> {
    let workbook = require_zip_entry(archive, WORKBOOK_PART)?;
    let rel_id = find_sheet_rel_id(&workbook, sheet_name)?
        .ok_or_else(|| RegistryError::SheetNotFound(sheet_name.to_string()))?;
    let rels = require_zip_entry(archive, WORKBOOK_RELS_PART)?;
    let targets = parse_relationships(&rels)?;
    let target = targets
        .get(&rel_id)
        .ok_or_else(|| RegistryError::SheetNotFound(sheet_name.to_string()))?;
    Ok(SheetLocation {
        name: sheet_name.to_string(),
        part: resolve_part(target),
    })
}

fn find_sheet_rel_id(workbook: &[u8], sheet_name: &str) -> Result<Option<String>, RegistryError> {
    let mut reader = Reader::from_reader(workbook);
    reader.trim_text(false);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) if e.local_name().as_ref() == b"sheet" => {
                let name = attr_value(&e, &reader, b"name", WORKBOOK_PART)?;
                if name.as_deref() == Some(sheet_name) {
                    return attr_value(&e, &reader, b"id", WORKBOOK_PART);
                }
            }
            Ok(Event::Eof) => return Ok(None),
            Err(err) => return Err(RegistryError::xml(WORKBOOK_PART, err)),
            _ => {}
        }
        buf.clear();
    }
}

fn parse_relationships(xml: &[u8]) -> Result<HashMap<String, String>, RegistryError> {
    let mut reader = Reader::from_reader(xml);
    reader.trim_text(false);
    let mut buf = Vec::new();
    let mut out = HashMap::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e))
                if e.local_name().as_ref() == b"Relationship" =>
            {
                let id = attr_value(&e, &reader, b"Id", WORKBOOK_RELS_PART)?;
                let target = attr_value(&e, &reader, b"Target", WORKBOOK_RELS_PART)?;
                if let (Some(id), Some(target)) = (id, target) {
                    out.insert(id, target);
                }
            }
            Ok(Event::Eof) => break,
            Err(err) => return Err(RegistryError::xml(WORKBOOK_RELS_PART, err)),
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}

fn resolve_part(target: &str) -> String {
    let target = target.replace('\\', "/");
    let joined = match target.strip_prefix('/') {
        Some(absolute) => absolute.to_string(),
        None if target.starts_with("xl/") => target.clone(),
        None => format!("xl/{target}"),
    };
    let mut segments: Vec<&str> = Vec::new();
    for segment in joined.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    segments.join("/")
}

/// Attribute lookup by local name, so `r:id` matches `id`.
fn attr_value<B: BufRead>(
    e: &BytesStart<'_>,
    reader: &Reader<B>,
    key: &[u8],
    part: &str,
) -> Result<Option<String>, RegistryError> {
    for attr in e.attributes().flatten() {
        if attr.key.local_name().as_ref() == key {
            let value = attr
                .decode_and_unescape_value(reader)
                .map_err(|err| RegistryError::xml(part, err))?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

/// Zero-based column index to letters: 0 → A, 25 → Z, 26 → AA.
pub fn column_name(index: usize) -> String {
    let mut n = index + 1;
    let mut letters = Vec::new();
    while n > 0 {
        let rem = (n - 1) % 26;
        letters.push(b'A' + rem as u8);
        n = (n - 1) / 26;
    }
    letters.reverse();
    String::from_utf8_lossy(&letters).into_owned()
}

/// Zero-based column index of a cell reference such as `AB12`.
pub fn column_index(reference: &str) -> Option<usize> {
    let letters: String = reference
        .chars()
        .take_while(|ch| ch.is_ascii_alphabetic())
        .collect();
    if letters.is_empty() {
        return None;
    }
    let mut n = 0usize;
    for ch in letters.chars() {
        let digit = ch.to_ascii_uppercase() as usize - 'A' as usize + 1;
        n = n.checked_mul(26)?.checked_add(digit)?;
    }
    Some(n - 1)
}

fn row_number(reference: &str) -> Option<usize> {
    reference
        .trim_start_matches(|ch: char| ch.is_ascii_alphabetic())
        .parse()
        .ok()
}

pub fn read_sheet(path: &Path, sheet_name: &str) -> Result<Vec<WorksheetRow>, RegistryError> {
    let mut archive = open_package(path)?;
    let location = locate_sheet(&mut archive, sheet_name)?;
    let shared = match read_zip_entry(&mut archive, SHARED_STRINGS_PART)? {
        Some(xml) => parse_shared_strings(&xml)?,
        None => Vec::new(),
    };
    let worksheet = require_zip_entry(&mut archive, &location.part)?;
    let cells = parse_worksheet(&worksheet, &location.part, &shared)?;
    let rows = rows_from_cells(cells);
    debug!(path = %path.display(), sheet = sheet_name, rows = rows.len(), "read worksheet");
    Ok(rows)
}

fn parse_shared_strings(xml: &[u8]) -> Result<Vec<String>, RegistryError> {
    let mut reader = Reader::from_reader(xml);
    reader.trim_text(false);
    let mut buf = Vec::new();
    let mut strings = Vec::new();
    let mut current: Option<String> = None;
    let mut in_text = false;
    let mut phonetic_depth = 0usize;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"si" => current = Some(String::new()),
                b"rPh" => phonetic_depth += 1,
                b"t" if current.is_some() && phonetic_depth == 0 => in_text = true,
                _ => {}
            },
            Ok(Event::Empty(e)) if e.local_name().as_ref() == b"si" => strings.push(String::new()),
            Ok(Event::Text(t)) if in_text => {
                let text = t
                    .unescape()
                    .map_err(|err| RegistryError::xml(SHARED_STRINGS_PART, err))?;
                if let Some(current) = current.as_mut() {
                    current.push_str(&text);
                }
            }
            Ok(Event::CData(c)) if in_text => {
                if let Some(current) = current.as_mut() {
                    current.push_str(&String::from_utf8_lossy(&c.into_inner()));
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"si" => strings.extend(current.take()),
                b"rPh" => phonetic_depth = phonetic_depth.saturating_sub(1),
                b"t" => in_text = false,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(err) => return Err(RegistryError::xml(SHARED_STRINGS_PART, err)),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

#[derive(Debug, Default)]
struct PendingCell {
    column: usize,
    kind: Option<String>,
    value: String,
    inline: String,
}

impl PendingCell {
    fn push(&mut self, target: Capture, text: &str) {
        match target {
            Capture::Value => self.value.push_str(text),
            Capture::Inline => self.inline.push_str(text),
        }
    }

    fn resolve(self, shared: &[String]) -> String {
        match self.kind.as_deref() {
            Some("s") => self
                .value
                .trim()
                .parse::<usize>()
                .ok()
                .and_then(|idx| shared.get(idx).cloned())
                .unwrap_or_default(),
            Some("inlineStr") => self.inline,
            _ => self.value,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Capture {
    Value,
    Inline,
}

type CellGrid = Vec<(usize, BTreeMap<usize, String>)>;

/// Row number and column → text for every `row` element, in document order.
fn parse_worksheet(xml: &[u8], part: &str, shared: &[String]) -> Result<CellGrid, RegistryError> {
    let mut reader = Reader::from_reader(xml);
    reader.trim_text(false);
    let mut buf = Vec::new();

    let mut rows: CellGrid = Vec::new();
    let mut current: Option<(usize, BTreeMap<usize, String>)> = None;
    let mut cell: Option<PendingCell> = None;
    let mut capture: Option<Capture> = None;
    let mut next_row = 1usize;
    let mut next_column = 0usize;
    let mut phonetic_depth = 0usize;

    loop {
        match reader
            .read_event_into(&mut buf)
            .map_err(|err| RegistryError::xml(part, err))?
        {
            Event::Start(e) if e.local_name().as_ref() == b"row" => {
                let number = row_attr(&e, &reader, part)?.unwrap_or(next_row);
                next_row = number + 1;
                next_column = 0;
                current = Some((number, BTreeMap::new()));
            }
            Event::Empty(e) if e.local_name().as_ref() == b"row" => {
                let number = row_attr(&e, &reader, part)?.unwrap_or(next_row);
                next_row = number + 1;
                next_column = 0;
                rows.push((number, BTreeMap::new()));
            }
            Event::Start(e) if e.local_name().as_ref() == b"c" => {
                let column = column_attr(&e, &reader, part)?.unwrap_or(next_column);
                next_column = column + 1;
                cell = Some(PendingCell {
                    column,
                    kind: attr_value(&e, &reader, b"t", part)?,
                    ..PendingCell::default()
                });
            }
            Event::Empty(e) if e.local_name().as_ref() == b"c" => {
                next_column = column_attr(&e, &reader, part)?.unwrap_or(next_column) + 1;
            }
            Event::Start(e) => match e.local_name().as_ref() {
                b"v" if cell.is_some() => capture = Some(Capture::Value),
                b"t" if cell.is_some() && phonetic_depth == 0 => capture = Some(Capture::Inline),
                b"rPh" => phonetic_depth += 1,
                _ => {}
            },
            Event::Text(t) => {
                if let (Some(target), Some(pending)) = (capture, cell.as_mut()) {
                    let text = t.unescape().map_err(|err| RegistryError::xml(part, err))?;
                    pending.push(target, &text);
                }
            }
            Event::CData(c) => {
                if let (Some(target), Some(pending)) = (capture, cell.as_mut()) {
                    pending.push(target, &String::from_utf8_lossy(&c));
                }
            }
            Event::End(e) => match e.local_name().as_ref() {
                b"v" | b"t" => capture = None,
                b"rPh" => phonetic_depth = phonetic_depth.saturating_sub(1),
                b"c" => {
                    capture = None;
                    if let (Some(pending), Some((_, cells))) = (cell.take(), current.as_mut()) {
                        if pending.column < SHEET_COLUMNS.len() {
                            let column = pending.column;
                            cells.insert(column, pending.resolve(shared));
                        }
                    }
                }
                b"row" => rows.extend(current.take()),
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(rows)
}

fn row_attr<B: BufRead>(
    e: &BytesStart<'_>,
    reader: &Reader<B>,
    part: &str,
) -> Result<Option<usize>, RegistryError> {
    Ok(attr_value(e, reader, b"r", part)?.and_then(|r| row_number(r.trim())))
}

fn column_attr<B: BufRead>(
    e: &BytesStart<'_>,
    reader: &Reader<B>,
    part: &str,
) -> Result<Option<usize>, RegistryError> {
    Ok(attr_value(e, reader, b"r", part)?.and_then(|r| column_index(&r)))
}

fn rows_from_cells(grid: CellGrid) -> Vec<WorksheetRow> {
    let header_cells = grid
        .iter()
        .find(|(number, _)| *number == 1)
        .map(|(_, cells)| cells.clone())
        .unwrap_or_default();
    let headers: Vec<String> = sheet_headers()
        .enumerate()
        .map(|(idx, default)| {
            header_cells
                .get(&idx)
                .map(|value| value.trim())
                .filter(|value| !value.is_empty())
                .unwrap_or(default)
                .to_string()
        })
        .collect();

    grid.into_iter()
        .filter(|(number, _)| *number != 1)
        .map(|(_, cells)| {
            headers
                .iter()
                .enumerate()
                .map(|(idx, header)| (header.clone(), cells.get(&idx).cloned().unwrap_or_default()))
                .collect::<WorksheetRow>()
        })
        .filter(|row| !row.is_blank())
        .collect()
}

/// Replacement worksheet part: header row plus one inline-string row per input row.
pub fn build_sheet_xml(rows: &[WorksheetRow]) -> String {
    let max_row = rows.len() + 1;
    let mut xml = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>\n");
    xml.push_str("<worksheet xmlns=\"http://schemas.openxmlformats.org/spreadsheetml/2006/main\">");
    let _ = write!(xml, "<dimension ref=\"A1:{LAST_COLUMN}{max_row}\"/>");
    xml.push_str("<sheetViews><sheetView workbookViewId=\"0\"/></sheetViews>");
    xml.push_str("<sheetFormatPr defaultRowHeight=\"15\"/>");
    xml.push_str("<sheetData>");

    push_row(&mut xml, 1, sheet_headers());
    for (idx, row) in rows.iter().enumerate() {
        let values = sheet_headers().map(|header| row.get(header).unwrap_or_default());
        push_row(&mut xml, idx + 2, values);
    }

    xml.push_str("</sheetData>");
    let _ = write!(xml, "<autoFilter ref=\"A1:{LAST_COLUMN}{max_row}\"/>");
    xml.push_str("</worksheet>");
    xml
}

fn push_row<'a>(xml: &mut String, row: usize, values: impl Iterator<Item = &'a str>) {
    let _ = write!(xml, "<row r=\"{row}\">");
    for (col, value) in values.enumerate() {
        let _ = write!(
            xml,
            "<c r=\"{}{row}\" t=\"inlineStr\"><is><t xml:space=\"preserve\">{}</t></is></c>",
            column_name(col),
            escape_cell_text(value)
        );
    }
    xml.push_str("</row>");
}

fn escape_cell_text(value: &str) -> String {
    let cleaned: String = value.chars().filter(|ch| is_xml_char(*ch)).collect();
    quick_xml::escape::escape(cleaned.as_str()).into_owned()
}

fn is_xml_char(ch: char) -> bool {
    matches!(ch, '\t' | '\n' | '\r' | '\u{20}'..='\u{D7FF}' | '\u{E000}'..='\u{FFFD}' | '\u{10000}'..)
}

/// Rewrites the range of the sheet's autofilter defined name, leaving every
/// other byte of the workbook part untouched. `None` when nothing changed.
pub fn patch_filter_range(
    workbook: &[u8],
    sheet_name: &str,
    max_row: usize,
) -> Result<Option<Vec<u8>>, RegistryError> {
    let mut reader = Reader::from_reader(workbook);
    reader.trim_text(false);
    let mut buf = Vec::new();
    let mut splices: Vec<(usize, usize)> = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"definedName" => {
                let name = attr_value(&e, &reader, b"name", WORKBOOK_PART)?;
                if name.as_deref() == Some(FILTER_DATABASE) {
                    let text_start = reader.buffer_position() as usize;
                    let text_end = workbook[text_start..]
                        .iter()
                        .position(|b| *b == b'<')
                        .map(|pos| text_start + pos)
                        .unwrap_or(workbook.len());
                    let raw = String::from_utf8_lossy(&workbook[text_start..text_end]);
                    let text = quick_xml::escape::unescape(&raw)
                        .map_err(|err| RegistryError::xml(WORKBOOK_PART, err))?;
                    if references_sheet(&text, sheet_name) {
                        if let Some(bang) = raw.rfind('!') {
                            splices.push((text_start + bang + 1, text_end));
                        }
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(err) => return Err(RegistryError::xml(WORKBOOK_PART, err)),
            _ => {}
        }
        buf.clear();
    }

    if splices.is_empty() {
        return Ok(None);
    }
    let range = format!("$A$1:${LAST_COLUMN}${max_row}");
    let mut patched = Vec::with_capacity(workbook.len() + splices.len() * range.len());
    let mut cursor = 0;
    for (start, end) in splices {
        patched.extend_from_slice(&workbook[cursor..start]);
        patched.extend_from_slice(range.as_bytes());
        cursor = end;
    }
    patched.extend_from_slice(&workbook[cursor..]);
    if patched == workbook {
        return Ok(None);
    }
    Ok(Some(patched))
}

fn references_sheet(reference: &str, sheet_name: &str) -> bool {
    let reference = reference.trim_start();
    let quoted = format!("'{}'!", sheet_name.replace('\'', "''"));
    reference.starts_with(&format!("{sheet_name}!")) || reference.starts_with(&quoted)
}

/// Writes `rows` into the named sheet of `template`, producing `output`.
///
/// Only the worksheet part and, when its filter range changes, the workbook
/// part are re-encoded; every other entry is copied compressed as-is.
pub fn write_sheet(
    template: &Path,
    output: &Path,
    rows: &[WorksheetRow],
    sheet_name: &str,
) -> Result<(), RegistryError> {
    let sheet_xml = build_sheet_xml(rows);
    let mut archive = open_package(template)?;
    let location = locate_sheet(&mut archive, sheet_name)?;
    let workbook = require_zip_entry(&mut archive, WORKBOOK_PART)?;
    let patched_workbook = patch_filter_range(&workbook, sheet_name, rows.len() + 1)?;

    let temp = sibling_tempfile(output)?;
    let mut writer = ZipWriter::new(temp);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut wrote_sheet = false;

    for idx in 0..archive.len() {
        let entry = archive.by_index_raw(idx).map_err(package_error)?;
        let name = entry.name().to_string();
        let replacement = if name == location.part {
            wrote_sheet = true;
            Some(sheet_xml.as_bytes())
        } else if name == WORKBOOK_PART {
            patched_workbook.as_deref()
        } else {
            None
        };
        match replacement {
            Some(bytes) => {
                drop(entry);
                writer.start_file(name, options).map_err(package_error)?;
                writer
                    .write_all(bytes)
                    .map_err(|err| RegistryError::Filesystem(err.to_string()))?;
            }
            None => writer.raw_copy_file(entry).map_err(package_error)?,
        }
    }

    if !wrote_sheet {
        return Err(RegistryError::MissingPart(location.part));
    }
    let temp = writer.finish().map_err(package_error)?;
    drop(archive);
    persist(temp, output)?;
    debug!(
        template = %template.display(),
        output = %output.display(),
        rows = rows.len(),
        "wrote worksheet"
    );
    Ok(())
}

fn package_error(err: zip::result::ZipError) -> RegistryError {
    RegistryError::Package(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn column_letters_round_trip() {
        for idx in [0, 17, 25, 26, 51, 701, 702] {
            assert_eq!(column_index(&column_name(idx)), Some(idx));
        }
        assert_eq!(column_name(17), "R");
        assert_eq!(column_name(26), "AA");
        assert_eq!(column_index("ab12"), Some(27));
        assert_eq!(column_index("12"), None);
    }

    #[test]
    fn oversized_column_reference_is_rejected() {
        assert_eq!(column_index("XFD1"), Some(16_383));
        assert_eq!(column_index("ABCDEFGHIJKLMNOPQRSTUVWXYZ1"), None);
        assert_eq!(column_index(&"Z".repeat(40)), None);
    }

    #[test]
    fn row_number_skips_letters() {
        assert_eq!(row_number("C14"), Some(14));
        assert_eq!(row_number("C"), None);
    }

    #[test]
    fn resolves_relationship_targets() {
        assert_eq!(resolve_part("worksheets/sheet2.xml"), "xl/worksheets/sheet2.xml");
        assert_eq!(resolve_part("/xl/worksheets/sheet3.xml"), "xl/worksheets/sheet3.xml");
        assert_eq!(resolve_part("xl/worksheets/sheet1.xml"), "xl/worksheets/sheet1.xml");
        assert_eq!(resolve_part("../xl/worksheets/s.xml"), "xl/worksheets/s.xml");
    }

    #[test]
    fn strips_control_characters() {
        assert_eq!(escape_cell_text("a\u{1}b<c>\tend"), "ab&lt;c&gt;\tend");
    }

    #[test]
    fn filter_patch_keeps_surrounding_bytes() {
        let workbook = br#"<workbook><definedNames><definedName name="_xlnm._FilterDatabase" localSheetId="0" hidden="1">Sources!$A$1:$R$9</definedName><definedName name="Other">Sources!$A$1</definedName></definedNames></workbook>"#;
        let patched = patch_filter_range(workbook, "Sources", 4).unwrap().unwrap();
        let expected = String::from_utf8_lossy(workbook).replace("$A$1:$R$9", "$A$1:$R$4");
        assert_eq!(String::from_utf8(patched).unwrap(), expected);
    }

    #[test]
    fn filter_patch_handles_quoted_sheet_and_other_sheets() {
        let workbook = br#"<workbook><definedNames><definedName name="_xlnm._FilterDatabase">'My Sheet'!$A$1:$C$3</definedName><definedName name="_xlnm._FilterDatabase">Other!$A$1:$C$3</definedName></definedNames></workbook>"#;
        let patched = patch_filter_range(workbook, "My Sheet", 7).unwrap().unwrap();
        let text = String::from_utf8(patched).unwrap();
        assert!(text.contains("'My Sheet'!$A$1:$R$7"));
        assert!(text.contains("Other!$A$1:$C$3"));
        assert_eq!(patch_filter_range(workbook, "Missing", 7).unwrap(), None);
    }
}
