#![allow(dead_code)]

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use source_registry::domain::{BibEntry, Record};
use zip::ZipArchive;
use zip::write::SimpleFileOptions;

pub const STYLES_XML: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<styleSheet xmlns=\"http://schemas.openxmlformats.org/spreadsheetml/2006/main\"><fonts count=\"1\"><font><sz val=\"11\"/></font></fonts></styleSheet>";

pub const NOTES_SHEET_XML: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<worksheet xmlns=\"http://schemas.openxmlformats.org/spreadsheetml/2006/main\"><sheetData><row r=\"1\"><c r=\"A1\" t=\"inlineStr\"><is><t>keep me</t></is></c></row></sheetData></worksheet>";

const CONTENT_TYPES_XML: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<Types xmlns=\"http://schemas.openxmlformats.org/package/2006/content-types\"><Default Extension=\"xml\" ContentType=\"application/xml\"/><Default Extension=\"rels\" ContentType=\"application/vnd.openxmlformats-package.relationships+xml\"/></Types>";

const ROOT_RELS_XML: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<Relationships xmlns=\"http://schemas.openxmlformats.org/package/2006/relationships\"><Relationship Id=\"rId1\" Type=\"http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument\" Target=\"xl/workbook.xml\"/></Relationships>";

const WORKBOOK_RELS_XML: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<Relationships xmlns=\"http://schemas.openxmlformats.org/package/2006/relationships\"><Relationship Id=\"rId1\" Type=\"http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet\" Target=\"worksheets/sheet1.xml\"/><Relationship Id=\"rId2\" Type=\"http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet\" Target=\"worksheets/sheet2.xml\"/><Relationship Id=\"rId3\" Type=\"http://schemas.openxmlformats.org/officeDocument/2006/relationships/styles\" Target=\"styles.xml\"/></Relationships>";

/// Workbook part with a `Notes` sheet first and `Sources` second, plus an
/// autofilter range on `Sources` that covers `filter_rows` rows.
pub fn workbook_xml(filter_rows: usize) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<workbook xmlns=\"http://schemas.openxmlformats.org/spreadsheetml/2006/main\" xmlns:r=\"http://schemas.openxmlformats.org/officeDocument/2006/relationships\"><sheets><sheet name=\"Notes\" sheetId=\"2\" r:id=\"rId2\"/><sheet name=\"Sources\" sheetId=\"1\" r:id=\"rId1\"/></sheets><definedNames><definedName name=\"_xlnm._FilterDatabase\" localSheetId=\"1\" hidden=\"1\">Sources!$A$1:$R${filter_rows}</definedName></definedNames></workbook>"
    )
}

/// Writes a minimal workbook whose `Sources` sheet holds `rows` (first row is
/// the header) as shared strings.
pub fn write_workbook(path: &Path, rows: &[Vec<&str>]) {
    let mut shared: Vec<&str> = Vec::new();
    let mut sheet_data = String::new();
    for (row_idx, row) in rows.iter().enumerate() {
        sheet_data.push_str(&format!("<row r=\"{}\">", row_idx + 1));
        for (col_idx, value) in row.iter().enumerate() {
            let column = (b'A' + col_idx as u8) as char;
            sheet_data.push_str(&format!(
                "<c r=\"{column}{}\" t=\"s\"><v>{}</v></c>",
                row_idx + 1,
                shared.len()
            ));
            shared.push(*value);
        }
        sheet_data.push_str("</row>");
    }
    write_raw_workbook(path, &sheet_data, &shared, rows.len().max(1));
}

/// Writes a workbook whose `Sources` sheet is `sheet_data` verbatim inside
/// `<sheetData>`, backed by the given shared strings.
pub fn write_raw_workbook(path: &Path, sheet_data: &str, shared: &[&str], filter_rows: usize) {
    let sheet = format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<worksheet xmlns=\"http://schemas.openxmlformats.org/spreadsheetml/2006/main\"><sheetData>{sheet_data}</sheetData></worksheet>"
    );

    let mut strings = String::from(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<sst xmlns=\"http://schemas.openxmlformats.org/spreadsheetml/2006/main\">",
    );
    for value in shared {
        strings.push_str(&format!("<si><t>{}</t></si>", quick_xml::escape::escape(*value)));
    }
    strings.push_str("</sst>");

    let file = File::create(path).unwrap();
    let mut writer = zip::ZipWriter::new(file);
    let options = SimpleFileOptions::default();
    let parts: Vec<(&str, String)> = vec![
        ("[Content_Types].xml", CONTENT_TYPES_XML.to_string()),
        ("_rels/.rels", ROOT_RELS_XML.to_string()),
        ("xl/workbook.xml", workbook_xml(filter_rows)),
        ("xl/_rels/workbook.xml.rels", WORKBOOK_RELS_XML.to_string()),
        ("xl/worksheets/sheet1.xml", sheet),
        ("xl/worksheets/sheet2.xml", NOTES_SHEET_XML.to_string()),
        ("xl/sharedStrings.xml", strings),
        ("xl/styles.xml", STYLES_XML.to_string()),
    ];
    for (name, content) in parts {
        writer.start_file(name, options).unwrap();
        writer.write_all(content.as_bytes()).unwrap();
    }
    writer.finish().unwrap();
}

/// Template with only the default header row.
pub fn write_template(path: &Path) {
    let headers: Vec<&str> = source_registry::domain::sheet_headers().collect();
    write_workbook(path, &[headers]);
}

pub fn read_part(path: &Path, name: &str) -> Vec<u8> {
    let mut archive = ZipArchive::new(File::open(path).unwrap()).unwrap();
    let mut entry = archive.by_name(name).unwrap();
    let mut bytes = Vec::new();
    entry.read_to_end(&mut bytes).unwrap();
    bytes
}

pub fn part_names(path: &Path) -> Vec<String> {
    let archive = ZipArchive::new(File::open(path).unwrap()).unwrap();
    archive.file_names().map(str::to_string).collect()
}

/// A record that passes every structural check.
pub fn record(id: &str, source: &str, title: &str, url: &str) -> Record {
    Record {
        id: id.to_string(),
        section: "Wealth".to_string(),
        aggsource: "Aggregate".to_string(),
        legend: format!("{source} legend"),
        source: source.to_string(),
        citekey: source.to_string(),
        link: url.to_string(),
        bib: BibEntry {
            entry_type: "misc".to_string(),
            title: title.to_string(),
            author: format!("{source} Team"),
            year: "2020".to_string(),
            url: url.to_string(),
            keywords: "wealth".to_string(),
            ..BibEntry::default()
        },
        created_at: "2024-01-01T00:00:00Z".to_string(),
        updated_at: "2024-01-01T00:00:00Z".to_string(),
        ..Record::default()
    }
}
