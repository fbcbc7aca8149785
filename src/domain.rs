use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::RegistryConfig;
use crate::normalize::{normalize_text, normalize_whitespace};

pub const REGISTRY_VERSION: u32 = 1;

/// Recognized bibliography fields in render order.
pub const BIB_FIELDS: [&str; 17] = [
    "title",
    "author",
    "year",
    "month",
    "journal",
    "booktitle",
    "volume",
    "number",
    "pages",
    "institution",
    "publisher",
    "doi",
    "url",
    "urldate",
    "abstract",
    "keywords",
    "note",
];

pub const ENTRY_TYPES: [&str; 7] = [
    "article",
    "book",
    "incollection",
    "inproceedings",
    "techreport",
    "misc",
    "unpublished",
];

/// Worksheet header and the record field it is sourced from, in column order.
pub const SHEET_COLUMNS: [(&str, &str); 18] = [
    ("Section", "section"),
    ("AggSource", "aggsource"),
    ("Legend", "legend"),
    ("Source", "source"),
    ("Data_Type", "data_type"),
    ("Link", "link"),
    ("Ref_link", "ref_link"),
    ("Citekey", "citekey"),
    ("Inclusion_in_Warehouse", "inclusion_in_warehouse"),
    ("Multigeo_Reference", "multigeo_reference"),
    ("Metadata", "metadata"),
    ("Metadatalink", "metadatalink"),
    ("QcommentsforTA", "qcommentsforta"),
    ("TAreply", "tareply"),
    ("TAcomments", "tacomments"),
    ("ARJcomments", "arjcomments"),
    ("ARJreplies", "arjreplies"),
    ("SeeAggSourcelisthere", "seeaggsourcelisthere"),
];

/// Identity and link fields that are stored whitespace-collapsed.
pub const NORMALIZED_FIELDS: [&str; 7] = [
    "source",
    "citekey",
    "section",
    "aggsource",
    "legend",
    "link",
    "ref_link",
];

pub fn sheet_headers() -> impl Iterator<Item = &'static str> {
    SHEET_COLUMNS.iter().map(|(header, _)| *header)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BibEntry {
    pub entry_type: String,
    pub title: String,
    pub author: String,
    pub year: String,
    pub month: String,
    pub journal: String,
    pub booktitle: String,
    pub volume: String,
    pub number: String,
    pub pages: String,
    pub institution: String,
    pub publisher: String,
    pub doi: String,
    pub url: String,
    pub urldate: String,
    #[serde(rename = "abstract")]
    pub abstract_text: String,
    pub keywords: String,
    pub note: String,
    pub extra_fields: BTreeMap<String, String>,
}

impl BibEntry {
    pub fn field(&self, name: &str) -> Option<&str> {
        let value = match name {
            "entry_type" => &self.entry_type,
            "title" => &self.title,
            "author" => &self.author,
            "year" => &self.year,
            "month" => &self.month,
            "journal" => &self.journal,
            "booktitle" => &self.booktitle,
            "volume" => &self.volume,
            "number" => &self.number,
            "pages" => &self.pages,
            "institution" => &self.institution,
            "publisher" => &self.publisher,
            "doi" => &self.doi,
            "url" => &self.url,
            "urldate" => &self.urldate,
            "abstract" => &self.abstract_text,
            "keywords" => &self.keywords,
            "note" => &self.note,
            _ => return None,
        };
        Some(value)
    }

    pub fn field_mut(&mut self, name: &str) -> Option<&mut String> {
        let value = match name {
            "entry_type" => &mut self.entry_type,
            "title" => &mut self.title,
            "author" => &mut self.author,
            "year" => &mut self.year,
            "month" => &mut self.month,
            "journal" => &mut self.journal,
            "booktitle" => &mut self.booktitle,
            "volume" => &mut self.volume,
            "number" => &mut self.number,
            "pages" => &mut self.pages,
            "institution" => &mut self.institution,
            "publisher" => &mut self.publisher,
            "doi" => &mut self.doi,
            "url" => &mut self.url,
            "urldate" => &mut self.urldate,
            "abstract" => &mut self.abstract_text,
            "keywords" => &mut self.keywords,
            "note" => &mut self.note,
            _ => return None,
        };
        Some(value)
    }

    /// Maps a parsed entry onto the recognized fields; anything else goes to
    /// `extra_fields` so nothing from the source text is lost.
    pub fn from_raw(raw: &BibEntryRaw) -> Self {
        let mut entry = BibEntry {
            entry_type: if raw.entry_type.is_empty() {
                "misc".to_string()
            } else {
                raw.entry_type.clone()
            },
            ..BibEntry::default()
        };
        for (name, value) in &raw.fields {
            if name != "entry_type" {
                if let Some(slot) = entry.field_mut(name) {
                    *slot = value.clone();
                    continue;
                }
            }
            entry.extra_fields.insert(name.clone(), value.clone());
        }
        entry
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Record {
    pub id: String,
    pub section: String,
    pub aggsource: String,
    pub legend: String,
    pub source: String,
    pub data_type: String,
    pub link: String,
    pub ref_link: String,
    pub citekey: String,
    pub inclusion_in_warehouse: String,
    pub multigeo_reference: String,
    pub metadata: String,
    pub metadatalink: String,
    pub qcommentsforta: String,
    pub tareply: String,
    pub tacomments: String,
    pub arjcomments: String,
    pub arjreplies: String,
    pub seeaggsourcelisthere: String,
    pub bib: BibEntry,
    pub created_at: String,
    pub updated_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_by: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Record {
    pub fn field(&self, name: &str) -> Option<&str> {
        let value = match name {
            "id" => &self.id,
            "section" => &self.section,
            "aggsource" => &self.aggsource,
            "legend" => &self.legend,
            "source" => &self.source,
            "data_type" => &self.data_type,
            "link" => &self.link,
            "ref_link" => &self.ref_link,
            "citekey" => &self.citekey,
            "inclusion_in_warehouse" => &self.inclusion_in_warehouse,
            "multigeo_reference" => &self.multigeo_reference,
            "metadata" => &self.metadata,
            "metadatalink" => &self.metadatalink,
            "qcommentsforta" => &self.qcommentsforta,
            "tareply" => &self.tareply,
            "tacomments" => &self.tacomments,
            "arjcomments" => &self.arjcomments,
            "arjreplies" => &self.arjreplies,
            "seeaggsourcelisthere" => &self.seeaggsourcelisthere,
            _ => return None,
        };
        Some(value)
    }

    pub fn field_mut(&mut self, name: &str) -> Option<&mut String> {
        let value = match name {
            "id" => &mut self.id,
            "section" => &mut self.section,
            "aggsource" => &mut self.aggsource,
            "legend" => &mut self.legend,
            "source" => &mut self.source,
            "data_type" => &mut self.data_type,
            "link" => &mut self.link,
            "ref_link" => &mut self.ref_link,
            "citekey" => &mut self.citekey,
            "inclusion_in_warehouse" => &mut self.inclusion_in_warehouse,
            "multigeo_reference" => &mut self.multigeo_reference,
            "metadata" => &mut self.metadata,
            "metadatalink" => &mut self.metadatalink,
            "qcommentsforta" => &mut self.qcommentsforta,
            "tareply" => &mut self.tareply,
            "tacomments" => &mut self.tacomments,
            "arjcomments" => &mut self.arjcomments,
            "arjreplies" => &mut self.arjreplies,
            "seeaggsourcelisthere" => &mut self.seeaggsourcelisthere,
            _ => return None,
        };
        Some(value)
    }

    /// Bibliography key: the citekey, or the source for records that never had one.
    pub fn bib_key(&self) -> String {
        let citekey = normalize_whitespace(&self.citekey);
        if citekey.is_empty() {
            normalize_whitespace(&self.source)
        } else {
            citekey
        }
    }

    /// `bib.url` when set, otherwise `link`.
    pub fn primary_url(&self) -> &str {
        if self.bib.url.trim().is_empty() {
            &self.link
        } else {
            &self.bib.url
        }
    }

    pub fn label(&self) -> &str {
        if self.id.trim().is_empty() {
            "<missing id>"
        } else {
            &self.id
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Registry {
    pub version: u32,
    pub config: RegistryConfig,
    pub records: Vec<Record>,
}

impl Default for Registry {
    fn default() -> Self {
        Self {
            version: REGISTRY_VERSION,
            config: RegistryConfig::default(),
            records: Vec::new(),
        }
    }
}

impl Registry {
    /// Records whose id, source or citekey equals `target` exactly.
    pub fn find_target(&self, target: &str) -> Vec<usize> {
        let target = normalize_whitespace(target);
        self.records
            .iter()
            .enumerate()
            .filter(|(_, rec)| rec.id == target || rec.source == target || rec.citekey == target)
            .map(|(idx, _)| idx)
            .collect()
    }
}

/// Copy of `record` with [`NORMALIZED_FIELDS`] collapsed. `bib` and every other
/// field are left as stored.
pub fn normalize_record(record: &Record) -> Record {
    let mut normalized = record.clone();
    for name in NORMALIZED_FIELDS {
        if let Some(value) = normalized.field_mut(name) {
            *value = normalize_whitespace(value);
        }
    }
    normalized
}

pub fn records_sorted(records: &[Record]) -> Vec<&Record> {
    let mut sorted: Vec<&Record> = records.iter().collect();
    sorted.sort_by_cached_key(|rec| (normalize_text(&rec.source), normalize_text(&rec.citekey)));
    sorted
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorksheetRow(BTreeMap<String, String>);

impl WorksheetRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_record(record: &Record) -> Self {
        let mut row = Self::new();
        for (header, field) in SHEET_COLUMNS {
            row.set(header, record.field(field).unwrap_or_default());
        }
        row
    }

    pub fn get(&self, header: &str) -> Option<&str> {
        self.0.get(header).map(String::as_str)
    }

    pub fn set(&mut self, header: impl Into<String>, value: impl Into<String>) {
        self.0.insert(header.into(), value.into());
    }

    pub fn is_blank(&self) -> bool {
        self.0.values().all(|value| normalize_whitespace(value).is_empty())
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for WorksheetRow {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut row = Self::new();
        for (header, value) in iter {
            row.set(header, value);
        }
        row
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BibEntryRaw {
    pub entry_type: String,
    pub key: String,
    pub fields: Vec<(String, String)>,
}

impl BibEntryRaw {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, value)| value.as_str())
    }

    /// Overwrites an existing field in place, otherwise appends.
    pub fn set_field(&mut self, name: String, value: String) {
        match self.fields.iter_mut().find(|(field, _)| *field == name) {
            Some(slot) => slot.1 = value,
            None => self.fields.push((name, value)),
        }
    }
}

pub fn now_utc() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}
