use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::domain::{BIB_FIELDS, BibEntry, Record};
use crate::normalize::normalize_whitespace;

/// Record fields an edit may overwrite, in summary order.
pub const PATCHABLE_FIELDS: [&str; 12] = [
    "section",
    "aggsource",
    "legend",
    "source",
    "citekey",
    "data_type",
    "link",
    "ref_link",
    "inclusion_in_warehouse",
    "multigeo_reference",
    "metadata",
    "metadatalink",
];

/// Sparse edit payload. A field overwrites only when present and non-blank;
/// absence means "leave unchanged", never "clear".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordPatch {
    pub section: Option<String>,
    pub aggsource: Option<String>,
    pub legend: Option<String>,
    pub source: Option<String>,
    pub citekey: Option<String>,
    pub data_type: Option<String>,
    pub link: Option<String>,
    pub ref_link: Option<String>,
    pub inclusion_in_warehouse: Option<String>,
    pub multigeo_reference: Option<String>,
    pub metadata: Option<String>,
    pub metadatalink: Option<String>,
    pub bib: BibPatch,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BibPatch {
    pub entry_type: Option<String>,
    pub title: Option<String>,
    pub author: Option<String>,
    pub year: Option<String>,
    pub month: Option<String>,
    pub journal: Option<String>,
    pub booktitle: Option<String>,
    pub volume: Option<String>,
    pub number: Option<String>,
    pub pages: Option<String>,
    pub institution: Option<String>,
    pub publisher: Option<String>,
    pub doi: Option<String>,
    pub url: Option<String>,
    pub urldate: Option<String>,
    #[serde(rename = "abstract")]
    pub abstract_text: Option<String>,
    pub keywords: Option<String>,
    pub note: Option<String>,
    pub extra_fields: BTreeMap<String, String>,
}

fn present(value: Option<&str>) -> Option<String> {
    value.map(normalize_whitespace).filter(|value| !value.is_empty())
}

impl RecordPatch {
    pub fn get(&self, name: &str) -> Option<&str> {
        let value = match name {
            "section" => &self.section,
            "aggsource" => &self.aggsource,
            "legend" => &self.legend,
            "source" => &self.source,
            "citekey" => &self.citekey,
            "data_type" => &self.data_type,
            "link" => &self.link,
            "ref_link" => &self.ref_link,
            "inclusion_in_warehouse" => &self.inclusion_in_warehouse,
            "multigeo_reference" => &self.multigeo_reference,
            "metadata" => &self.metadata,
            "metadatalink" => &self.metadatalink,
            _ => return None,
        };
        value.as_deref()
    }

    pub fn apply_to(&self, record: &mut Record) {
        for name in PATCHABLE_FIELDS {
            if let (Some(value), Some(slot)) = (present(self.get(name)), record.field_mut(name)) {
                *slot = value;
            }
        }
        self.bib.apply_to(&mut record.bib);
    }

    /// Builds a fresh record. The citekey defaults to the source, and a URL
    /// given on only one of `link`/`bib.url` is mirrored to the other.
    pub fn into_record(self, id: &str, actor: Option<&str>, now: &str) -> Record {
        let mut record = Record {
            id: normalize_whitespace(id),
            created_at: now.to_string(),
            updated_at: now.to_string(),
            created_by: actor.map(str::to_string),
            updated_by: actor.map(str::to_string),
            ..Record::default()
        };
        self.apply_to(&mut record);

        if record.citekey.is_empty() {
            record.citekey = record.source.clone();
        }
        if record.bib.entry_type.is_empty() {
            record.bib.entry_type = "misc".to_string();
        }
        if record.bib.url.is_empty() {
            record.bib.url = record.link.clone();
        } else if record.link.is_empty() {
            record.link = record.bib.url.clone();
        }
        record
    }
}

impl BibPatch {
    pub fn get(&self, name: &str) -> Option<&str> {
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
        value.as_deref()
    }

    fn slot(&mut self, name: &str) -> Option<&mut Option<String>> {
        let slot = match name {
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
        Some(slot)
    }

    /// Patch carrying every non-blank field of a parsed entry, e.g. a pasted snippet.
    pub fn from_entry(entry: &BibEntry) -> Self {
        let mut patch = BibPatch::default();
        for name in bib_summary_fields() {
            let value = present(entry.field(name));
            if let Some(slot) = patch.slot(name) {
                *slot = value;
            }
        }
        patch.extra_fields = entry
            .extra_fields
            .iter()
            .filter(|(_, value)| !normalize_whitespace(value).is_empty())
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        patch
    }

    pub fn apply_to(&self, bib: &mut BibEntry) {
        for name in bib_summary_fields() {
            if let (Some(value), Some(slot)) = (present(self.get(name)), bib.field_mut(name)) {
                *slot = value;
            }
        }
        for (name, value) in &self.extra_fields {
            let value = normalize_whitespace(value);
            if !value.is_empty() {
                bib.extra_fields.insert(name.clone(), value);
            }
        }
    }
}

fn bib_summary_fields() -> impl Iterator<Item = &'static str> {
    std::iter::once("entry_type").chain(BIB_FIELDS)
}

/// Fields whose normalized value differs between two versions of a record.
pub fn changed_fields(before: &Record, after: &Record) -> Vec<String> {
    let mut changed: Vec<String> = PATCHABLE_FIELDS
        .into_iter()
        .filter(|name| {
            normalize_whitespace(before.field(name).unwrap_or_default())
                != normalize_whitespace(after.field(name).unwrap_or_default())
        })
        .map(str::to_string)
        .collect();
    changed.extend(
        bib_summary_fields()
            .filter(|name| {
                normalize_whitespace(before.bib.field(name).unwrap_or_default())
                    != normalize_whitespace(after.bib.field(name).unwrap_or_default())
            })
            .map(|name| format!("bib.{name}")),
    );
    changed
}

/// Fields carrying a non-blank value.
pub fn populated_fields(record: &Record) -> Vec<String> {
    let mut fields: Vec<String> = PATCHABLE_FIELDS
        .into_iter()
        .filter(|name| !normalize_whitespace(record.field(name).unwrap_or_default()).is_empty())
        .map(str::to_string)
        .collect();
    fields.extend(
        bib_summary_fields()
            .filter(|name| !normalize_whitespace(record.bib.field(name).unwrap_or_default()).is_empty())
            .map(|name| format!("bib.{name}")),
    );
    fields
}
