use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use similar::TextDiff;
use tracing::debug;

use crate::bib::parse_bib;
use crate::config::{CitekeyPolicy, ResolvedPaths, ValidationOptions};
use crate::domain::{ENTRY_TYPES, Record, Registry, records_sorted};
use crate::error::RegistryError;
use crate::normalize::{CanonicalUrl, normalize_text, normalize_url, normalize_whitespace};
use crate::sheet::read_sheet;

static URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^https?://").expect("valid URL pattern"));
static DOI_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^10\.\d{4,9}/[-._;()/:A-Z0-9]+$").expect("valid DOI pattern")
});
static YEAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{4}$").expect("valid year pattern"));

const YEAR_RANGE: std::ops::RangeInclusive<u32> = 1600..=2100;

pub const TITLE_SIMILARITY: f64 = 0.93;
pub const AUTHOR_SIMILARITY: f64 = 0.92;
pub const URL_PATH_SIMILARITY: f64 = 0.90;
const TITLE_BUCKET_CHARS: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    Structural,
    Duplicate,
    Format,
    FuzzyDuplicate,
    Policy,
    Advisory,
    Artifact,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct Issue {
    pub kind: IssueKind,
    pub message: String,
}

impl Issue {
    pub fn new(kind: IssueKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<Issue>,
    pub warnings: Vec<Issue>,
}

impl ValidationReport {
    fn push(&mut self, issue: Issue, fatal: bool) {
        if fatal {
            self.errors.push(issue);
        } else {
            self.warnings.push(issue);
        }
    }

    fn error(&mut self, kind: IssueKind, message: impl Into<String>) {
        self.errors.push(Issue::new(kind, message));
    }

    fn warn(&mut self, kind: IssueKind, message: impl Into<String>) {
        self.warnings.push(Issue::new(kind, message));
    }

    pub fn merge(&mut self, other: ValidationReport) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn error_messages(&self) -> Vec<&str> {
        self.errors.iter().map(|issue| issue.message.as_str()).collect()
    }

    pub fn warning_messages(&self) -> Vec<&str> {
        self.warnings.iter().map(|issue| issue.message.as_str()).collect()
    }

    /// Warnings on success, every error at once otherwise.
    pub fn into_result(self) -> Result<Vec<Issue>, RegistryError> {
        if self.errors.is_empty() {
            Ok(self.warnings)
        } else {
            Err(RegistryError::Validation(ValidationFailure {
                errors: self.errors,
            }))
        }
    }
}

/// Every hard error collected by a validation pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationFailure {
    pub errors: Vec<Issue>,
}

impl ValidationFailure {
    pub fn messages(&self) -> impl Iterator<Item = &str> {
        self.errors.iter().map(|issue| issue.message.as_str())
    }
}

impl fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lines: Vec<&str> = self.messages().collect();
        f.write_str(&lines.join("\n"))
    }
}

pub fn is_http_url(value: &str) -> bool {
    URL_RE.is_match(value)
}

pub fn is_valid_doi(value: &str) -> bool {
    DOI_RE.is_match(value)
}

pub fn validate(registry: &Registry, options: ValidationOptions) -> Result<Vec<Issue>, RegistryError> {
    check(registry, options).into_result()
}

pub fn check(registry: &Registry, options: ValidationOptions) -> ValidationReport {
    check_records(&registry.records, options)
}

pub fn check_records(records: &[Record], options: ValidationOptions) -> ValidationReport {
    let sorted = records_sorted(records);
    let mut report = ValidationReport::default();

    for rec in &sorted {
        check_structure(rec, options, &mut report);
    }
    check_unique_ids(&sorted, &mut report);
    check_exact_duplicates(&sorted, options, &mut report);
    report.warnings.extend(
        fuzzy_warnings(&sorted)
            .into_iter()
            .map(|message| Issue::new(IssueKind::FuzzyDuplicate, message)),
    );

    debug!(
        records = records.len(),
        errors = report.errors.len(),
        warnings = report.warnings.len(),
        strict = options.strict,
        "validated records"
    );
    report
}

fn check_structure(rec: &Record, options: ValidationOptions, report: &mut ValidationReport) {
    let id = rec.label();
    let source = normalize_whitespace(&rec.source);
    let citekey = normalize_whitespace(&rec.citekey);
    let link = normalize_whitespace(&rec.link);
    let ref_link = normalize_whitespace(&rec.ref_link);
    let bib = &rec.bib;

    if rec.id.trim().is_empty() {
        report.error(IssueKind::Structural, "Record with missing id");
    }
    for (name, value) in [("source", &source), ("citekey", &citekey), ("link", &link)] {
        if value.is_empty() {
            report.error(IssueKind::Structural, format!("{id}: missing {name}"));
        }
    }

    let fatal_format = options.strict;
    if !link.is_empty() && !is_http_url(&link) {
        report.push(
            Issue::new(IssueKind::Format, format!("{id}: invalid link URL: {link}")),
            fatal_format,
        );
    }
    if !ref_link.is_empty() && !is_http_url(&ref_link) {
        report.push(
            Issue::new(IssueKind::Format, format!("{id}: invalid ref_link URL: {ref_link}")),
            fatal_format,
        );
    }

    for name in ["entry_type", "title", "author"] {
        if normalize_whitespace(bib.field(name).unwrap_or_default()).is_empty() {
            report.error(IssueKind::Structural, format!("{id}: bib.{name} is required"));
        }
    }
    let year = bib.year.trim();
    if let Some(message) = year_problem(year) {
        report.error(IssueKind::Structural, format!("{id}: {message}"));
    }

    let bib_url = normalize_whitespace(&bib.url);
    if !bib_url.is_empty() && !is_http_url(&bib_url) {
        report.push(
            Issue::new(IssueKind::Format, format!("{id}: invalid bib.url: {bib_url}")),
            fatal_format,
        );
    }
    let doi = normalize_whitespace(&bib.doi);
    if !doi.is_empty() && !is_valid_doi(&doi) {
        report.push(
            Issue::new(IssueKind::Format, format!("{id}: invalid bib.doi: {doi}")),
            fatal_format,
        );
    }
    if normalize_whitespace(&bib.keywords).is_empty() {
        report.warn(
            IssueKind::Advisory,
            format!("{id}: bib.keywords is missing (recommended but optional)"),
        );
    }

    if !source.is_empty() && !citekey.is_empty() && source != citekey {
        let message = format!("{id}: citekey {citekey} differs from source {source}");
        match options.citekey_policy {
            CitekeyPolicy::Ignore => {}
            CitekeyPolicy::Warn => report.warn(IssueKind::Policy, message),
            CitekeyPolicy::Error => report.error(IssueKind::Policy, message),
        }
    }
}

fn year_problem(year: &str) -> Option<String> {
    if !YEAR_RE.is_match(year) {
        return Some("bib.year must be YYYY".to_string());
    }
    match year.parse::<u32>() {
        Ok(value) if YEAR_RANGE.contains(&value) => None,
        _ => Some(format!("bib.year out of expected range: {year}")),
    }
}

fn check_unique_ids(records: &[&Record], report: &mut ValidationReport) {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for rec in records {
        let id = rec.id.trim();
        if !id.is_empty() {
            *counts.entry(id).or_default() += 1;
        }
    }
    for (id, count) in counts {
        if count > 1 {
            report.error(IssueKind::Structural, format!("Duplicate id: {id} ({count} records)"));
        }
    }
}

/// Value → ids for one duplicate dimension. The displayed value is the
/// smallest spelling seen, so messages never depend on record order.
#[derive(Default)]
struct DuplicateGroups<'a> {
    groups: BTreeMap<String, (BTreeSet<String>, Vec<&'a str>)>,
}

impl<'a> DuplicateGroups<'a> {
    fn add(&mut self, key: String, display: String, id: &'a str) {
        if key.is_empty() {
            return;
        }
        let (spellings, ids) = self.groups.entry(key).or_default();
        spellings.insert(display);
        ids.push(id);
    }

    fn collisions(self) -> impl Iterator<Item = (String, String)> {
        self.groups.into_values().filter_map(|(spellings, mut ids)| {
            if ids.len() < 2 {
                return None;
            }
            ids.sort_unstable();
            let display = spellings.into_iter().next().unwrap_or_default();
            Some((display, ids.join(", ")))
        })
    }
}

fn check_exact_duplicates(records: &[&Record], options: ValidationOptions, report: &mut ValidationReport) {
    let mut by_source = DuplicateGroups::default();
    let mut by_citekey = DuplicateGroups::default();
    let mut by_url = DuplicateGroups::default();
    let mut by_title_year = DuplicateGroups::default();

    for rec in records {
        let id = rec.label();
        let source = normalize_whitespace(&rec.source);
        by_source.add(normalize_text(&source), source, id);
        let citekey = normalize_whitespace(&rec.citekey);
        by_citekey.add(citekey.clone(), citekey, id);
        let url = normalize_url(rec.primary_url());
        by_url.add(url.clone(), url, id);

        let title = normalize_whitespace(&rec.bib.title);
        let year = rec.bib.year.trim();
        if !title.is_empty() && !year.is_empty() {
            let key = format!("{}\u{1f}{year}", normalize_text(&title));
            by_title_year.add(key, format!("{title} ({year})"), id);
        }
    }

    for (source, ids) in by_source.collisions() {
        report.error(IssueKind::Duplicate, format!("Exact duplicate source: {source} ({ids})"));
    }
    for (citekey, ids) in by_citekey.collisions() {
        report.error(IssueKind::Duplicate, format!("Exact duplicate citekey: {citekey} ({ids})"));
    }
    for (url, ids) in by_url.collisions() {
        report.push(
            Issue::new(
                IssueKind::Duplicate,
                format!("Exact duplicate URL: {url} ({ids}). Use edit mode."),
            ),
            options.strict,
        );
    }
    for (title_year, ids) in by_title_year.collisions() {
        report.push(
            Issue::new(
                IssueKind::Duplicate,
                format!("Exact duplicate title/year: {title_year} ({ids}). Use edit mode."),
            ),
            options.strict,
        );
    }
}

/// Near-duplicate advisories, sorted. Only records sharing a bucket are
/// compared, and each unordered pair is reported at most once per pass.
pub fn fuzzy_warnings(records: &[&Record]) -> Vec<String> {
    let mut warnings = BTreeSet::new();

    let mut title_buckets: BTreeMap<String, Vec<(&str, String)>> = BTreeMap::new();
    let mut author_buckets: BTreeMap<String, Vec<(&str, String)>> = BTreeMap::new();
    let mut host_buckets: BTreeMap<String, Vec<(&str, String)>> = BTreeMap::new();

    for rec in records {
        let id = rec.id.as_str();
        let title = normalize_text(&rec.bib.title);
        if !title.is_empty() {
            let bucket: String = title.chars().take(TITLE_BUCKET_CHARS).collect();
            title_buckets.entry(bucket).or_default().push((id, title));
        }

        let year = rec.bib.year.trim();
        let author = normalize_text(&rec.bib.author);
        if !year.is_empty() && !author.is_empty() {
            author_buckets
                .entry(year.to_string())
                .or_default()
                .push((id, author));
        }

        if let Some(url) = CanonicalUrl::parse(rec.primary_url()) {
            if !url.host().is_empty() {
                host_buckets
                    .entry(url.host().to_string())
                    .or_default()
                    .push((id, url.path().to_string()));
            }
        }
    }

    compare_buckets(&title_buckets, TITLE_SIMILARITY, "Fuzzy title match", &mut warnings);
    compare_buckets(
        &author_buckets,
        AUTHOR_SIMILARITY,
        "Fuzzy author+year match",
        &mut warnings,
    );
    compare_buckets(&host_buckets, URL_PATH_SIMILARITY, "Fuzzy URL path match", &mut warnings);

    warnings.into_iter().collect()
}

fn compare_buckets(
    buckets: &BTreeMap<String, Vec<(&str, String)>>,
    threshold: f64,
    label: &str,
    warnings: &mut BTreeSet<String>,
) {
    for bucket in buckets.values() {
        for (i, (a_id, a_value)) in bucket.iter().enumerate() {
            for (b_id, b_value) in &bucket[i + 1..] {
                if a_value.is_empty() || b_value.is_empty() || a_value == b_value {
                    continue;
                }
                let similarity = similarity_ratio(a_value, b_value);
                if similarity >= threshold {
                    let (lo, hi) = if a_id <= b_id { (a_id, b_id) } else { (b_id, a_id) };
                    warnings.insert(format!("{label} ({similarity:.2}): {lo} ~ {hi}"));
                }
            }
        }
    }
}

/// `2 * M / T`: matched characters over the combined length of both values.
pub fn similarity_ratio(a: &str, b: &str) -> f64 {
    f64::from(TextDiff::from_chars(a, b).ratio())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CandidateMode {
    Add,
    Edit { target_id: String },
}

/// Pre-admission check of a new or edited record against the prospective set:
/// `records` minus the edit target, plus `candidate`. Duplicates are errors
/// here regardless of strictness.
pub fn check_candidate(records: &[Record], candidate: &Record, mode: &CandidateMode) -> ValidationReport {
    let mut report = ValidationReport::default();
    let bib = &candidate.bib;

    let (others, previous): (Vec<&Record>, Option<&Record>) = match mode {
        CandidateMode::Add => (records.iter().collect(), None),
        CandidateMode::Edit { target_id } => (
            records.iter().filter(|rec| rec.id != *target_id).collect(),
            records.iter().find(|rec| rec.id == *target_id),
        ),
    };

    for name in ["id", "section", "aggsource", "legend", "source", "citekey"] {
        if normalize_whitespace(candidate.field(name).unwrap_or_default()).is_empty() {
            report.error(IssueKind::Structural, format!("Missing required field: {name}"));
        }
    }
    for name in ["entry_type", "title", "author", "year"] {
        if normalize_whitespace(bib.field(name).unwrap_or_default()).is_empty() {
            report.error(IssueKind::Structural, format!("Missing required field: bib.{name}"));
        }
    }

    let source = normalize_whitespace(&candidate.source);
    let citekey = normalize_whitespace(&candidate.citekey);
    let keys_touched = match previous {
        None => true,
        Some(prev) => {
            normalize_whitespace(&prev.source) != source
                || normalize_whitespace(&prev.citekey) != citekey
        }
    };
    if keys_touched && source != citekey {
        report.error(IssueKind::Policy, "source and citekey must be the same value");
    }

    let link = normalize_whitespace(&candidate.link);
    let ref_link = normalize_whitespace(&candidate.ref_link);
    let bib_url = normalize_whitespace(&bib.url);
    for (name, value) in [("link", &link), ("ref_link", &ref_link), ("bib.url", &bib_url)] {
        if !value.is_empty() && !is_http_url(value) {
            report.error(IssueKind::Format, format!("Invalid URL in {name}: {value}"));
        }
    }
    if link.is_empty() && bib_url.is_empty() {
        report.error(IssueKind::Structural, "Missing URL: provide at least link (or bib.url)");
    }

    let entry_type = normalize_text(&bib.entry_type);
    if !entry_type.is_empty() && !ENTRY_TYPES.contains(&entry_type.as_str()) {
        report.warn(IssueKind::Format, format!("Unrecognized bib.entry_type: {entry_type}"));
    }
    let doi = normalize_whitespace(&bib.doi);
    if !doi.is_empty() && !is_valid_doi(&doi) {
        report.warn(IssueKind::Format, format!("DOI format looks unusual: {doi}"));
    }
    let year = normalize_whitespace(&bib.year);
    if !year.is_empty() {
        if let Some(message) = year_problem(&year) {
            report.error(IssueKind::Structural, format!("{message}: {year}"));
        }
    }

    let mut duplicates = BTreeSet::new();
    let id = candidate.id.trim();
    let url = normalize_url(candidate.primary_url());
    let title = normalize_text(&bib.title);
    for rec in others {
        let rid = rec.label();
        if !id.is_empty() && rec.id.trim() == id {
            duplicates.insert(format!("Duplicate id: {id} (record {rid})"));
        }
        if !source.is_empty() && normalize_text(&rec.source) == normalize_text(&source) {
            duplicates.insert(format!("Exact duplicate source found: {source} (record {rid})"));
        }
        if !citekey.is_empty() && normalize_whitespace(&rec.citekey) == citekey {
            duplicates.insert(format!("Exact duplicate citekey found: {citekey} (record {rid})"));
        }
        if !url.is_empty() && normalize_url(rec.primary_url()) == url {
            duplicates.insert(format!("Exact duplicate URL found: {url} (record {rid})"));
        }
        if !title.is_empty()
            && !year.is_empty()
            && normalize_text(&rec.bib.title) == title
            && normalize_whitespace(&rec.bib.year) == year
        {
            duplicates.insert(format!(
                "Exact duplicate (title, year) found: ({title}, {year}) (record {rid})"
            ));
        }
    }
    for message in duplicates {
        report.error(IssueKind::Duplicate, message);
    }

    report.errors.sort();
    report.errors.dedup();
    report.warnings.sort();
    report.warnings.dedup();
    report
}

/// Checks a candidate against the committed worksheet (Source, Citekey, Link)
/// and bibliography (key, url, title/year). Rows and entries keyed by
/// `previous`, the record under edit, are skipped. A missing or unreadable
/// artifact is a warning, never an error.
pub fn check_candidate_artifacts(
    paths: &ResolvedPaths,
    candidate: &Record,
    previous: Option<&Record>,
) -> ValidationReport {
    let mut report = ValidationReport::default();
    let source = normalize_whitespace(&candidate.source);
    let citekey = normalize_whitespace(&candidate.citekey);
    let url = normalize_url(candidate.primary_url());
    let title = normalize_text(&candidate.bib.title);
    let year = normalize_whitespace(&candidate.bib.year);
    let own_keys: BTreeSet<String> = previous
        .into_iter()
        .flat_map(|rec| [normalize_whitespace(&rec.source), normalize_whitespace(&rec.citekey)])
        .filter(|key| !key.is_empty())
        .collect();

    let mut errors = BTreeSet::new();

    let sheet_path = &paths.dictionary_output;
    if !sheet_path.as_std_path().is_file() {
        report.warn(IssueKind::Artifact, format!("Dictionary artifact not found: {sheet_path}"));
    } else {
        match read_sheet(sheet_path.as_std_path(), &paths.sheet_name) {
            Ok(rows) => {
                for row in &rows {
                    let row_source = normalize_whitespace(row.get("Source").unwrap_or_default());
                    let row_citekey = normalize_whitespace(row.get("Citekey").unwrap_or_default());
                    if own_keys.contains(&row_source) || own_keys.contains(&row_citekey) {
                        continue;
                    }
                    if !source.is_empty() && source == row_source {
                        errors.insert(format!("Dictionary duplicate Source: {source}"));
                    }
                    if !citekey.is_empty() && citekey == row_citekey {
                        errors.insert(format!("Dictionary duplicate Citekey: {citekey}"));
                    }
                    if !url.is_empty() && url == normalize_url(row.get("Link").unwrap_or_default()) {
                        errors.insert(format!("Dictionary duplicate Link URL: {url}"));
                    }
                }
                debug!(rows = rows.len(), "checked candidate against worksheet");
            }
            Err(err) => report.warn(IssueKind::Artifact, format!("Dictionary check could not run: {err}")),
        }
    }

    let bib_path = &paths.bib_output;
    if !bib_path.as_std_path().is_file() {
        report.warn(IssueKind::Artifact, format!("Bib artifact not found: {bib_path}"));
    } else {
        match fs::read(bib_path.as_std_path()) {
            Ok(bytes) => {
                let entries = parse_bib(&String::from_utf8_lossy(&bytes));
                for (key, entry) in &entries {
                    let key_norm = normalize_whitespace(key);
                    if own_keys.contains(&key_norm) {
                        continue;
                    }
                    if !citekey.is_empty() && citekey == key_norm {
                        errors.insert(format!("Bib duplicate key: {citekey}"));
                    }
                    if !url.is_empty() && url == normalize_url(entry.field("url").unwrap_or_default()) {
                        errors.insert(format!("Bib duplicate URL: {url} (key {key})"));
                    }
                    let entry_title = normalize_text(entry.field("title").unwrap_or_default());
                    let entry_year = normalize_whitespace(entry.field("year").unwrap_or_default());
                    if !title.is_empty() && !year.is_empty() && title == entry_title && year == entry_year {
                        errors.insert(format!("Bib duplicate (title, year): ({title}, {year}) (key {key})"));
                    }
                }
                debug!(entries = entries.len(), "checked candidate against bibliography");
            }
            Err(err) => report.warn(IssueKind::Artifact, format!("Bib artifact check could not run: {err}")),
        }
    }

    for message in errors {
        report.error(IssueKind::Duplicate, message);
    }
    report
}
