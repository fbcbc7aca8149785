use std::collections::{BTreeMap, BTreeSet};
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::bib::{parse_bib, write_bib};
use crate::config::{ConfigLoader, DEFAULT_SHEET_NAME, PathOverrides, ResolvedPaths, ValidationOptions};
use crate::domain::{Record, Registry, WorksheetRow, normalize_record, now_utc, records_sorted};
use crate::error::RegistryError;
use crate::normalize::normalize_whitespace;
use crate::patch::{RecordPatch, changed_fields, populated_fields};
use crate::sheet::{read_sheet, write_sheet};
use crate::store::{RegistryStore, load_registry};
use crate::validate::{CandidateMode, Issue, check_candidate, check_candidate_artifacts, validate};

const REPORT_SAMPLE: usize = 30;

#[derive(Debug, Clone, Serialize)]
pub struct BuildResult {
    pub dictionary_output: String,
    pub bib_output: String,
    pub records: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct DriftResult {
    pub dictionary: String,
    pub bib: String,
    pub rows: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidateResult {
    pub records: usize,
    pub warnings: Vec<Issue>,
    pub drift: Option<DriftResult>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Add,
    Edit,
    Delete,
}

#[derive(Debug, Clone, Serialize)]
pub struct MutationResult {
    pub operation: Operation,
    pub record_id: String,
    pub warnings: Vec<Issue>,
    pub changed_fields: Vec<String>,
    pub key_renamed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyMismatch {
    pub source: String,
    pub citekey: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub total_records: usize,
    pub missing_citekey: Vec<String>,
    pub mismatched: Vec<KeyMismatch>,
    pub duplicate_sources: Vec<String>,
    pub orphan_bib_entries: Vec<String>,
}

impl ReconcileReport {
    pub fn to_markdown(&self) -> String {
        let mut lines = vec![
            "# Source Registry Reconciliation Report".to_string(),
            String::new(),
            format!("- Total canonical records: {}", self.total_records),
            format!("- Records missing citekey: {}", self.missing_citekey.len()),
            format!("- Records where source != citekey: {}", self.mismatched.len()),
            format!("- Duplicate source keys: {}", self.duplicate_sources.len()),
            format!(
                "- Orphan bib entries (not referenced by citekey): {}",
                self.orphan_bib_entries.len()
            ),
            String::new(),
            "## Sample Mismatches (source != citekey)".to_string(),
        ];
        for mismatch in self.mismatched.iter().take(REPORT_SAMPLE) {
            lines.push(format!("- `{}` -> `{}`", mismatch.source, mismatch.citekey));
        }
        lines.push(String::new());
        lines.push("## Sample Orphan Bib Entries".to_string());
        for key in self.orphan_bib_entries.iter().take(REPORT_SAMPLE) {
            lines.push(format!("- `{key}`"));
        }
        if !self.duplicate_sources.is_empty() {
            lines.push(String::new());
            lines.push("## Duplicate Source Keys".to_string());
            for source in self.duplicate_sources.iter().take(REPORT_SAMPLE) {
                lines.push(format!("- `{source}`"));
            }
        }
        format!("{}\n", lines.join("\n"))
    }
}

#[derive(Debug, Clone, Default)]
pub struct AddRequest {
    pub id: String,
    pub patch: RecordPatch,
    pub actor: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct EditRequest {
    pub target: String,
    pub patch: RecordPatch,
    pub actor: Option<String>,
    pub confirm_key_rename: bool,
}

/// Committed artifacts to compare against a fresh build.
#[derive(Debug, Clone)]
pub struct GeneratedArtifacts {
    pub dictionary: Utf8PathBuf,
    pub bib: Utf8PathBuf,
}

/// Every operation loads a fresh registry snapshot and, for mutations,
/// persists the whole snapshot back.
#[derive(Debug, Clone)]
pub struct App {
    store: RegistryStore,
}

impl App {
    pub fn new(store: RegistryStore) -> Self {
        Self { store }
    }

    pub fn build(&self, overrides: &PathOverrides) -> Result<BuildResult, RegistryError> {
        let registry = self.store.load()?;
        let paths = ConfigLoader::resolve(&registry.config, overrides);
        generate_artifacts(&registry, &paths)
    }

    pub fn validate(
        &self,
        options: ValidationOptions,
        generated: Option<&GeneratedArtifacts>,
    ) -> Result<ValidateResult, RegistryError> {
        let registry = self.store.load()?;
        let warnings = validate(&registry, options)?;
        let drift = match generated {
            Some(artifacts) => Some(check_drift(
                self.store.path(),
                &artifacts.dictionary,
                &artifacts.bib,
            )?),
            None => None,
        };
        Ok(ValidateResult {
            records: registry.records.len(),
            warnings,
            drift,
        })
    }

    pub fn reconcile(&self, bib_path: Option<&Utf8Path>) -> Result<ReconcileReport, RegistryError> {
        let registry = self.store.load()?;
        let bib_path = bib_path.unwrap_or(registry.config.bib_output.as_path());
        let bib_text = match fs::read(bib_path.as_std_path()) {
            Ok(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
            Err(err) => {
                warn!(path = %bib_path, error = %err, "bibliography unreadable, skipping orphan check");
                None
            }
        };
        Ok(reconcile(&registry, bib_text.as_deref()))
    }

    pub fn add(&self, request: AddRequest) -> Result<MutationResult, RegistryError> {
        let mut registry = self.store.load()?;
        let now = now_utc();
        let candidate = normalize_record(
            &request
                .patch
                .into_record(&request.id, request.actor.as_deref(), &now),
        );
        let paths = ConfigLoader::resolve(&registry.config, &PathOverrides::default());
        let mut report = check_candidate(&registry.records, &candidate, &CandidateMode::Add);
        report.merge(check_candidate_artifacts(&paths, &candidate, None));
        let warnings = report.into_result()?;

        let record_id = candidate.id.clone();
        let changed = populated_fields(&candidate);
        registry.records.push(candidate);
        self.store.save(&registry)?;
        info!(id = %record_id, fields = changed.len(), "added record");

        Ok(MutationResult {
            operation: Operation::Add,
            record_id,
            warnings,
            changed_fields: changed,
            key_renamed: false,
        })
    }

    pub fn edit(&self, request: EditRequest) -> Result<MutationResult, RegistryError> {
        let mut registry = self.store.load()?;
        let index = resolve_target(&registry, &request.target)?;
        let before = registry.records[index].clone();

        let mut updated = normalize_record(&before);
        request.patch.apply_to(&mut updated);
        updated.updated_at = now_utc();
        if let Some(actor) = request.actor.as_deref() {
            updated.updated_by = Some(actor.to_string());
        }

        let key_renamed = normalize_whitespace(&before.source) != updated.source
            || normalize_whitespace(&before.citekey) != updated.citekey;
        if key_renamed && !request.confirm_key_rename {
            return Err(RegistryError::KeyRenameUnconfirmed {
                from: key_label(&before),
                to: key_label(&updated),
            });
        }

        let mode = CandidateMode::Edit {
            target_id: before.id.clone(),
        };
        let paths = ConfigLoader::resolve(&registry.config, &PathOverrides::default());
        let mut report = check_candidate(&registry.records, &updated, &mode);
        report.merge(check_candidate_artifacts(&paths, &updated, Some(&before)));
        let warnings = report.into_result()?;
        let changed = changed_fields(&before, &updated);
        let record_id = updated.id.clone();
        registry.records[index] = updated;
        self.store.save(&registry)?;
        info!(id = %record_id, changed = changed.len(), key_renamed, "edited record");

        Ok(MutationResult {
            operation: Operation::Edit,
            record_id,
            warnings,
            changed_fields: changed,
            key_renamed,
        })
    }

    pub fn delete(&self, target: &str) -> Result<MutationResult, RegistryError> {
        let mut registry = self.store.load()?;
        let index = resolve_target(&registry, target)?;
        let removed = registry.records.remove(index);
        self.store.save(&registry)?;
        info!(id = %removed.id, "deleted record");

        Ok(MutationResult {
            operation: Operation::Delete,
            changed_fields: populated_fields(&removed),
            record_id: removed.id,
            warnings: Vec::new(),
            key_renamed: false,
        })
    }
}

fn resolve_target(registry: &Registry, target: &str) -> Result<usize, RegistryError> {
    let hits = registry.find_target(target);
    match hits.as_slice() {
        [index] => Ok(*index),
        _ => Err(RegistryError::TargetNotFound {
            target: target.to_string(),
            matches: hits.len(),
        }),
    }
}

fn key_label(record: &Record) -> String {
    format!("{} / {}", record.source, record.citekey)
}

/// Worksheet rows for the registry, in registry sort order.
pub fn worksheet_rows(records: &[Record]) -> Vec<WorksheetRow> {
    records_sorted(records)
        .into_iter()
        .map(WorksheetRow::from_record)
        .collect()
}

pub fn generate_artifacts(registry: &Registry, paths: &ResolvedPaths) -> Result<BuildResult, RegistryError> {
    let rows = worksheet_rows(&registry.records);
    write_sheet(
        paths.dictionary_template.as_std_path(),
        paths.dictionary_output.as_std_path(),
        &rows,
        &paths.sheet_name,
    )?;
    write_bib(paths.bib_output.as_std_path(), &registry.records)?;
    info!(
        dictionary = %paths.dictionary_output,
        bib = %paths.bib_output,
        records = registry.records.len(),
        "generated artifacts"
    );
    Ok(BuildResult {
        dictionary_output: paths.dictionary_output.to_string(),
        bib_output: paths.bib_output.to_string(),
        records: registry.records.len(),
    })
}

/// Regenerates both artifacts into a scratch directory and compares them with
/// the committed copies: the bibliography byte for byte, the worksheet by
/// re-read rows.
pub fn check_drift(
    registry_path: &Utf8Path,
    sheet_path: &Utf8Path,
    bib_path: &Utf8Path,
) -> Result<DriftResult, RegistryError> {
    let registry = load_registry(registry_path)?;
    let scratch = tempfile::Builder::new()
        .prefix("srcreg-drift")
        .tempdir()
        .map_err(|err| RegistryError::Filesystem(err.to_string()))?;
    let scratch_root = Utf8PathBuf::from_path_buf(scratch.path().to_path_buf())
        .map_err(|_| RegistryError::Filesystem("invalid scratch directory".to_string()))?;
    let paths = ResolvedPaths {
        bib_output: scratch_root.join("library.bib"),
        dictionary_template: sheet_path.to_path_buf(),
        dictionary_output: scratch_root.join("dictionary.xlsx"),
        sheet_name: DEFAULT_SHEET_NAME.to_string(),
    };
    generate_artifacts(&registry, &paths)?;

    if !bib_path.as_std_path().is_file() {
        return Err(RegistryError::Drift {
            artifact: bib_path.to_string(),
            reason: "bibliography artifact is missing".to_string(),
        });
    }
    let committed = fs::read(bib_path.as_std_path())
        .map_err(|err| RegistryError::Filesystem(err.to_string()))?;
    let regenerated = fs::read(paths.bib_output.as_std_path())
        .map_err(|err| RegistryError::Filesystem(err.to_string()))?;
    if committed != regenerated {
        return Err(RegistryError::Drift {
            artifact: bib_path.to_string(),
            reason: "generated bibliography differs from the committed file".to_string(),
        });
    }

    let current = read_sheet(sheet_path.as_std_path(), &paths.sheet_name)?;
    let rebuilt = read_sheet(paths.dictionary_output.as_std_path(), &paths.sheet_name)?;
    if current != rebuilt {
        return Err(RegistryError::Drift {
            artifact: sheet_path.to_string(),
            reason: format!(
                "{} sheet differs from the registry ({} committed rows, {} regenerated)",
                paths.sheet_name,
                current.len(),
                rebuilt.len()
            ),
        });
    }

    debug!(rows = rebuilt.len(), "artifacts match registry");
    Ok(DriftResult {
        dictionary: sheet_path.to_string(),
        bib: bib_path.to_string(),
        rows: rebuilt.len(),
    })
}

pub fn reconcile(registry: &Registry, bib_text: Option<&str>) -> ReconcileReport {
    let records = &registry.records;
    let missing_citekey = records
        .iter()
        .filter(|rec| normalize_whitespace(&rec.citekey).is_empty())
        .map(|rec| rec.label().to_string())
        .collect();

    let mismatched = records
        .iter()
        .filter_map(|rec| {
            let source = normalize_whitespace(&rec.source);
            let citekey = normalize_whitespace(&rec.citekey);
            (!source.is_empty() && !citekey.is_empty() && source != citekey)
                .then_some(KeyMismatch { source, citekey })
        })
        .collect();

    let mut source_counts: BTreeMap<String, usize> = BTreeMap::new();
    for rec in records {
        let source = normalize_whitespace(&rec.source);
        if !source.is_empty() {
            *source_counts.entry(source).or_default() += 1;
        }
    }
    let duplicate_sources = source_counts
        .into_iter()
        .filter(|(_, count)| *count > 1)
        .map(|(source, _)| source)
        .collect();

    let citekeys: BTreeSet<String> = records
        .iter()
        .map(|rec| normalize_whitespace(&rec.citekey))
        .filter(|key| !key.is_empty())
        .collect();
    let orphan_bib_entries = bib_text
        .map(parse_bib)
        .unwrap_or_default()
        .into_keys()
        .filter(|key| !citekeys.contains(key))
        .collect();

    ReconcileReport {
        total_records: records.len(),
        missing_citekey,
        mismatched,
        duplicate_sources,
        orphan_bib_entries,
    }
}
