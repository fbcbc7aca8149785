mod common;

use std::fs;

use assert_matches::assert_matches;
use camino::{Utf8Path, Utf8PathBuf};

use source_registry::app::{AddRequest, App, EditRequest, GeneratedArtifacts, Operation, worksheet_rows};
use source_registry::config::{PathOverrides, RegistryConfig, ValidationOptions};
use source_registry::domain::Registry;
use source_registry::error::RegistryError;
use source_registry::patch::{BibPatch, RecordPatch};
use source_registry::sheet::write_sheet;
use source_registry::store::{load_registry, save_registry};
use source_registry::validate::IssueKind;

struct Fixture {
    _dir: tempfile::TempDir,
    registry: Utf8PathBuf,
    dictionary: Utf8PathBuf,
    bib: Utf8PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let template = root.join("template.xlsx");
        common::write_template(template.as_std_path());

        let registry = Registry {
            config: RegistryConfig {
                bib_output: root.join("library.bib"),
                dictionary_template: template,
                dictionary_output: root.join("dictionary.xlsx"),
            },
            records: vec![
                common::record("r1", "WID", "World Inequality Database", "https://wid.world"),
                common::record("r2", "OECD", "Wealth Distribution Database", "https://oecd.example.org/wdd"),
            ],
            ..Registry::default()
        };
        let registry_path = root.join("sources.yaml");
        save_registry(&registry, &registry_path).unwrap();

        Self {
            registry: registry_path,
            dictionary: root.join("dictionary.xlsx"),
            bib: root.join("library.bib"),
            _dir: dir,
        }
    }

    fn app(&self) -> App {
        App::new(source_registry::store::RegistryStore::new(self.registry.clone()))
    }

    fn artifacts(&self) -> GeneratedArtifacts {
        GeneratedArtifacts {
            dictionary: self.dictionary.clone(),
            bib: self.bib.clone(),
        }
    }

    fn registry_bytes(&self) -> Vec<u8> {
        fs::read(self.registry.as_std_path()).unwrap()
    }
}

fn new_source_patch(source: &str, link: &str) -> RecordPatch {
    RecordPatch {
        section: Some("Wealth".to_string()),
        aggsource: Some("Aggregate".to_string()),
        legend: Some(format!("{source} legend")),
        source: Some(source.to_string()),
        link: Some(link.to_string()),
        bib: BibPatch {
            title: Some(format!("{source} Household Panel")),
            author: Some(format!("{source} Statistics Office")),
            year: Some("2019".to_string()),
            keywords: Some("wealth; panel".to_string()),
            ..BibPatch::default()
        },
        ..RecordPatch::default()
    }
}

#[test]
fn build_then_validate_finds_no_drift() {
    let fixture = Fixture::new();
    let app = fixture.app();

    let built = app.build(&PathOverrides::default()).unwrap();
    assert_eq!(built.records, 2);
    assert_eq!(built.bib_output, fixture.bib.to_string());

    let result = app
        .validate(ValidationOptions::strict(), Some(&fixture.artifacts()))
        .unwrap();
    assert_eq!(result.records, 2);
    assert!(result.warnings.is_empty(), "{:?}", result.warnings);
    let drift = result.drift.unwrap();
    assert_eq!(drift.rows, 2);
}

#[test]
fn build_honors_path_overrides() {
    let fixture = Fixture::new();
    let app = fixture.app();
    let other_bib = fixture.bib.with_file_name("other.bib");

    app.build(&PathOverrides {
        bib_output: Some(other_bib.clone()),
        ..PathOverrides::default()
    })
    .unwrap();
    assert!(other_bib.as_std_path().is_file());
    assert!(!fixture.bib.as_std_path().exists());
}

#[test]
fn hand_edited_bibliography_is_drift() {
    let fixture = Fixture::new();
    let app = fixture.app();
    app.build(&PathOverrides::default()).unwrap();

    let mut text = fs::read_to_string(fixture.bib.as_std_path()).unwrap();
    text.push_str("\n@misc{Manual, title = {Added by hand}}\n");
    fs::write(fixture.bib.as_std_path(), text).unwrap();

    let err = app
        .validate(ValidationOptions::default(), Some(&fixture.artifacts()))
        .unwrap_err();
    assert_matches!(err, RegistryError::Drift { artifact, .. } if artifact == fixture.bib.as_str());
}

#[test]
fn missing_bibliography_is_drift() {
    let fixture = Fixture::new();
    let app = fixture.app();
    app.build(&PathOverrides::default()).unwrap();
    fs::remove_file(fixture.bib.as_std_path()).unwrap();

    let err = app
        .validate(ValidationOptions::default(), Some(&fixture.artifacts()))
        .unwrap_err();
    assert_matches!(err, RegistryError::Drift { reason, .. } if reason.contains("missing"));
}

#[test]
fn stale_worksheet_is_drift() {
    let fixture = Fixture::new();
    let app = fixture.app();
    app.build(&PathOverrides::default()).unwrap();

    let registry = load_registry(&fixture.registry).unwrap();
    let rows = worksheet_rows(&registry.records[..1]);
    let dictionary = fixture.dictionary.as_std_path();
    write_sheet(dictionary, dictionary, &rows, "Sources").unwrap();

    let err = app
        .validate(ValidationOptions::default(), Some(&fixture.artifacts()))
        .unwrap_err();
    assert_matches!(err, RegistryError::Drift { artifact, .. } if artifact == fixture.dictionary.as_str());
}

#[test]
fn add_fills_defaults_and_persists() {
    let fixture = Fixture::new();
    let app = fixture.app();

    let result = app
        .add(AddRequest {
            id: "r3".to_string(),
            patch: new_source_patch("Eurostat", "https://ec.europa.eu/eurostat"),
            actor: Some("tester".to_string()),
        })
        .unwrap();
    assert_eq!(result.operation, Operation::Add);
    assert_eq!(result.record_id, "r3");
    assert!(result.changed_fields.contains(&"bib.url".to_string()));

    let registry = load_registry(&fixture.registry).unwrap();
    assert_eq!(registry.records.len(), 3);
    let added = registry.records.iter().find(|rec| rec.id == "r3").unwrap();
    assert_eq!(added.citekey, "Eurostat");
    assert_eq!(added.bib.entry_type, "misc");
    assert_eq!(added.bib.url, "https://ec.europa.eu/eurostat");
    assert_eq!(added.created_by.as_deref(), Some("tester"));
    assert_eq!(added.created_at, added.updated_at);
}

#[test]
fn rejected_add_leaves_registry_untouched() {
    let fixture = Fixture::new();
    let app = fixture.app();
    let before = fixture.registry_bytes();

    let err = app
        .add(AddRequest {
            id: "r3".to_string(),
            patch: new_source_patch("wid", "https://WID.world/"),
            actor: None,
        })
        .unwrap_err();
    assert_matches!(err, RegistryError::Validation(failure) => {
        let messages: Vec<&str> = failure.messages().collect();
        assert!(messages.contains(&"Exact duplicate source found: wid (record r1)"));
        assert!(messages.contains(&"Exact duplicate URL found: https://wid.world (record r1)"));
    });
    assert_eq!(fixture.registry_bytes(), before);
}

#[test]
fn edit_reports_changed_fields() {
    let fixture = Fixture::new();
    let app = fixture.app();

    let result = app
        .edit(EditRequest {
            target: "OECD".to_string(),
            patch: RecordPatch {
                data_type: Some("Survey".to_string()),
                section: Some("   ".to_string()),
                ..RecordPatch::default()
            },
            actor: Some("editor".to_string()),
            confirm_key_rename: false,
        })
        .unwrap();
    assert_eq!(result.record_id, "r2");
    assert_eq!(result.changed_fields, vec!["data_type".to_string()]);
    assert!(!result.key_renamed);

    let registry = load_registry(&fixture.registry).unwrap();
    let edited = &registry.records[1];
    assert_eq!(edited.data_type, "Survey");
    assert_eq!(edited.section, "Wealth");
    assert_eq!(edited.updated_by.as_deref(), Some("editor"));
}

#[test]
fn key_rename_requires_confirmation() {
    let fixture = Fixture::new();
    let app = fixture.app();
    let before = fixture.registry_bytes();
    let rename = RecordPatch {
        source: Some("WIL".to_string()),
        citekey: Some("WIL".to_string()),
        ..RecordPatch::default()
    };

    let err = app
        .edit(EditRequest {
            target: "r1".to_string(),
            patch: rename.clone(),
            ..EditRequest::default()
        })
        .unwrap_err();
    assert_matches!(err, RegistryError::KeyRenameUnconfirmed { from, to } => {
        assert_eq!(from, "WID / WID");
        assert_eq!(to, "WIL / WIL");
    });
    assert_eq!(fixture.registry_bytes(), before);

    let result = app
        .edit(EditRequest {
            target: "r1".to_string(),
            patch: rename,
            confirm_key_rename: true,
            ..EditRequest::default()
        })
        .unwrap();
    assert!(result.key_renamed);
    assert_eq!(result.changed_fields, vec!["source".to_string(), "citekey".to_string()]);
}

#[test]
fn delete_requires_a_single_match() {
    let fixture = Fixture::new();
    let app = fixture.app();

    let err = app.delete("nope").unwrap_err();
    assert_matches!(err, RegistryError::TargetNotFound { matches: 0, .. });

    let result = app.delete("r2").unwrap();
    assert_eq!(result.operation, Operation::Delete);
    let registry = load_registry(&fixture.registry).unwrap();
    assert_eq!(registry.records.len(), 1);
    assert_eq!(registry.records[0].id, "r1");
}

#[test]
fn reconcile_lists_mismatches_and_orphans() {
    let fixture = Fixture::new();
    let mut registry = load_registry(&fixture.registry).unwrap();
    registry.records[1].citekey = "oecd2020".to_string();
    save_registry(&registry, &fixture.registry).unwrap();

    let bib_path = fixture.bib.with_file_name("external.bib");
    fs::write(
        bib_path.as_std_path(),
        "@misc{WID, title = {x}}\n@misc{Orphan2019, title = {y}}\n",
    )
    .unwrap();

    let report = fixture.app().reconcile(Some(&bib_path)).unwrap();
    assert_eq!(report.total_records, 2);
    assert!(report.missing_citekey.is_empty());
    assert_eq!(report.mismatched.len(), 1);
    assert_eq!(report.mismatched[0].source, "OECD");
    assert_eq!(report.mismatched[0].citekey, "oecd2020");
    assert_eq!(report.orphan_bib_entries, vec!["Orphan2019".to_string()]);

    let markdown = report.to_markdown();
    assert!(markdown.contains("- Records where source != citekey: 1\n"));
    assert!(markdown.contains("- `Orphan2019`\n"));
}

#[test]
fn reconcile_without_bibliography_has_no_orphans() {
    let fixture = Fixture::new();
    let missing = Utf8Path::new("does/not/exist.bib");
    let report = fixture.app().reconcile(Some(missing)).unwrap();
    assert_eq!(report.total_records, 2);
    assert!(report.orphan_bib_entries.is_empty());
    assert!(report.duplicate_sources.is_empty());
}

#[test]
fn pasted_entry_seeds_a_new_record() {
    let fixture = Fixture::new();
    let (key, entry) = source_registry::bib::parse_bib_paste(
        "@techreport{LIS2022,\n  title = {Luxembourg Wealth Study},\n  author = {LIS Cross-National Data Center},\n  year = {2022},\n  institution = {LIS},\n  url = {https://www.lisdatacenter.org/}\n}",
    )
    .unwrap();

    let patch = RecordPatch {
        section: Some("Wealth".to_string()),
        aggsource: Some("Surveys".to_string()),
        legend: Some("LIS (2022)".to_string()),
        source: Some(key.clone()),
        bib: BibPatch::from_entry(&entry),
        ..RecordPatch::default()
    };
    fixture
        .app()
        .add(AddRequest {
            id: "lis".to_string(),
            patch,
            actor: None,
        })
        .unwrap();

    let registry = load_registry(&fixture.registry).unwrap();
    let added = registry.records.iter().find(|rec| rec.id == "lis").unwrap();
    assert_eq!(added.citekey, "LIS2022");
    assert_eq!(added.bib.entry_type, "techreport");
    assert_eq!(added.bib.institution, "LIS");
    assert_eq!(added.link, "https://www.lisdatacenter.org/");
}

#[test]
fn add_is_checked_against_committed_artifacts() {
    let fixture = Fixture::new();
    let app = fixture.app();
    app.build(&PathOverrides::default()).unwrap();
    app.delete("r1").unwrap();
    let before = fixture.registry_bytes();

    let err = app
        .add(AddRequest {
            id: "r3".to_string(),
            patch: new_source_patch("WID", "https://WID.world/"),
            actor: None,
        })
        .unwrap_err();
    assert_matches!(err, RegistryError::Validation(failure) => {
        let messages: Vec<&str> = failure.messages().collect();
        assert_eq!(
            messages,
            vec![
                "Bib duplicate URL: https://wid.world (key WID)",
                "Bib duplicate key: WID",
                "Dictionary duplicate Citekey: WID",
                "Dictionary duplicate Link URL: https://wid.world",
                "Dictionary duplicate Source: WID",
            ]
        );
    });
    assert_eq!(fixture.registry_bytes(), before);
}

#[test]
fn missing_artifacts_only_warn() {
    let fixture = Fixture::new();
    let result = fixture
        .app()
        .add(AddRequest {
            id: "r3".to_string(),
            patch: new_source_patch("Eurostat", "https://ec.europa.eu/eurostat"),
            actor: None,
        })
        .unwrap();

    let messages: Vec<&str> = result.warnings.iter().map(|issue| issue.message.as_str()).collect();
    assert!(messages.contains(&format!("Dictionary artifact not found: {}", fixture.dictionary).as_str()));
    assert!(messages.contains(&format!("Bib artifact not found: {}", fixture.bib).as_str()));
}

#[test]
fn unreadable_dictionary_only_warns() {
    let fixture = Fixture::new();
    let app = fixture.app();
    app.build(&PathOverrides::default()).unwrap();
    fs::write(fixture.dictionary.as_std_path(), b"not a zip").unwrap();

    let result = app
        .add(AddRequest {
            id: "r3".to_string(),
            patch: new_source_patch("Eurostat", "https://ec.europa.eu/eurostat"),
            actor: None,
        })
        .unwrap();
    assert!(
        result
            .warnings
            .iter()
            .any(|issue| issue.message.starts_with("Dictionary check could not run: "))
    );
}

#[test]
fn edit_skips_its_own_artifact_rows() {
    let fixture = Fixture::new();
    let app = fixture.app();
    app.build(&PathOverrides::default()).unwrap();

    let result = app
        .edit(EditRequest {
            target: "WID".to_string(),
            patch: RecordPatch {
                data_type: Some("Panel".to_string()),
                ..RecordPatch::default()
            },
            ..EditRequest::default()
        })
        .unwrap();
    assert_eq!(result.changed_fields, vec!["data_type".to_string()]);
    assert!(result.warnings.iter().all(|issue| issue.kind != IssueKind::Artifact));
}

#[test]
fn edit_keeps_bib_and_free_text_whitespace() {
    let fixture = Fixture::new();
    let mut registry = load_registry(&fixture.registry).unwrap();
    registry.records[0].legend = "  WID   legend ".to_string();
    registry.records[0].metadata = "line one\n  line two".to_string();
    registry.records[0].bib.note = "see  appendix".to_string();
    save_registry(&registry, &fixture.registry).unwrap();

    fixture
        .app()
        .edit(EditRequest {
            target: "r1".to_string(),
            patch: RecordPatch {
                data_type: Some("Survey".to_string()),
                ..RecordPatch::default()
            },
            ..EditRequest::default()
        })
        .unwrap();

    let edited = load_registry(&fixture.registry).unwrap().records.remove(0);
    assert_eq!(edited.legend, "WID legend");
    assert_eq!(edited.metadata, "line one\n  line two");
    assert_eq!(edited.bib.note, "see  appendix");
}
