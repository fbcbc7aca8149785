use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

pub const DEFAULT_REGISTRY_PATH: &str = "metadata/sources/sources.yaml";
pub const DEFAULT_BIB_OUTPUT: &str =
    "documentation/BibTeX files/GCWealthProject_DataSourcesLibrary.bib";
pub const DEFAULT_DICTIONARY: &str = "handmade_tables/dictionary.xlsx";
pub const DEFAULT_SHEET_NAME: &str = "Sources";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub bib_output: Utf8PathBuf,
    pub dictionary_template: Utf8PathBuf,
    pub dictionary_output: Utf8PathBuf,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            bib_output: Utf8PathBuf::from(DEFAULT_BIB_OUTPUT),
            dictionary_template: Utf8PathBuf::from(DEFAULT_DICTIONARY),
            dictionary_output: Utf8PathBuf::from(DEFAULT_DICTIONARY),
        }
    }
}

/// How to treat records whose citekey differs from their source.
///
/// New records always get `citekey == source`; this only governs records that
/// already diverge in the registry.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum CitekeyPolicy {
    #[default]
    Ignore,
    Warn,
    Error,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValidationOptions {
    pub strict: bool,
    pub citekey_policy: CitekeyPolicy,
}

impl ValidationOptions {
    pub fn strict() -> Self {
        Self {
            strict: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PathOverrides {
    pub bib_output: Option<Utf8PathBuf>,
    pub dictionary_template: Option<Utf8PathBuf>,
    pub dictionary_output: Option<Utf8PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPaths {
    pub bib_output: Utf8PathBuf,
    pub dictionary_template: Utf8PathBuf,
    pub dictionary_output: Utf8PathBuf,
    pub sheet_name: String,
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(config: &RegistryConfig, overrides: &PathOverrides) -> ResolvedPaths {
        Self::resolve_config(config.clone(), overrides.clone())
    }

    pub fn resolve_config(config: RegistryConfig, overrides: PathOverrides) -> ResolvedPaths {
        ResolvedPaths {
            bib_output: overrides.bib_output.unwrap_or(config.bib_output),
            dictionary_template: overrides
                .dictionary_template
                .unwrap_or(config.dictionary_template),
            dictionary_output: overrides
                .dictionary_output
                .unwrap_or(config.dictionary_output),
            sheet_name: DEFAULT_SHEET_NAME.to_string(),
        }
    }
}
