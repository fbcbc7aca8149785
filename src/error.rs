use camino::Utf8PathBuf;
use miette::Diagnostic;
use thiserror::Error;

use crate::validate::ValidationFailure;

#[derive(Debug, Error, Diagnostic)]
pub enum RegistryError {
    #[error("failed to read registry at {0}")]
    RegistryRead(Utf8PathBuf),

    #[error("failed to parse registry JSON: {0}")]
    RegistryParse(String),

    #[error("registry is missing required top-level key: {0}")]
    RegistryShape(String),

    #[error("sheet not found in workbook: {0}")]
    SheetNotFound(String),

    #[error("package part missing: {0}")]
    MissingPart(String),

    #[error("failed to read spreadsheet package: {0}")]
    Package(String),

    #[error("malformed XML in {part}: {message}")]
    Xml { part: String, message: String },

    #[error("no parseable bibliography entry found")]
    NoBibEntry,

    #[error("{0}")]
    #[diagnostic(help("fix the listed records, or drop --strict to downgrade format and duplicate warnings"))]
    Validation(ValidationFailure),

    #[error("{artifact} is out of date: {reason}")]
    #[diagnostic(help("regenerate derived artifacts with `srcreg build`"))]
    Drift { artifact: String, reason: String },

    #[error("target must match exactly one record; got {matches} for {target}")]
    TargetNotFound { target: String, matches: usize },

    #[error("source/citekey changed from {from} to {to}; key rename must be confirmed")]
    KeyRenameUnconfirmed { from: String, to: String },

    #[error("filesystem error: {0}")]
    Filesystem(String),
}

impl RegistryError {
    pub(crate) fn xml(part: &str, err: impl std::fmt::Display) -> Self {
        RegistryError::Xml {
            part: part.to_string(),
            message: err.to_string(),
        }
    }
}
