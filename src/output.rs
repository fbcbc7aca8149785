use std::io::{self, Write};

use serde::Serialize;

use crate::app::{BuildResult, ReconcileReport, ValidateResult};

const WARNING_LIMIT: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Text,
    Json,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_build(result: &BuildResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_validate(result: &ValidateResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_reconcile(report: &ReconcileReport) -> io::Result<()> {
        Self::print_json(report)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

pub struct TextOutput;

impl TextOutput {
    pub fn print_build(result: &BuildResult) -> io::Result<()> {
        let mut stdout = io::stdout();
        writeln!(stdout, "Generated dictionary Sources sheet: {}", result.dictionary_output)?;
        writeln!(stdout, "Generated bib: {}", result.bib_output)?;
        writeln!(stdout, "Records: {}", result.records)
    }

    pub fn print_validate(result: &ValidateResult) -> io::Result<()> {
        Self::write_validate(&mut io::stdout(), result)
    }

    /// Up to twenty warnings, then the pass line.
    pub fn write_validate<W: Write>(out: &mut W, result: &ValidateResult) -> io::Result<()> {
        let warnings = &result.warnings;
        if !warnings.is_empty() {
            writeln!(
                out,
                "Warnings (non-blocking unless --strict is used): {}",
                warnings.len()
            )?;
            for warning in warnings.iter().take(WARNING_LIMIT) {
                writeln!(out, " - {warning}")?;
            }
            if warnings.len() > WARNING_LIMIT {
                writeln!(
                    out,
                    " - ... {} additional warnings omitted",
                    warnings.len() - WARNING_LIMIT
                )?;
            }
        }
        if let Some(drift) = &result.drift {
            writeln!(out, "Generated artifacts are current ({} rows)", drift.rows)?;
        }
        writeln!(out, "Validation passed")
    }
}
