use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use source_registry::app::{App, GeneratedArtifacts};
use source_registry::config::{
    CitekeyPolicy, DEFAULT_BIB_OUTPUT, DEFAULT_DICTIONARY, DEFAULT_REGISTRY_PATH, PathOverrides,
    ValidationOptions,
};
use source_registry::error::RegistryError;
use source_registry::fs_util::write_bytes_atomic;
use source_registry::output::{JsonOutput, OutputMode, TextOutput};
use source_registry::store::RegistryStore;

const DEFAULT_REPORT_PATH: &str = "metadata/sources/reconciliation_report.md";

#[derive(Parser)]
#[command(name = "srcreg")]
#[command(about = "Canonical source registry: build, validate and reconcile derived artifacts")]
#[command(version)]
struct Cli {
    #[arg(long, global = true, default_value = DEFAULT_REGISTRY_PATH)]
    registry: Utf8PathBuf,

    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Regenerate the Sources sheet and bibliography from the registry")]
    Build(BuildArgs),
    #[command(about = "Validate the registry and optionally the generated artifacts")]
    Validate(ValidateArgs),
    #[command(about = "Write a reconciliation report between registry and bibliography")]
    Reconcile(ReconcileArgs),
}

#[derive(Args)]
struct BuildArgs {
    #[arg(long)]
    dictionary_template: Option<Utf8PathBuf>,

    #[arg(long)]
    dictionary_output: Option<Utf8PathBuf>,

    #[arg(long)]
    bib_output: Option<Utf8PathBuf>,
}

#[derive(Args)]
struct ValidateArgs {
    #[arg(long, help = "Fail on duplicate url/title-year and URL/DOI format issues")]
    strict: bool,

    #[arg(long, value_enum, default_value_t = CitekeyPolicy::Ignore)]
    citekey_policy: CitekeyPolicy,

    #[arg(long)]
    check_generated: bool,

    #[arg(long, default_value = DEFAULT_DICTIONARY)]
    dictionary: Utf8PathBuf,

    #[arg(long, default_value = DEFAULT_BIB_OUTPUT)]
    bib: Utf8PathBuf,
}

#[derive(Args)]
struct ReconcileArgs {
    #[arg(long)]
    bib: Option<Utf8PathBuf>,

    #[arg(long, default_value = DEFAULT_REPORT_PATH)]
    out: Utf8PathBuf,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<RegistryError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &RegistryError) -> u8 {
    match error {
        RegistryError::Validation(_) => 1,
        RegistryError::Drift { .. } => 2,
        RegistryError::SheetNotFound(_)
        | RegistryError::MissingPart(_)
        | RegistryError::Package(_)
        | RegistryError::Xml { .. }
        | RegistryError::NoBibEntry => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Text
    };
    let app = App::new(RegistryStore::new(cli.registry));

    match cli.command {
        Commands::Build(args) => {
            let overrides = PathOverrides {
                bib_output: args.bib_output,
                dictionary_template: args.dictionary_template,
                dictionary_output: args.dictionary_output,
            };
            let result = app.build(&overrides)?;
            match output_mode {
                OutputMode::Json => JsonOutput::print_build(&result).into_diagnostic()?,
                OutputMode::Text => TextOutput::print_build(&result).into_diagnostic()?,
            }
        }
        Commands::Validate(args) => {
            let options = ValidationOptions {
                strict: args.strict,
                citekey_policy: args.citekey_policy,
            };
            let generated = args.check_generated.then(|| GeneratedArtifacts {
                dictionary: args.dictionary,
                bib: args.bib,
            });
            let result = app.validate(options, generated.as_ref())?;
            match output_mode {
                OutputMode::Json => JsonOutput::print_validate(&result).into_diagnostic()?,
                OutputMode::Text => TextOutput::print_validate(&result).into_diagnostic()?,
            }
        }
        Commands::Reconcile(args) => {
            let report = app.reconcile(args.bib.as_deref())?;
            write_bytes_atomic(args.out.as_std_path(), report.to_markdown().as_bytes())?;
            match output_mode {
                OutputMode::Json => JsonOutput::print_reconcile(&report).into_diagnostic()?,
                OutputMode::Text => println!("Wrote reconciliation report to {}", args.out),
            }
        }
    }

    Ok(())
}
