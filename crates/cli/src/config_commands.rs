use std::io::Write;

use {anyhow::Result, clap::Subcommand};

use parrot_config::{
    ParrotConfig,
    validate::{self, Severity, ValidationResult},
};

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Validate the configuration file and report errors/warnings.
    Check {
        /// Show informational diagnostics in addition to errors and warnings.
        #[arg(long)]
        verbose: bool,
    },
}

pub fn handle_config(action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Check { verbose } => check(verbose),
    }
}

/// ANSI color codes.
const RED: &str = "\x1b[31m";
const YELLOW: &str = "\x1b[33m";
const CYAN: &str = "\x1b[36m";
const BOLD: &str = "\x1b[1m";
const RESET: &str = "\x1b[0m";

fn check(verbose: bool) -> Result<()> {
    let path = parrot_config::find_config_file();
    let mut config = match &path {
        Some(path) => {
            eprintln!("Checking {}\n", path.display());
            match parrot_config::load_config(path) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("  {BOLD}{RED}error{RESET} {e}");
                    std::process::exit(1);
                },
            }
        },
        None => {
            eprintln!("No config file found; checking defaults.\n");
            ParrotConfig::default()
        },
    };
    parrot_config::apply_env_overrides(&mut config, |name| std::env::var(name).ok());

    let result = validate::validate(&config, path);
    let errors = report(&result, verbose, &mut std::io::stderr())?;
    if errors > 0 {
        std::process::exit(1);
    }
    Ok(())
}

/// Print diagnostics and a summary line. Returns the error count.
fn report(result: &ValidationResult, verbose: bool, out: &mut impl Write) -> Result<usize> {
    let mut shown = 0;
    for d in &result.diagnostics {
        if d.severity == Severity::Info && !verbose {
            continue;
        }

        let (color, label) = match d.severity {
            Severity::Error => (RED, "error"),
            Severity::Warning => (YELLOW, "warning"),
            Severity::Info => (CYAN, "info"),
        };

        if d.path.is_empty() {
            writeln!(out, "  {BOLD}{color}{label}{RESET} {}", d.message)?;
        } else {
            writeln!(out, "  {BOLD}{color}{label}{RESET} {}: {}", d.path, d.message)?;
        }
        shown += 1;
    }

    let errors = result.count(Severity::Error);
    let warnings = result.count(Severity::Warning);

    if shown > 0 {
        writeln!(out)?;
    }

    if errors == 0 && warnings == 0 {
        writeln!(out, "No issues found.")?;
    } else {
        writeln!(out, "{errors} error(s), {warnings} warning(s)")?;
    }
    Ok(errors)
}
