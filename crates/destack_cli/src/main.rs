use std::fs;
use std::path::Path;

use anyhow::Context;
use clap::{CommandFactory, Parser};
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, DecompileCommand, DecompileModeCli, TopLevel};

mod cli;

fn read(path: &Path) -> anyhow::Result<String> {
    fs::read_to_string(path).with_context(|| format!("failed to read {path:?}"))
}

fn decompile_file(
    path: &Path,
    symbols: &Path,
    catalogue: &Path,
    options: destack_lib::DecompileOptions,
) -> anyhow::Result<String> {
    let program = destack_lib::Program::from_sources(&read(path)?, &read(symbols)?)
        .with_context(|| format!("failed to load {path:?}"))?;
    tracing::debug!(
        ?path,
        instructions = program.listing.len(),
        variables = program.variables.iter().count(),
        entries = program.entries.len(),
        "loaded program"
    );
    let catalogue = destack_lib::Catalogue::from_json(&read(catalogue)?)
        .with_context(|| format!("failed to load catalogue {catalogue:?}"))?;
    tracing::debug!(primitives = catalogue.len(), "loaded catalogue");
    tracing::info!(?options, "decompiling {}", path.display());
    let out = destack_lib::decompile_with_options(&program, &catalogue, options).context("decompile error")?;
    Ok(out)
}

fn main() {
    let cli = Cli::parse();

    let filter = match &cli.log {
        Some(directives) => EnvFilter::new(directives),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Some(TopLevel::Decompile { command }) => match command {
            DecompileCommand::File {
                path,
                symbols,
                catalogue,
                mode,
                no_optimize,
                no_inline,
                prune,
            } => {
                let mode = match mode {
                    DecompileModeCli::Pseudo => destack_lib::DecompileMode::Pseudo,
                    DecompileModeCli::Disasm => destack_lib::DecompileMode::Disasm,
                    DecompileModeCli::Json => destack_lib::DecompileMode::Json,
                };
                let options = destack_lib::DecompileOptions {
                    mode,
                    optimize: !no_optimize,
                    inline: !no_inline,
                    prune,
                };
                match decompile_file(&path, &symbols, &catalogue, options) {
                    Ok(out) => {
                        print!("{out}");
                    }
                    Err(e) => {
                        eprintln!("{e:#}");
                        std::process::exit(1);
                    }
                }
            }
        },
        Some(TopLevel::Completion { shell }) => {
            let mut cmd = Cli::command();
            let bin_name = cmd.get_name().to_string();
            clap_complete::generate(shell, &mut cmd, bin_name, &mut std::io::stdout());
        }
        None => {
            if let Err(e) = Cli::command().print_help() {
                eprintln!("{e}");
            }
        }
    }
}
