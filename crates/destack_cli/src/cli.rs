use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum, builder::{Styles, styling::{AnsiColor, Effects}}, crate_description, crate_name, crate_version};
use clap_complete::Shell;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DecompileModeCli {
    Pseudo,
    Disasm,
    Json,
}

#[derive(Parser)]
#[command(name = crate_name!(),
    version = crate_version!(),
    about = crate_description!(),
    styles = Styles::styled()
        .header(AnsiColor::BrightGreen.on_default() | Effects::BOLD | Effects::UNDERLINE)
        .usage(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .literal(AnsiColor::BrightCyan.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Cyan.on_default()))]
pub struct Cli {
    /// Log filter, e.g. `debug` or `destack_lib::data_flow=trace` (overrides RUST_LOG)
    #[arg(long, global = true)]
    pub log: Option<String>,

    #[command(subcommand)]
    pub command: Option<TopLevel>,
}

#[derive(Subcommand)]
pub enum TopLevel {
    /// Decompiles stack bytecode
    Decompile {
        #[command(subcommand)]
        command: DecompileCommand,
    },
    /// Generate shell completion
    Completion {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand)]
pub enum DecompileCommand {
    /// Decompiles a disassembly listing
    File {
        /// Path to the disassembly listing
        path: PathBuf,

        /// JSON document with the heap variables and declared entries
        #[arg(long)]
        symbols: PathBuf,

        /// JSON document describing the extern primitives
        #[arg(long)]
        catalogue: PathBuf,

        /// Output mode
        #[arg(long, value_enum, default_value_t = DecompileModeCli::Pseudo)]
        mode: DecompileModeCli,

        /// Keep loops and conditionals in their raw `while (true)` / guard form
        #[arg(long, default_value_t = false)]
        no_optimize: bool,

        /// Keep every variable read and every temporary assignment
        #[arg(long, default_value_t = false)]
        no_inline: bool,

        /// Drop IR lines whose results are never observed
        #[arg(long, default_value_t = false)]
        prune: bool,
    }
}
