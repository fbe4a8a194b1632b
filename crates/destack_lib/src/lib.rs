use std::fmt;

use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;

pub mod catalogue;
pub mod ctrl_flow;
pub mod data_flow;
pub mod ir;
pub mod listing;
pub mod render;
pub mod stmt;
pub mod structure;
pub mod symbols;

pub use catalogue::{Catalogue, ParamDir, PrimitiveId};
pub use ctrl_flow::{ControlFlow, JumpType};
pub use data_flow::{DataFlow, PortId};
pub use ir::{Instruction, IrProgram, Op, Opcode};
pub use listing::Listing;
pub use stmt::{Expr, Stmt};
pub use structure::EntryBlock;
pub use symbols::{EntryDecl, HeapValue, Variable, VariableTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecompileMode {
    Pseudo,
    Disasm,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecompileOptions {
    pub mode: DecompileMode,
    /// Apply the conditional and loop rewrites while structuring
    pub optimize: bool,
    /// Substitute constants and fold single-use assignments into their reader
    pub inline: bool,
    /// Drop dead IR lines and re-run the analyses before structuring
    pub prune: bool,
}

impl Default for DecompileOptions {
    fn default() -> Self {
        Self {
            mode: DecompileMode::Pseudo,
            optimize: true,
            inline: true,
            prune: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum DestackError {
    #[error("malformed listing at line {line}: {text}")]
    MalformedListing { line: usize, text: String },

    #[error("unknown opcode `{0}`")]
    UnknownOpcode(String),

    #[error("duplicate address 0x{0:08X}")]
    DuplicateAddress(u32),

    #[error("address 0x{0:08X} is out of order")]
    UnorderedAddress(u32),

    #[error("unknown address 0x{0:08X}")]
    UnknownAddress(u32),

    #[error("unknown variable `{0}`")]
    UnknownVariable(String),

    #[error("no variable at heap address 0x{0:08X}")]
    UnknownVariableAddress(u32),

    #[error("duplicate variable `{0}`")]
    DuplicateVariable(String),

    #[error("unknown primitive `{0}`")]
    UnknownPrimitive(String),

    #[error("unknown primitive id {0}")]
    UnknownPrimitiveId(u32),

    #[error("missing operand for {opcode} at 0x{address:08X}")]
    MissingOperand { address: u32, opcode: &'static str },

    #[error("operand stack underflow at 0x{0:08X}")]
    StackUnderflow(u32),

    #[error("unsupported bytecode idiom at 0x{address:08X}: {detail}")]
    UnsupportedIdiom { address: u32, detail: String },

    #[error("scope stack misuse at IR line {line}: {detail}")]
    ScopeStack { line: usize, detail: String },

    #[error("invalid host data: {0}")]
    Json(#[from] serde_json::Error),
}

/// A declared entry whose translation or structuring was abandoned.
#[derive(Debug, Serialize)]
pub struct EntryFailure {
    pub entry: String,
    #[serde(serialize_with = "serialize_display")]
    pub error: DestackError,
}

fn serialize_display<T: fmt::Display, S: Serializer>(value: &T, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(value)
}

/// Everything the host hands over for one program.
#[derive(Debug, Clone)]
pub struct Program {
    pub listing: Listing,
    pub variables: VariableTable,
    pub entries: Vec<EntryDecl>,
}

impl Program {
    /// Builds a program from a disassembly listing and a JSON symbols document.
    pub fn from_sources(listing: &str, symbols: &str) -> Result<Self, DestackError> {
        let listing = Listing::parse(listing)?;
        let (variables, entries) = symbols::load_symbols(symbols)?;
        Ok(Self {
            listing,
            variables,
            entries,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct Decompilation {
    pub ir: IrProgram,
    pub control: ControlFlow,
    pub data: DataFlow,
    pub entries: Vec<EntryBlock>,
    pub failures: Vec<EntryFailure>,
}

pub fn decompile(
    program: &Program,
    catalogue: &Catalogue,
    options: DecompileOptions,
) -> Result<Decompilation, DestackError> {
    let ir::IrBuild { program: mut ir, mut failures } =
        ir::build_ir(&program.listing, &program.variables, catalogue, &program.entries);

    let mut control = ctrl_flow::analyze(&ir, catalogue);
    let mut data = data_flow::analyze(&ir, &control, catalogue, &program.variables)?;

    if options.prune {
        let pruned = data_flow::eliminate_dead_code(&ir, &control, &data);
        tracing::debug!(before = ir.len(), after = pruned.len(), "pruned dead IR lines");
        ir = pruned;
        control = ctrl_flow::analyze(&ir, catalogue);
        data = data_flow::analyze(&ir, &control, catalogue, &program.variables)?;
    }

    let statements = stmt::translate(
        &ir,
        &control,
        &data,
        catalogue,
        &program.variables,
        options.inline,
    )?;

    let mut entries = Vec::new();
    for (line, name) in control.entries.iter().enumerate() {
        let Some(name) = name else { continue };
        match structure::structure_entry(line, &control, &statements, options.optimize) {
            Ok(mut block) => {
                if let Some(decl) = program.entries.iter().find(|e| e.name == block.name) {
                    block.params = decl.params.clone();
                }
                entries.push(block);
            }
            Err(error) => {
                tracing::warn!(entry = %name, %error, "structuring failed");
                failures.push(EntryFailure {
                    entry: name.clone(),
                    error,
                });
            }
        }
    }

    Ok(Decompilation {
        ir,
        control,
        data,
        entries,
        failures,
    })
}

pub fn decompile_with_options(
    program: &Program,
    catalogue: &Catalogue,
    options: DecompileOptions,
) -> Result<String, DestackError> {
    let out = decompile(program, catalogue, options)?;
    match options.mode {
        DecompileMode::Pseudo => Ok(render::pseudo(&out)),
        DecompileMode::Disasm => Ok(render::annotated_ir(&out, catalogue)),
        DecompileMode::Json => Ok(serde_json::to_string_pretty(&out)?),
    }
}

pub fn decompile_to_string(program: &Program, catalogue: &Catalogue) -> Result<String, DestackError> {
    decompile_with_options(program, catalogue, DecompileOptions::default())
}
