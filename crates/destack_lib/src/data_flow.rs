//! Def-use port graph over IR operands.
//!
//! Reads are linked to their writer only inside straight-line regions.
//! Writers that may reach a read through control flow are parked in a
//! per-variable escape list; a read that stays unresolved pulls in the
//! whole list when liveness reaches it.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use bitflags::bitflags;
use serde::{Serialize, Serializer};

use crate::DestackError;
use crate::catalogue::{Catalogue, ParamDir};
use crate::ctrl_flow::ControlFlow;
use crate::ir::{Instruction, IrProgram, Op, Opcode};
use crate::symbols::VariableTable;

bitflags! {
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    /// Operand direction
    pub struct PortDir: u8 {
        const READ = 1;
        const WRITE = 2;
    }
}

impl From<ParamDir> for PortDir {
    fn from(dir: ParamDir) -> Self {
        let mut bits = PortDir::empty();
        if dir.reads() {
            bits |= PortDir::READ;
        }
        if dir.writes() {
            bits |= PortDir::WRITE;
        }
        bits
    }
}

fn serialize_dir<S: Serializer>(dir: &PortDir, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u8(dir.bits())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Slot {
    Statement,
    Operand(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PortId {
    pub line: usize,
    pub slot: Slot,
}

impl PortId {
    pub fn statement(line: usize) -> Self {
        Self {
            line,
            slot: Slot::Statement,
        }
    }

    pub fn operand(line: usize, index: usize) -> Self {
        Self {
            line,
            slot: Slot::Operand(index),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Port {
    #[serde(serialize_with = "serialize_dir")]
    pub dir: PortDir,
    /// Writer feeding this read when it is known exactly.
    pub source: Option<PortId>,
    pub ref_count: u32,
}

/// Where the value read by an operand comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ReadSource {
    Direct(PortId),
    /// Written somewhere, reachable only through control flow.
    Escaped,
    /// Never written: the host's initial value.
    Declaration,
}

#[derive(Debug, Clone, Serialize)]
pub struct DataFlow {
    pub statements: Vec<Port>,
    pub ports: Vec<Vec<Port>>,
    pub mutable_variables: BTreeSet<String>,
    #[serde(skip)]
    origins: Vec<Vec<Option<ReadSource>>>,
}

impl DataFlow {
    pub fn port(&self, id: PortId) -> Option<&Port> {
        match id.slot {
            Slot::Statement => self.statements.get(id.line),
            Slot::Operand(i) => self.ports.get(id.line)?.get(i),
        }
    }

    fn port_mut(&mut self, id: PortId) -> Option<&mut Port> {
        match id.slot {
            Slot::Statement => self.statements.get_mut(id.line),
            Slot::Operand(i) => self.ports.get_mut(id.line)?.get_mut(i),
        }
    }

    /// Lines without operands are structural and always kept.
    pub fn is_live(&self, line: usize) -> bool {
        self.ports[line].is_empty() || self.statements[line].ref_count > 0
    }

    /// Reference count of the line's trailing output operand.
    pub fn output_ref_count(&self, line: usize) -> Option<u32> {
        let last = self.ports.get(line)?.last()?;
        last.dir.contains(PortDir::WRITE).then_some(last.ref_count)
    }

    /// `None` when the slot does not read.
    pub fn read_source(&self, line: usize, index: usize) -> Option<ReadSource> {
        *self.origins.get(line)?.get(index)?
    }

    pub fn is_mutable(&self, name: &str) -> bool {
        self.mutable_variables.contains(name)
    }
}

fn directions(ins: &Instruction, catalogue: &Catalogue) -> Result<Vec<PortDir>, DestackError> {
    match &ins.op {
        Op::Extern { primitive, args } => {
            let def = catalogue.def(*primitive)?;
            Ok(def
                .params
                .iter()
                .map(|p| PortDir::from(p.dir))
                .chain(std::iter::repeat(PortDir::READ))
                .take(args.len())
                .collect())
        }
        _ => Ok(vec![PortDir::READ; ins.operands().len()]),
    }
}

/// Builds the port graph and propagates liveness from the observable
/// effects of the program.
pub fn analyze(
    ir: &IrProgram,
    control: &ControlFlow,
    catalogue: &Catalogue,
    variables: &VariableTable,
) -> Result<DataFlow, DestackError> {
    let n = ir.len();
    let mut flow = DataFlow {
        statements: vec![Port::default(); n],
        ports: Vec::with_capacity(n),
        mutable_variables: BTreeSet::new(),
        origins: Vec::with_capacity(n),
    };
    let mut queue: VecDeque<PortId> = VecDeque::new();
    let mut recent: HashMap<&str, (PortId, u32)> = HashMap::new();
    let mut escaped: HashMap<&str, Vec<PortId>> = HashMap::new();
    let mut epoch = 0u32;

    for (line, ins) in ir.code.iter().enumerate() {
        let operands = ins.operands();
        let mut ports: Vec<Port> = directions(ins, catalogue)?
            .into_iter()
            .map(|dir| Port {
                dir,
                ..Port::default()
            })
            .collect();

        if !operands.is_empty() {
            let root = match &ins.op {
                Op::Extern { primitive, .. } => catalogue.def(*primitive)?.has_effects(),
                _ => true,
            };
            if root {
                queue.push_back(PortId::statement(line));
            }
        }

        for (port, name) in ports.iter_mut().zip(operands) {
            if !port.dir.contains(PortDir::READ) {
                continue;
            }
            if let Some(&(writer, at)) = recent.get(name.as_str()) {
                if at == epoch {
                    port.source = Some(writer);
                }
            }
        }
        for (i, (port, name)) in ports.iter().zip(operands).enumerate() {
            if !port.dir.contains(PortDir::WRITE) {
                continue;
            }
            let name = name.as_str();
            if let Some(&(writer, at)) = recent.get(name) {
                if at < epoch {
                    escaped.entry(name).or_default().push(writer);
                }
            }
            recent.insert(name, (PortId::operand(line, i), epoch));
            flow.mutable_variables.insert(name.to_string());
            if variables.is_volatile(name) {
                queue.push_back(PortId::operand(line, i));
            }
        }
        flow.ports.push(ports);

        if ins.opcode() != Opcode::Extern {
            epoch += 1;
        }
        if control.is_branch_target(line + 1) || line + 1 == n {
            for (name, (writer, _)) in recent.drain() {
                escaped.entry(name).or_default().push(writer);
            }
        }
    }

    flow.mutable_variables
        .extend(variables.host_written().map(str::to_string));

    for (line, ins) in ir.code.iter().enumerate() {
        let origins = flow.ports[line]
            .iter()
            .zip(ins.operands())
            .map(|(port, name)| {
                if !port.dir.contains(PortDir::READ) {
                    None
                } else if let Some(src) = port.source {
                    Some(ReadSource::Direct(src))
                } else if flow.mutable_variables.contains(name) {
                    Some(ReadSource::Escaped)
                } else {
                    Some(ReadSource::Declaration)
                }
            })
            .collect();
        flow.origins.push(origins);
    }

    let mut visited: HashSet<PortId> = HashSet::new();
    while let Some(head) = queue.pop_front() {
        if let Some(port) = flow.port_mut(head) {
            port.ref_count += 1;
        }
        if !visited.insert(head) {
            continue;
        }
        match head.slot {
            Slot::Operand(_) => queue.push_back(PortId::statement(head.line)),
            Slot::Statement => {
                let operands = ir.code[head.line].operands();
                for (port, name) in flow.ports[head.line].iter().zip(operands) {
                    if !port.dir.contains(PortDir::READ) {
                        continue;
                    }
                    match port.source {
                        Some(src) => queue.push_back(src),
                        None => {
                            if let Some(writers) = escaped.remove(name.as_str()) {
                                queue.extend(writers);
                            }
                        }
                    }
                }
            }
        }
    }

    tracing::debug!(
        lines = n,
        live = (0..n).filter(|&l| flow.is_live(l)).count(),
        mutable = flow.mutable_variables.len(),
        "data flow analysed"
    );
    Ok(flow)
}

/// Drops every line whose statement is dead, keeping entry starts.
/// Addresses of removed lines move to the next kept line.
pub fn eliminate_dead_code(ir: &IrProgram, control: &ControlFlow, flow: &DataFlow) -> IrProgram {
    let n = ir.len();
    let keep: Vec<bool> = (0..n)
        .map(|l| flow.is_live(l) || control.entries[l].is_some())
        .collect();

    let kept = keep.iter().filter(|k| **k).count();
    let mut new_line = vec![kept; n + 1];
    let mut dense = kept;
    for line in (0..n).rev() {
        if keep[line] {
            dense -= 1;
        }
        new_line[line] = dense;
    }

    let line_from_address: BTreeMap<u32, usize> = ir
        .line_from_address
        .iter()
        .map(|(&address, &line)| (address, new_line[line.min(n)]))
        .collect();

    let mut code: Vec<Instruction> = ir
        .code
        .iter()
        .zip(&keep)
        .filter(|(_, k)| **k)
        .map(|(ins, _)| ins.clone())
        .collect();
    for ins in &mut code {
        if let Op::Jump { target, cond } = &mut ins.op {
            if line_from_address.get(&*target).is_none_or(|&l| l >= kept) {
                ins.op = Op::Exit { cond: cond.take() };
            }
        }
    }

    let entries = ir
        .entries
        .iter()
        .map(|(name, line)| (name.clone(), new_line[*line]))
        .collect();

    IrProgram::from_parts(code, line_from_address, entries)
}
