use std::collections::BTreeMap;
use std::fmt;
use std::slice;

use serde::{Deserialize, Serialize};

use crate::catalogue::{Catalogue, PrimitiveId, PrimitiveKind};
use crate::listing::{Listing, RawInstruction, RawOpcode, RawOperand, format_address};
use crate::symbols::{EntryDecl, VariableTable};
use crate::{DestackError, EntryFailure};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Opcode {
    Extern,
    Call,
    Jump,
    Switch,
    Exit,
    Return,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    Extern {
        primitive: PrimitiveId,
        args: Vec<String>,
    },
    Call {
        target: u32,
    },
    /// Taken when `cond` is false, always when absent.
    Jump {
        target: u32,
        cond: Option<String>,
    },
    Switch {
        table: String,
        index: String,
        targets: Vec<u32>,
    },
    Exit {
        cond: Option<String>,
    },
    Return,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    pub address: u32,
    pub op: Op,
}

impl Instruction {
    pub fn new(address: u32, op: Op) -> Self {
        Self { address, op }
    }

    pub fn opcode(&self) -> Opcode {
        match self.op {
            Op::Extern { .. } => Opcode::Extern,
            Op::Call { .. } => Opcode::Call,
            Op::Jump { .. } => Opcode::Jump,
            Op::Switch { .. } => Opcode::Switch,
            Op::Exit { .. } => Opcode::Exit,
            Op::Return => Opcode::Return,
        }
    }

    /// Variable operands in slot order.
    pub fn operands(&self) -> &[String] {
        match &self.op {
            Op::Extern { args, .. } => args,
            Op::Jump { cond, .. } | Op::Exit { cond } => cond.as_slice(),
            Op::Switch { index, .. } => slice::from_ref(index),
            Op::Call { .. } | Op::Return => &[],
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}  {:?}", format_address(self.address), self.opcode())?;
        match &self.op {
            Op::Extern { primitive, args } => write!(f, " #{} ({})", primitive.0, args.join(", ")),
            Op::Call { target } => write!(f, " {}", format_address(*target)),
            Op::Jump { target, cond } => {
                write!(f, " {}", format_address(*target))?;
                match cond {
                    Some(c) => write!(f, " unless {c}"),
                    None => Ok(()),
                }
            }
            Op::Switch { table, index, .. } => write!(f, " {table}[{index}]"),
            Op::Exit { cond: Some(c) } => write!(f, " unless {c}"),
            Op::Exit { cond: None } | Op::Return => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IrProgram {
    pub code: Vec<Instruction>,
    /// Every raw address, mapped to the first IR line at or after it.
    pub line_from_address: BTreeMap<u32, usize>,
    pub entries: Vec<(String, usize)>,
}

impl IrProgram {
    pub(crate) fn from_parts(
        code: Vec<Instruction>,
        line_from_address: BTreeMap<u32, usize>,
        entries: Vec<(String, usize)>,
    ) -> Self {
        Self {
            code,
            line_from_address,
            entries,
        }
    }

    /// Builds a program from already translated lines. Addresses must be
    /// unique and each entry must name the address of one of the lines.
    pub fn from_instructions(code: Vec<Instruction>, entries: &[EntryDecl]) -> Result<Self, DestackError> {
        let mut line_from_address = BTreeMap::new();
        for (line, ins) in code.iter().enumerate() {
            if line_from_address.insert(ins.address, line).is_some() {
                return Err(DestackError::DuplicateAddress(ins.address));
            }
        }
        let entries = entries
            .iter()
            .map(|e| {
                line_from_address
                    .get(&e.address)
                    .map(|&line| (e.name.clone(), line))
                    .ok_or(DestackError::UnknownAddress(e.address))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::from_parts(code, line_from_address, entries))
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    pub fn line_of(&self, address: u32) -> Option<usize> {
        self.line_from_address.get(&address).copied()
    }

    /// Line a branch to `address` lands on, `None` when it leaves the code.
    pub fn target_line(&self, address: u32) -> Option<usize> {
        self.line_of(address).filter(|&l| l < self.code.len())
    }
}

/// Result of translating a listing: the IR plus every entry that had to
/// be abandoned.
#[derive(Debug)]
pub struct IrBuild {
    pub program: IrProgram,
    pub failures: Vec<EntryFailure>,
}

struct Builder<'a> {
    listing: &'a Listing,
    variables: &'a VariableTable,
    catalogue: &'a Catalogue,
    visited: Vec<bool>,
    translated: Vec<Option<Instruction>>,
}

type Stack = Vec<String>;

fn pop(stack: &mut Stack, address: u32) -> Result<String, DestackError> {
    stack.pop().ok_or(DestackError::StackUnderflow(address))
}

fn operand<'i>(ins: &'i RawInstruction) -> Result<&'i RawOperand, DestackError> {
    ins.operand.as_ref().ok_or(DestackError::MissingOperand {
        address: ins.address,
        opcode: ins.opcode.mnemonic(),
    })
}

fn address_operand(ins: &RawInstruction) -> Result<u32, DestackError> {
    match operand(ins)? {
        RawOperand::Address(a) => Ok(*a),
        other => Err(DestackError::UnsupportedIdiom {
            address: ins.address,
            detail: format!("expected an address operand, found {other}"),
        }),
    }
}

impl<'a> Builder<'a> {
    fn new(listing: &'a Listing, variables: &'a VariableTable, catalogue: &'a Catalogue) -> Self {
        Self {
            listing,
            variables,
            catalogue,
            visited: vec![false; listing.len()],
            translated: vec![None; listing.len()],
        }
    }

    fn variable_operand(&self, ins: &RawInstruction) -> Result<String, DestackError> {
        match operand(ins)? {
            RawOperand::Address(a) => self
                .variables
                .at_address(*a)
                .map(|v| v.name.clone())
                .ok_or(DestackError::UnknownVariableAddress(*a)),
            RawOperand::Symbol(s) | RawOperand::Signature(s) => Ok(self.variables.lookup(s)?.name.clone()),
        }
    }

    fn emit(&mut self, line: usize, address: u32, op: Op) {
        self.translated[line] = Some(Instruction::new(address, op));
    }

    /// Explores everything reachable from `start`. Lines touched are
    /// recorded so a failed entry can be rolled back.
    fn explore(&mut self, start: usize, touched: &mut Vec<usize>) -> Result<(), DestackError> {
        let mut work: Vec<(usize, Stack)> = vec![(start, Stack::new())];
        while let Some((line, stack)) = work.pop() {
            self.walk(line, stack, &mut work, touched)?;
        }
        Ok(())
    }

    fn walk(
        &mut self,
        mut line: usize,
        mut stack: Stack,
        work: &mut Vec<(usize, Stack)>,
        touched: &mut Vec<usize>,
    ) -> Result<(), DestackError> {
        let listing = self.listing;
        let mut prev: Option<usize> = None;
        while line < listing.len() && !self.visited[line] {
            self.visited[line] = true;
            touched.push(line);
            let ins = &listing.instructions()[line];
            let address = ins.address;
            let mut next = line + 1;

            match ins.opcode {
                RawOpcode::Nop | RawOpcode::Annotation => {}
                RawOpcode::Push => {
                    let name = self.variable_operand(ins)?;
                    stack.push(name);
                }
                RawOpcode::Pop => {
                    pop(&mut stack, address)?;
                }
                RawOpcode::Copy => {
                    let target = pop(&mut stack, address)?;
                    let source = pop(&mut stack, address)?;
                    if source != target {
                        let op = Op::Extern {
                            primitive: PrimitiveId::COPY,
                            args: vec![source, target],
                        };
                        self.emit(line, address, op);
                    }
                }
                RawOpcode::Extern => {
                    let signature = match operand(ins)? {
                        RawOperand::Signature(s) | RawOperand::Symbol(s) => s.as_str(),
                        RawOperand::Address(a) => {
                            return Err(DestackError::UnknownPrimitive(format_address(*a)));
                        }
                    };
                    let primitive = self.catalogue.resolve(signature)?;
                    let arity = self.catalogue.def(primitive)?.params.len();
                    if stack.len() < arity {
                        return Err(DestackError::StackUnderflow(address));
                    }
                    let args = stack.split_off(stack.len() - arity);
                    self.emit(line, address, Op::Extern { primitive, args });
                }
                RawOpcode::Jump => {
                    let target = address_operand(ins)?;
                    let is_call = match (listing.get(next), stack.last()) {
                        (Some(after), Some(top)) => self.variables.constant_address(top) == Some(after.address),
                        _ => false,
                    };
                    if is_call {
                        let callee = listing
                            .line_of(target)
                            .ok_or(DestackError::UnknownAddress(target))?;
                        self.emit(line, address, Op::Call { target });
                        work.push((callee, stack.clone()));
                        stack.pop();
                    } else {
                        match listing.line_of(target) {
                            None => {
                                self.emit(line, address, Op::Exit { cond: None });
                                return Ok(());
                            }
                            Some(t) if t == next => {}
                            Some(t) => {
                                self.emit(line, address, Op::Jump { target, cond: None });
                                next = t;
                            }
                        }
                    }
                }
                RawOpcode::JumpIfFalse => {
                    let target = address_operand(ins)?;
                    let cond = pop(&mut stack, address)?;
                    match listing.line_of(target) {
                        None => self.emit(line, address, Op::Exit { cond: Some(cond) }),
                        Some(t) if t == next => {}
                        Some(t) => {
                            self.emit(
                                line,
                                address,
                                Op::Jump {
                                    target,
                                    cond: Some(cond),
                                },
                            );
                            work.push((t, stack.clone()));
                        }
                    }
                }
                RawOpcode::JumpIndirect => {
                    let via = self.variable_operand(ins)?;
                    let op = self.indirect_jump(address, prev, &via, &stack, work)?;
                    if let Some(p) = prev {
                        self.translated[p] = None;
                    }
                    self.emit(line, address, op);
                    return Ok(());
                }
            }
            prev = Some(line);
            line = next;
        }
        Ok(())
    }

    /// Collapses the line feeding an indirect jump into a return or a
    /// computed branch.
    fn indirect_jump(
        &self,
        address: u32,
        prev: Option<usize>,
        via: &str,
        stack: &Stack,
        work: &mut Vec<(usize, Stack)>,
    ) -> Result<Op, DestackError> {
        let feeder = prev.and_then(|p| self.translated[p].as_ref()).and_then(|i| match &i.op {
            Op::Extern { primitive, args } if args.last().is_some_and(|a| a == via) => Some((*primitive, args)),
            _ => None,
        });
        let unsupported = |detail: String| DestackError::UnsupportedIdiom { address, detail };
        let Some((primitive, args)) = feeder else {
            return Err(unsupported(format!("indirect jump through `{via}` is not fed by a copy or table read")));
        };
        if primitive == PrimitiveId::COPY {
            return Ok(Op::Return);
        }
        let def = self.catalogue.def(primitive)?;
        if def.kind != PrimitiveKind::ArrayGet {
            return Err(unsupported(format!("indirect jump fed by `{}`", def.signature)));
        }
        let table = args[0].clone();
        let index = args[1].clone();
        let targets = self
            .variables
            .get(&table)
            .and_then(|v| v.value.as_ref())
            .and_then(|v| v.as_address_table())
            .ok_or_else(|| unsupported(format!("switch table `{table}` holds no address table")))?
            .to_vec();
        for &t in &targets {
            if let Some(l) = self.listing.line_of(t) {
                work.push((l, stack.clone()));
            }
        }
        Ok(Op::Switch { table, index, targets })
    }

    fn rollback(&mut self, touched: &[usize]) {
        for &line in touched {
            self.visited[line] = false;
            self.translated[line] = None;
        }
    }

    fn compact(self, entries: Vec<(String, u32)>) -> IrProgram {
        let count = self.translated.iter().filter(|t| t.is_some()).count();
        let mut line_map = vec![0; self.translated.len()];
        let mut dense = count;
        for line in (0..self.translated.len()).rev() {
            if self.translated[line].is_some() {
                dense -= 1;
            }
            line_map[line] = dense;
        }

        let line_from_address: BTreeMap<u32, usize> = self
            .listing
            .instructions()
            .iter()
            .enumerate()
            .map(|(line, ins)| (ins.address, line_map[line]))
            .collect();

        let mut code: Vec<Instruction> = self.translated.into_iter().flatten().collect();
        for ins in &mut code {
            if let Op::Jump { target, cond } = &mut ins.op {
                if line_from_address.get(&*target).is_none_or(|&l| l >= count) {
                    ins.op = Op::Exit { cond: cond.take() };
                }
            }
        }

        let entries = entries
            .into_iter()
            .filter_map(|(name, address)| match line_from_address.get(&address) {
                Some(&line) if line < count => Some((name, line)),
                _ => {
                    tracing::debug!(entry = %name, "entry translates to no code");
                    None
                }
            })
            .collect();

        IrProgram::from_parts(code, line_from_address, entries)
    }
}

/// Translates every declared entry and everything reachable from it.
pub fn build_ir(
    listing: &Listing,
    variables: &VariableTable,
    catalogue: &Catalogue,
    entries: &[EntryDecl],
) -> IrBuild {
    let mut builder = Builder::new(listing, variables, catalogue);
    let mut failures = Vec::new();
    let mut named = Vec::new();

    for decl in entries {
        let Some(start) = listing.line_of(decl.address) else {
            tracing::warn!(entry = %decl.name, address = %format_address(decl.address), "entry outside listing");
            failures.push(EntryFailure {
                entry: decl.name.clone(),
                error: DestackError::UnknownAddress(decl.address),
            });
            continue;
        };
        let mut touched = Vec::new();
        match builder.explore(start, &mut touched) {
            Ok(()) => named.push((decl.name.clone(), decl.address)),
            Err(error) => {
                tracing::warn!(entry = %decl.name, %error, "abandoning entry");
                builder.rollback(&touched);
                failures.push(EntryFailure {
                    entry: decl.name.clone(),
                    error,
                });
            }
        }
    }

    let program = builder.compact(named);
    tracing::debug!(raw = listing.len(), lines = program.len(), "built IR");
    IrBuild { program, failures }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalogue::{Param, ParamDir};
    use crate::symbols::{HeapValue, Variable};

    const LOG: &str = "UnityEngineDebug.__Log__SystemObject__SystemVoid";
    const GET: &str = "SystemUInt32Array.__Get__SystemInt32__SystemUInt32";

    fn catalogue() -> Catalogue {
        let mut c = Catalogue::new();
        c.insert(LOG, vec![Param::new(ParamDir::In, "SystemObject")], None);
        c.insert(
            GET,
            vec![
                Param::new(ParamDir::In, "SystemUInt32Array"),
                Param::new(ParamDir::In, "SystemInt32"),
                Param::new(ParamDir::Out, "SystemUInt32"),
            ],
            None,
        );
        c
    }

    fn variables(extra: Vec<Variable>) -> VariableTable {
        let mut vars = vec![
            Variable::new("halt", 0, Some(HeapValue::Address(0xFFFF_FFFC))),
            Variable::new("msg", 1, Some(HeapValue::String("hi".into()))),
            Variable::new("ret", 2, None),
            Variable::new("flag", 3, Some(HeapValue::Bool(true))),
        ];
        vars.extend(extra);
        VariableTable::new(vars).unwrap()
    }

    fn build(text: &str, vars: &VariableTable, entries: &[EntryDecl]) -> IrBuild {
        let listing = Listing::parse(text).unwrap();
        build_ir(&listing, vars, &catalogue(), entries)
    }

    fn ops(ir: &IrProgram) -> Vec<Opcode> {
        ir.code.iter().map(Instruction::opcode).collect()
    }

    #[test]
    fn recognises_call_and_return() {
        let vars = variables(vec![Variable::new("back", 4, Some(HeapValue::Address(0x14)))]);
        let out = build(
            "0x00: PUSH, halt\n\
             0x04: PUSH, msg\n\
             0x08: EXTERN, \"UnityEngineDebug.__Log__SystemObject__SystemVoid\"\n\
             0x0C: PUSH, back\n\
             0x10: JUMP, 0x20\n\
             0x14: PUSH, ret\n\
             0x18: COPY\n\
             0x1C: JUMP_INDIRECT, ret\n\
             0x20: PUSH, msg\n\
             0x24: EXTERN, \"UnityEngineDebug.__Log__SystemObject__SystemVoid\"\n\
             0x28: PUSH, ret\n\
             0x2C: COPY\n\
             0x30: JUMP_INDIRECT, ret\n",
            &vars,
            &[EntryDecl::new("_start", 0)],
        );
        assert!(out.failures.is_empty());
        let ir = out.program;
        assert_eq!(
            ops(&ir),
            vec![Opcode::Extern, Opcode::Call, Opcode::Return, Opcode::Extern, Opcode::Return]
        );
        assert_eq!(ir.code[1].op, Op::Call { target: 0x20 });
        assert_eq!(ir.target_line(0x20), Some(3));
        // the removed copy maps onto the return that replaced it
        assert_eq!(ir.line_of(0x18), Some(2));
        assert_eq!(ir.entries, vec![("_start".to_string(), 0)]);
    }

    #[test]
    fn forward_branches_and_exits() {
        let vars = variables(vec![]);
        let out = build(
            "0x00: PUSH, flag\n\
             0x04: JUMP_IF_FALSE, 0x14\n\
             0x08: PUSH, msg\n\
             0x0C: EXTERN, \"UnityEngineDebug.__Log__SystemObject__SystemVoid\"\n\
             0x10: JUMP, 0x14\n\
             0x14: PUSH, flag\n\
             0x18: JUMP_IF_FALSE, 0xFFFFFFFC\n\
             0x1C: JUMP, 0xFFFFFFFC\n",
            &vars,
            &[EntryDecl::new("_start", 0)],
        );
        let ir = out.program;
        assert_eq!(ops(&ir), vec![Opcode::Jump, Opcode::Extern, Opcode::Exit, Opcode::Exit]);
        assert_eq!(
            ir.code[0].op,
            Op::Jump {
                target: 0x14,
                cond: Some("flag".into())
            }
        );
        assert_eq!(ir.code[2].op, Op::Exit { cond: Some("flag".into()) });
        assert_eq!(ir.code[3].op, Op::Exit { cond: None });
        assert_eq!(ir.code[0].operands(), ["flag".to_string()]);
    }

    #[test]
    fn recognises_switch_tables() {
        let vars = variables(vec![
            Variable::new("table", 4, Some(HeapValue::AddressTable(vec![0x18, 0x20]))),
            Variable::new("idx", 5, Some(HeapValue::Int(0))),
            Variable::new("dest", 6, None),
        ]);
        let out = build(
            "0x00: PUSH, table\n\
             0x04: PUSH, idx\n\
             0x08: PUSH, dest\n\
             0x0C: EXTERN, \"SystemUInt32Array.__Get__SystemInt32__SystemUInt32\"\n\
             0x10: JUMP_INDIRECT, dest\n\
             0x14: NOP\n\
             0x18: PUSH, msg\n\
             0x1C: EXTERN, \"UnityEngineDebug.__Log__SystemObject__SystemVoid\"\n\
             0x20: JUMP, 0xFFFFFFFC\n",
            &vars,
            &[EntryDecl::new("_start", 0)],
        );
        assert!(out.failures.is_empty());
        let ir = out.program;
        assert_eq!(ops(&ir), vec![Opcode::Switch, Opcode::Extern, Opcode::Exit]);
        match &ir.code[0].op {
            Op::Switch { table, index, targets } => {
                assert_eq!(table, "table");
                assert_eq!(index, "idx");
                assert_eq!(targets, &vec![0x18, 0x20]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn failed_entry_is_rolled_back() {
        let vars = variables(vec![]);
        let out = build(
            "0x00: PUSH, msg\n\
             0x04: EXTERN, \"UnityEngineDebug.__Log__SystemObject__SystemVoid\"\n\
             0x08: JUMP, 0xFFFFFFFC\n\
             0x0C: PUSH, msg\n\
             0x10: EXTERN, \"UnityEngineDebug.__Log__SystemObject__SystemVoid\"\n\
             0x14: JUMP_INDIRECT, msg\n",
            &vars,
            &[EntryDecl::new("_ok", 0), EntryDecl::new("_bad", 0x0C)],
        );
        assert_eq!(out.failures.len(), 1);
        assert_eq!(out.failures[0].entry, "_bad");
        assert!(matches!(out.failures[0].error, DestackError::UnsupportedIdiom { .. }));
        assert_eq!(ops(&out.program), vec![Opcode::Extern, Opcode::Exit]);
        assert_eq!(out.program.entries, vec![("_ok".to_string(), 0)]);
    }

    #[test]
    fn unknown_primitive_fails_entry() {
        let vars = variables(vec![]);
        let out = build(
            "0x00: EXTERN, \"SystemMath.__Frob__SystemVoid\"\n",
            &vars,
            &[EntryDecl::new("_start", 0)],
        );
        assert!(matches!(out.failures[0].error, DestackError::UnknownPrimitive(_)));
        assert!(out.program.is_empty());
    }
}
