use std::fmt;

use serde::Serialize;

use crate::DestackError;
use crate::catalogue::{BinOp, Catalogue, ParamDir, PrimitiveDef, PrimitiveId, PrimitiveKind, UnOp};
use crate::ctrl_flow::{ControlFlow, JumpType};
use crate::data_flow::{DataFlow, PortDir, PortId, ReadSource};
use crate::ir::{IrProgram, Op, Opcode};
use crate::listing::format_address;
use crate::symbols::{HeapValue, VariableTable};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Expr {
    Var(String),
    Const(HeapValue),
    /// Static receiver
    Type(String),
    Not(Box<Expr>),
    Unary { op: UnOp, operand: Box<Expr> },
    Binary { op: BinOp, lhs: Box<Expr>, rhs: Box<Expr> },
    Cast { ty: String, value: Box<Expr> },
    Member { object: Box<Expr>, name: String },
    Index { object: Box<Expr>, indices: Vec<Expr> },
    New { ty: String, args: Vec<Expr> },
    NewArray { elem: String, len: Box<Expr> },
    /// `out` or `ref` argument
    ByRef { dir: ParamDir, value: Box<Expr> },
    Invoke { receiver: Box<Expr>, method: String, args: Vec<Expr> },
}

impl Expr {
    pub fn var(name: &str) -> Self {
        Expr::Var(name.to_string())
    }

    pub fn binary(op: BinOp, lhs: Expr, rhs: Expr) -> Self {
        Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    pub fn invoke(receiver: Expr, method: &str, args: Vec<Expr>) -> Self {
        Expr::Invoke {
            receiver: Box::new(receiver),
            method: method.to_string(),
            args,
        }
    }

    pub fn member(object: Expr, name: &str) -> Self {
        Expr::Member {
            object: Box::new(object),
            name: name.to_string(),
        }
    }

    /// Logical negation, folding constants and double negation.
    pub fn negate(self) -> Self {
        match self {
            Expr::Const(HeapValue::Bool(b)) => Expr::Const(HeapValue::Bool(!b)),
            Expr::Not(inner) => *inner,
            other => Expr::Not(Box::new(other)),
        }
    }

    pub fn as_var(&self) -> Option<&str> {
        match self {
            Expr::Var(name) => Some(name),
            _ => None,
        }
    }

    fn is_atom(&self) -> bool {
        !matches!(self, Expr::Binary { .. } | Expr::Cast { .. })
    }

    /// Binds tighter than member access.
    fn is_primary(&self) -> bool {
        matches!(
            self,
            Expr::Var(_)
                | Expr::Const(_)
                | Expr::Type(_)
                | Expr::Member { .. }
                | Expr::Index { .. }
                | Expr::New { .. }
                | Expr::Invoke { .. }
        )
    }
}

struct Operand<'a>(&'a Expr);

impl fmt::Display for Operand<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_atom() {
            write!(f, "{}", self.0)
        } else {
            write!(f, "({})", self.0)
        }
    }
}

struct Receiver<'a>(&'a Expr);

impl fmt::Display for Receiver<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_primary() {
            write!(f, "{}", self.0)
        } else {
            write!(f, "({})", self.0)
        }
    }
}

fn write_list(f: &mut fmt::Formatter<'_>, items: &[Expr]) -> fmt::Result {
    for (i, a) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{a}")?;
    }
    Ok(())
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Var(name) | Expr::Type(name) => f.write_str(name),
            Expr::Const(value) => write!(f, "{value}"),
            Expr::Not(inner) => write!(f, "!{}", Operand(inner)),
            Expr::Unary { op, operand } => write!(f, "{}{}", op.symbol(), Operand(operand)),
            Expr::Binary { op, lhs, rhs } => write!(f, "{} {} {}", Operand(lhs), op, Operand(rhs)),
            Expr::Cast { ty, value } => write!(f, "({ty}){}", Operand(value)),
            Expr::Member { object, name } => write!(f, "{}.{name}", Receiver(object)),
            Expr::Index { object, indices } => {
                write!(f, "{}[", Receiver(object))?;
                write_list(f, indices)?;
                f.write_str("]")
            }
            Expr::New { ty, args } => {
                write!(f, "new {ty}(")?;
                write_list(f, args)?;
                f.write_str(")")
            }
            Expr::NewArray { elem, len } => write!(f, "new {elem}[{len}]"),
            Expr::ByRef { dir, value } => match dir {
                ParamDir::Out => write!(f, "out {value}"),
                ParamDir::InOut => write!(f, "ref {value}"),
                ParamDir::In => write!(f, "{value}"),
            },
            Expr::Invoke { receiver, method, args } => {
                write!(f, "{}.{method}(", Receiver(receiver))?;
                write_list(f, args)?;
                f.write_str(")")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Stmt {
    Assign {
        target: String,
        value: Expr,
    },
    Expr(Expr),
    /// Write through a property or indexer
    Store {
        place: Expr,
        value: Expr,
    },
    If {
        cond: Expr,
        then_body: Vec<Stmt>,
        else_body: Vec<Stmt>,
    },
    Loop {
        init: Option<Box<Stmt>>,
        cond: Option<Expr>,
        step: Option<Box<Stmt>>,
        body: Vec<Stmt>,
    },
    Break,
    Continue,
    Return,
    Goto(String),
    Label(String),
    /// Invocation of another entry
    Call(String),
    Switch {
        table: Expr,
        index: Expr,
    },
}

impl Stmt {
    pub fn assign(target: &str, value: Expr) -> Self {
        Stmt::Assign {
            target: target.to_string(),
            value,
        }
    }

    pub fn if_then(cond: Expr, then_body: Vec<Stmt>) -> Self {
        Stmt::If {
            cond,
            then_body,
            else_body: Vec::new(),
        }
    }

    /// `body` under `taken`, or bare when the condition always holds.
    fn guarded(taken: Option<Expr>, body: Stmt) -> Self {
        match taken {
            Some(cond) => Stmt::if_then(cond, vec![body]),
            None => body,
        }
    }

    pub fn assigned(&self) -> Option<&str> {
        match self {
            Stmt::Assign { target, .. } => Some(target),
            _ => None,
        }
    }

    pub fn contains_continue(&self) -> bool {
        match self {
            Stmt::Continue => true,
            Stmt::If {
                then_body, else_body, ..
            } => then_body.iter().chain(else_body).any(Stmt::contains_continue),
            // a nested loop owns its continues
            _ => false,
        }
    }
}

/// A variable the host never lets change and whose value prints as a literal.
fn constant_value<'v>(name: &str, flow: &DataFlow, variables: &'v VariableTable) -> Option<&'v HeapValue> {
    if flow.is_mutable(name) {
        return None;
    }
    let var = variables.get(name)?;
    if var.is_volatile() {
        return None;
    }
    match var.value.as_ref()? {
        HeapValue::String(s) if s.contains('\n') => None,
        HeapValue::AddressTable(_) | HeapValue::Opaque(_) => None,
        value => Some(value),
    }
}

/// Target of an explicit conversion, the declared output type or the
/// signature's result type.
fn cast_type(def: &PrimitiveDef) -> String {
    match def.params.get(1) {
        Some(p) if !p.ty.is_empty() => p.ty.clone(),
        _ => def.result_type().to_string(),
    }
}

struct Translator<'a> {
    ir: &'a IrProgram,
    control: &'a ControlFlow,
    flow: &'a DataFlow,
    catalogue: &'a Catalogue,
    variables: &'a VariableTable,
    inline: bool,
    out: Vec<Option<Stmt>>,
}

impl Translator<'_> {
    fn substitute(&mut self, line: usize, exprs: &mut [Expr]) {
        let (ir, flow) = (self.ir, self.flow);
        for (i, name) in ir.code[line].operands().iter().enumerate() {
            if flow.read_source(line, i) != Some(ReadSource::Declaration) {
                continue;
            }
            if let Some(value) = constant_value(name, flow, self.variables) {
                exprs[i] = Expr::Const(value.clone());
            }
        }

        // fold single-use assignments that directly precede their reader
        let ports = &flow.ports[line];
        let mut i = exprs.len();
        let mut prev = line;
        while prev > 0 {
            prev -= 1;
            if ir.code[prev].opcode() != Opcode::Extern {
                break;
            }
            let Some(stmt) = &self.out[prev] else { continue };
            let Stmt::Assign { value, .. } = stmt else { break };
            if flow.output_ref_count(prev) != Some(1) {
                break;
            }
            let writer = PortId::operand(prev, flow.ports[prev].len() - 1);
            let mut found = false;
            while i > 0 && !found {
                i -= 1;
                if ports[i].dir == PortDir::READ && ports[i].source == Some(writer) {
                    exprs[i] = value.clone();
                    found = true;
                }
            }
            if !found {
                break;
            }
            self.out[prev] = None;
        }
    }

    /// Copies between differently typed variables read as a cast.
    fn copy_cast(&self, source: &str, target: &str, value: Expr) -> Expr {
        let (Some(from), Some(to)) = (self.variables.get(source), self.variables.get(target)) else {
            return value;
        };
        if from.ty.is_empty() || to.ty.is_empty() || from.ty == to.ty || to.ty == "SystemObject" {
            return value;
        }
        Expr::Cast {
            ty: to.ty.clone(),
            value: Box::new(value),
        }
    }

    fn translate_extern(
        &self,
        line: usize,
        primitive: PrimitiveId,
        args: &[String],
        mut exprs: Vec<Expr>,
    ) -> Result<Stmt, DestackError> {
        let def = self.catalogue.def(primitive)?;
        if args.len() != def.params.len() || args.is_empty() {
            return Err(DestackError::UnsupportedIdiom {
                address: self.ir.code[line].address,
                detail: format!("`{}` takes {} operands, got {}", def.signature, def.params.len(), args.len()),
            });
        }
        let ty = def.type_name();
        let last = args.len() - 1;
        let stmt = match def.kind {
            PrimitiveKind::Copy => {
                let value = exprs.swap_remove(0);
                Stmt::assign(&args[1], self.copy_cast(&args[0], &args[1], value))
            }
            PrimitiveKind::Binary(op) => {
                let rhs = exprs.swap_remove(1);
                let lhs = exprs.swap_remove(0);
                Stmt::assign(&args[2], Expr::binary(op, lhs, rhs))
            }
            PrimitiveKind::Unary(UnOp::Not) => Stmt::assign(&args[1], exprs.swap_remove(0).negate()),
            PrimitiveKind::Unary(op) => Stmt::assign(
                &args[1],
                Expr::Unary {
                    op,
                    operand: Box::new(exprs.swap_remove(0)),
                },
            ),
            PrimitiveKind::Cast { explicit } => {
                let value = exprs.swap_remove(0);
                if explicit {
                    Stmt::assign(
                        &args[1],
                        Expr::Cast {
                            ty: cast_type(def),
                            value: Box::new(value),
                        },
                    )
                } else {
                    Stmt::assign(&args[1], value)
                }
            }
            PrimitiveKind::Ctor => {
                exprs.truncate(last);
                let value = match ty.strip_suffix("Array") {
                    Some(elem) if exprs.len() == 1 => Expr::NewArray {
                        elem: elem.to_string(),
                        len: Box::new(exprs.swap_remove(0)),
                    },
                    _ => Expr::New {
                        ty: ty.to_string(),
                        args: exprs,
                    },
                };
                Stmt::assign(&args[last], value)
            }
            PrimitiveKind::Property { setter } => {
                let value = exprs.swap_remove(last);
                let object = if def.params.len() == 2 {
                    exprs.swap_remove(0)
                } else {
                    Expr::Type(ty.to_string())
                };
                let place = Expr::member(object, def.property_name());
                if setter {
                    Stmt::Store { place, value }
                } else {
                    Stmt::assign(&args[last], place)
                }
            }
            PrimitiveKind::ArrayGet | PrimitiveKind::IndexGet | PrimitiveKind::IndexSet => {
                let value = exprs.swap_remove(last);
                let first = &def.params[0];
                let object = if first.ty.is_empty() || first.ty == ty || first.name.as_deref() == Some("instance") {
                    exprs.remove(0)
                } else {
                    Expr::Type(ty.to_string())
                };
                let place = Expr::Index {
                    object: Box::new(object),
                    indices: exprs,
                };
                if def.kind == PrimitiveKind::IndexSet {
                    Stmt::Store { place, value }
                } else {
                    Stmt::assign(&args[last], place)
                }
            }
            PrimitiveKind::Invoke => {
                let returns = def.returns_value();
                if returns {
                    exprs.truncate(last);
                }
                let mut params = def.params.iter();
                let receiver = if def.has_instance() {
                    params.next();
                    exprs.remove(0)
                } else {
                    Expr::Type(ty.to_string())
                };
                let call_args = exprs
                    .into_iter()
                    .zip(params)
                    .map(|(value, p)| match p.dir {
                        ParamDir::In => value,
                        dir => Expr::ByRef {
                            dir,
                            value: Box::new(value),
                        },
                    })
                    .collect();
                let call = Expr::invoke(receiver, def.method_name(), call_args);
                if returns {
                    Stmt::assign(&args[last], call)
                } else {
                    Stmt::Expr(call)
                }
            }
        };
        Ok(match stmt {
            Stmt::Assign { value, .. } if self.flow.output_ref_count(line) == Some(0) => Stmt::Expr(value),
            other => other,
        })
    }

    fn translate_branch(&self, line: usize, cond: Option<Expr>) -> Option<Stmt> {
        let op = &self.ir.code[line].op;
        // condition under which control leaves the line
        let taken = cond.map(Expr::negate);
        match self.control.jump_types[line] {
            JumpType::Loop => taken.map(|t| Stmt::if_then(t.negate(), vec![Stmt::Break])),
            JumpType::If => {
                let cond = taken.map_or(Expr::Const(HeapValue::Bool(false)), Expr::negate);
                Some(Stmt::if_then(cond, Vec::new()))
            }
            JumpType::Else => None,
            JumpType::Break => Some(Stmt::guarded(taken, Stmt::Break)),
            JumpType::Continue => Some(Stmt::guarded(taken, Stmt::Continue)),
            JumpType::None => {
                let body = match op {
                    Op::Jump { target, .. } => match self.ir.target_line(*target) {
                        Some(t) => match &self.control.labels[t] {
                            Some(label) => Stmt::Goto(label.clone()),
                            None => Stmt::Goto(format!("label_{t}")),
                        },
                        None => Stmt::Return,
                    },
                    _ => Stmt::Return,
                };
                Some(Stmt::guarded(taken, body))
            }
        }
    }

    fn translate_line(&mut self, line: usize) -> Result<Option<Stmt>, DestackError> {
        if !self.flow.is_live(line) {
            return Ok(None);
        }
        let ir = self.ir;
        let ins = &ir.code[line];
        let mut exprs: Vec<Expr> = ins.operands().iter().map(|n| Expr::var(n)).collect();
        if self.inline && !exprs.is_empty() {
            self.substitute(line, &mut exprs);
        }
        let stmt = match &ins.op {
            Op::Extern { primitive, args } => Some(self.translate_extern(line, *primitive, args, exprs)?),
            Op::Jump { .. } | Op::Exit { .. } => self.translate_branch(line, exprs.into_iter().next()),
            Op::Return => self.translate_branch(line, None),
            Op::Call { target } => {
                let name = self
                    .ir
                    .target_line(*target)
                    .and_then(|t| self.control.entries[t].clone())
                    .unwrap_or_else(|| format_address(*target));
                Some(Stmt::Call(name))
            }
            Op::Switch { table, index, .. } => Some(Stmt::Switch {
                table: Expr::var(table),
                index: exprs.into_iter().next().unwrap_or_else(|| Expr::var(index)),
            }),
        };
        Ok(stmt)
    }
}

/// Translates every live IR line into a flat statement. Lines that merely
/// delimit structure, or whose value was folded into a later line, map to
/// `None`.
pub fn translate(
    ir: &IrProgram,
    control: &ControlFlow,
    flow: &DataFlow,
    catalogue: &Catalogue,
    variables: &VariableTable,
    inline: bool,
) -> Result<Vec<Option<Stmt>>, DestackError> {
    let mut t = Translator {
        ir,
        control,
        flow,
        catalogue,
        variables,
        inline,
        out: vec![None; ir.len()],
    };
    for line in 0..ir.len() {
        let stmt = t.translate_line(line)?;
        t.out[line] = stmt;
    }
    Ok(t.out)
}
