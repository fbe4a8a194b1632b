use std::mem;

use serde::Serialize;

use crate::DestackError;
use crate::catalogue::BinOp;
use crate::ctrl_flow::{ControlFlow, JumpType};
use crate::stmt::{Expr, Stmt};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntryBlock {
    pub name: String,
    /// Event parameters, filled in from the entry's declaration
    pub params: Vec<String>,
    pub line: usize,
    pub continuation: bool,
    pub body: Vec<Stmt>,
}

#[derive(Debug)]
enum ScopeKind {
    Root,
    Loop,
    Then { cond: Expr },
    Else { cond: Expr, then_body: Vec<Stmt> },
}

#[derive(Debug)]
struct Scope {
    kind: ScopeKind,
    body: Vec<Stmt>,
}

type ScopeId = usize;

struct ScopeArena {
    scopes: Vec<Option<Scope>>,
    stack: Vec<ScopeId>,
}

impl ScopeArena {
    fn new() -> Self {
        Self {
            scopes: vec![Some(Scope {
                kind: ScopeKind::Root,
                body: Vec::new(),
            })],
            stack: vec![0],
        }
    }

    fn depth(&self) -> usize {
        self.stack.len()
    }

    fn open(&mut self, kind: ScopeKind) -> ScopeId {
        let id = self.scopes.len();
        self.scopes.push(Some(Scope {
            kind,
            body: Vec::new(),
        }));
        self.stack.push(id);
        id
    }

    fn top(&mut self, line: usize) -> Result<&mut Scope, DestackError> {
        let id = *self.stack.last().ok_or_else(|| scope_error(line, "scope stack is empty"))?;
        self.scopes[id]
            .as_mut()
            .ok_or_else(|| scope_error(line, "innermost scope was already closed"))
    }

    fn push(&mut self, line: usize, stmt: Stmt) -> Result<(), DestackError> {
        self.top(line)?.body.push(stmt);
        Ok(())
    }

    fn close(&mut self, line: usize) -> Result<Scope, DestackError> {
        if self.stack.len() <= 1 {
            return Err(scope_error(line, "cannot close the entry's root scope"));
        }
        let id = self.stack.pop().ok_or_else(|| scope_error(line, "scope stack is empty"))?;
        self.scopes[id]
            .take()
            .ok_or_else(|| scope_error(line, "scope closed twice"))
    }

    fn into_root(mut self) -> Vec<Stmt> {
        self.scopes
            .first_mut()
            .and_then(Option::take)
            .map(|s| s.body)
            .unwrap_or_default()
    }
}

fn scope_error(line: usize, detail: &str) -> DestackError {
    DestackError::ScopeStack {
        line,
        detail: detail.to_string(),
    }
}

struct Builder {
    scopes: ScopeArena,
    optimize: bool,
}

impl Builder {
    fn close_conditional(&mut self, line: usize) -> Result<(), DestackError> {
        let scope = self.scopes.close(line)?;
        let stmt = match scope.kind {
            ScopeKind::Then { cond } => Stmt::If {
                cond,
                then_body: scope.body,
                else_body: Vec::new(),
            },
            ScopeKind::Else { cond, then_body } => Stmt::If {
                cond,
                then_body,
                else_body: scope.body,
            },
            _ => return Err(scope_error(line, "closing a conditional that is not innermost")),
        };
        let parent = &mut self.scopes.top(line)?.body;
        parent.push(stmt);
        if self.optimize {
            rewrite_conditional(parent);
        }
        Ok(())
    }

    fn close_loop(&mut self, line: usize) -> Result<(), DestackError> {
        let scope = self.scopes.close(line)?;
        let ScopeKind::Loop = scope.kind else {
            return Err(scope_error(line, "closing a loop that is not innermost"));
        };
        let parent = &mut self.scopes.top(line)?.body;
        parent.push(Stmt::Loop {
            init: None,
            cond: None,
            step: None,
            body: scope.body,
        });
        if self.optimize {
            rewrite_loop(parent);
        }
        Ok(())
    }

    fn open_else(&mut self, line: usize) -> Result<(), DestackError> {
        if !matches!(self.scopes.top(line)?.kind, ScopeKind::Then { .. }) {
            return Err(scope_error(line, "else without an open then-branch"));
        }
        let scope = self.scopes.close(line)?;
        if let ScopeKind::Then { cond } = scope.kind {
            self.scopes.open(ScopeKind::Else {
                cond,
                then_body: scope.body,
            });
        }
        Ok(())
    }

    fn close_any(&mut self, line: usize) -> Result<(), DestackError> {
        let is_loop = matches!(self.scopes.top(line)?.kind, ScopeKind::Loop);
        if is_loop {
            self.close_loop(line)
        } else {
            self.close_conditional(line)
        }
    }
}

/// Builds the block tree of the entry starting at `start`.
pub fn structure_entry(
    start: usize,
    control: &ControlFlow,
    statements: &[Option<Stmt>],
    optimize: bool,
) -> Result<EntryBlock, DestackError> {
    let name = control.entries[start]
        .clone()
        .ok_or_else(|| scope_error(start, "line does not start an entry"))?;
    let mut b = Builder {
        scopes: ScopeArena::new(),
        optimize,
    };

    let n = control.len();
    let mut line = start;
    while line < n && (line == start || control.entries[line].is_none()) {
        for _ in 0..control.choice_end[line].max(0) {
            b.close_conditional(line)?;
        }
        if let Some(label) = &control.labels[line] {
            b.scopes.push(line, Stmt::Label(label.clone()))?;
        }
        for _ in 0..control.loop_begin[line].max(0) {
            b.scopes.open(ScopeKind::Loop);
        }
        match control.jump_types[line] {
            JumpType::Loop => {
                if let Some(stmt) = &statements[line] {
                    b.scopes.push(line, stmt.clone())?;
                }
                b.close_loop(line)?;
            }
            JumpType::If => {
                let cond = match &statements[line] {
                    Some(Stmt::If { cond, .. }) => cond.clone(),
                    _ => return Err(scope_error(line, "conditional line carries no condition")),
                };
                b.scopes.open(ScopeKind::Then { cond });
            }
            JumpType::Else => b.open_else(line)?,
            _ => {
                if let Some(stmt) = &statements[line] {
                    b.scopes.push(line, stmt.clone())?;
                }
            }
        }
        line += 1;
    }

    if b.scopes.depth() > 1 {
        tracing::debug!(entry = %name, open = b.scopes.depth() - 1, "closing scopes left open at entry end");
    }
    while b.scopes.depth() > 1 {
        b.close_any(line)?;
    }

    let mut body = b.scopes.into_root();
    // falls through into a continuation entry unless it already returned
    if line < n && control.entry_continue[line] && body.last() != Some(&Stmt::Return) {
        if let Some(next) = &control.entries[line] {
            body.push(Stmt::Call(next.clone()));
        }
    }
    if body.last() == Some(&Stmt::Return) {
        body.pop();
    }

    Ok(EntryBlock {
        name,
        params: Vec::new(),
        line: start,
        continuation: control.entry_continue[start],
        body,
    })
}

/// `v = v && x` under `if (v)`, or `v = v || x` under `if (!v)`.
fn short_circuit(cond: &Expr, stmt: &Stmt) -> Option<(String, BinOp, Expr)> {
    let Stmt::Assign {
        target,
        value: Expr::Binary { op, lhs, rhs },
    } = stmt
    else {
        return None;
    };
    if lhs.as_var() != Some(target.as_str()) {
        return None;
    }
    let guarded = match op {
        BinOp::AndAlso => cond.as_var() == Some(target.as_str()),
        BinOp::OrElse => matches!(cond, Expr::Not(inner) if inner.as_var() == Some(target.as_str())),
        _ => false,
    };
    guarded.then(|| (target.clone(), *op, (**rhs).clone()))
}

fn rewrite_conditional(scope: &mut Vec<Stmt>) {
    let Some(Stmt::If {
        mut cond,
        mut then_body,
        mut else_body,
    }) = scope.pop()
    else {
        return;
    };
    if then_body.is_empty() {
        cond = cond.negate();
        mem::swap(&mut then_body, &mut else_body);
    }
    if then_body.len() == 1 && else_body.is_empty() {
        if let Some((target, op, rhs)) = short_circuit(&cond, &then_body[0]) {
            let lhs = match scope.last() {
                Some(Stmt::Assign { target: t, value }) if *t == target => {
                    let value = value.clone();
                    scope.pop();
                    value
                }
                _ => Expr::Var(target.clone()),
            };
            scope.push(Stmt::assign(&target, Expr::binary(op, lhs, rhs)));
            return;
        }
    }
    scope.push(Stmt::If {
        cond,
        then_body,
        else_body,
    });
}

fn rewrite_loop(scope: &mut Vec<Stmt>) {
    let Some(Stmt::Loop {
        mut init,
        mut cond,
        mut step,
        mut body,
    }) = scope.pop()
    else {
        return;
    };

    let leading_break = matches!(
        body.first(),
        Some(Stmt::If { then_body, else_body, .. })
            if then_body.as_slice() == [Stmt::Break] && else_body.is_empty()
    );
    if leading_break {
        if let Stmt::If { cond: exit, .. } = body.remove(0) {
            cond = Some(exit.negate());
        }
    }

    let counter = match &cond {
        Some(Expr::Binary { op, lhs, .. }) if op.is_comparison() => lhs.as_var().map(str::to_string),
        _ => None,
    };
    if let Some(counter) = counter {
        let has_continue = body.iter().any(Stmt::contains_continue);
        if !has_continue && body.last().and_then(Stmt::assigned) == Some(counter.as_str()) {
            step = body.pop().map(Box::new);
        }
        if scope.last().and_then(Stmt::assigned) == Some(counter.as_str()) {
            init = scope.pop().map(Box::new);
        }
    }

    scope.push(Stmt::Loop {
        init,
        cond,
        step,
        body,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbols::HeapValue;
    use std::collections::BTreeSet;

    fn control(n: usize) -> ControlFlow {
        let mut entries = vec![None; n];
        entries[0] = Some("_start".to_string());
        ControlFlow {
            entries,
            entry_continue: vec![false; n],
            jump_types: vec![JumpType::None; n],
            loop_begin: vec![0; n],
            choice_end: vec![0; n],
            labels: vec![None; n],
            branch_targets: BTreeSet::new(),
        }
    }

    fn call(name: &str) -> Stmt {
        Stmt::Expr(Expr::invoke(Expr::Type("Host".into()), name, Vec::new()))
    }

    fn int(v: i64) -> Expr {
        Expr::Const(HeapValue::Int(v))
    }

    #[test]
    fn builds_if_else() {
        // 0: if (c) { 1 } else { 3 } 4
        let mut cf = control(5);
        cf.jump_types[0] = JumpType::If;
        cf.jump_types[2] = JumpType::Else;
        cf.choice_end[4] = 1;
        let stmts = vec![
            Some(Stmt::if_then(Expr::var("c"), Vec::new())),
            Some(call("a")),
            None,
            Some(call("b")),
            Some(Stmt::Return),
        ];
        let block = structure_entry(0, &cf, &stmts, false).unwrap();
        assert_eq!(
            block.body,
            vec![Stmt::If {
                cond: Expr::var("c"),
                then_body: vec![call("a")],
                else_body: vec![call("b")],
            }]
        );
    }

    #[test]
    fn empty_then_branch_is_inverted() {
        let mut cf = control(4);
        cf.jump_types[0] = JumpType::If;
        cf.jump_types[1] = JumpType::Else;
        cf.choice_end[3] = 1;
        let stmts = vec![
            Some(Stmt::if_then(Expr::var("c"), Vec::new())),
            None,
            Some(call("b")),
            Some(Stmt::Return),
        ];
        let block = structure_entry(0, &cf, &stmts, true).unwrap();
        assert_eq!(
            block.body,
            vec![Stmt::if_then(Expr::Not(Box::new(Expr::var("c"))), vec![call("b")])]
        );
    }

    #[test]
    fn recovers_counted_loop() {
        // 0: i = 0; loop at 1 { if (!(i < 10)) break; f(); i = i + 1 } 5
        let mut cf = control(6);
        cf.loop_begin[1] = 1;
        cf.jump_types[1] = JumpType::Break;
        cf.jump_types[4] = JumpType::Loop;
        let test = Expr::binary(BinOp::Lt, Expr::var("i"), int(10));
        let stmts = vec![
            Some(Stmt::assign("i", int(0))),
            Some(Stmt::if_then(test.clone().negate(), vec![Stmt::Break])),
            Some(call("f")),
            Some(Stmt::assign("i", Expr::binary(BinOp::Add, Expr::var("i"), int(1)))),
            None,
            Some(Stmt::Return),
        ];
        let block = structure_entry(0, &cf, &stmts, true).unwrap();
        assert_eq!(
            block.body,
            vec![Stmt::Loop {
                init: Some(Box::new(Stmt::assign("i", int(0)))),
                cond: Some(test),
                step: Some(Box::new(Stmt::assign(
                    "i",
                    Expr::binary(BinOp::Add, Expr::var("i"), int(1))
                ))),
                body: vec![call("f")],
            }]
        );

        let plain = structure_entry(0, &cf, &stmts, false).unwrap();
        assert!(matches!(&plain.body[1], Stmt::Loop { cond: None, body, .. } if body.len() == 3));
    }

    #[test]
    fn loop_with_continue_keeps_its_step_in_the_body() {
        let mut cf = control(5);
        cf.loop_begin[0] = 1;
        cf.jump_types[3] = JumpType::Loop;
        let test = Expr::binary(BinOp::Lt, Expr::var("i"), int(3));
        let stmts = vec![
            Some(Stmt::if_then(test.clone().negate(), vec![Stmt::Break])),
            Some(Stmt::if_then(Expr::var("skip"), vec![Stmt::Continue])),
            Some(Stmt::assign("i", Expr::binary(BinOp::Add, Expr::var("i"), int(1)))),
            None,
            Some(Stmt::Return),
        ];
        let block = structure_entry(0, &cf, &stmts, true).unwrap();
        let Stmt::Loop { cond, step, body, .. } = &block.body[0] else {
            panic!("unexpected {:?}", block.body);
        };
        assert_eq!(cond.as_ref(), Some(&test));
        assert!(step.is_none());
        assert_eq!(body.len(), 2);
    }

    #[test]
    fn folds_short_circuit_assignment() {
        // v = a; if (v) { v = v && b }
        let mut cf = control(4);
        cf.jump_types[1] = JumpType::If;
        cf.choice_end[3] = 1;
        let stmts = vec![
            Some(Stmt::assign("v", Expr::var("a"))),
            Some(Stmt::if_then(Expr::var("v"), Vec::new())),
            Some(Stmt::assign(
                "v",
                Expr::binary(BinOp::AndAlso, Expr::var("v"), Expr::var("b")),
            )),
            Some(call("g")),
        ];
        let block = structure_entry(0, &cf, &stmts, true).unwrap();
        assert_eq!(
            block.body,
            vec![
                Stmt::assign("v", Expr::binary(BinOp::AndAlso, Expr::var("a"), Expr::var("b"))),
                call("g"),
            ]
        );
    }

    #[test]
    fn appends_continuation_call_and_drops_trailing_return() {
        let mut cf = control(4);
        cf.entries[2] = Some("_start_0".to_string());
        cf.entry_continue[2] = true;
        let stmts = vec![Some(call("f")), None, Some(call("g")), Some(Stmt::Return)];
        let first = structure_entry(0, &cf, &stmts, false).unwrap();
        assert_eq!(first.body, vec![call("f"), Stmt::Call("_start_0".into())]);
        let second = structure_entry(2, &cf, &stmts, false).unwrap();
        assert!(second.continuation);
        assert_eq!(second.body, vec![call("g")]);

        let returning = vec![Some(call("f")), Some(Stmt::Return), Some(call("g")), Some(Stmt::Return)];
        let first = structure_entry(0, &cf, &returning, false).unwrap();
        assert_eq!(first.body, vec![call("f")]);
    }

    #[test]
    fn else_without_then_is_an_error() {
        let mut cf = control(3);
        cf.jump_types[1] = JumpType::Else;
        let stmts = vec![Some(call("f")), None, Some(Stmt::Return)];
        assert!(matches!(
            structure_entry(0, &cf, &stmts, false),
            Err(DestackError::ScopeStack { line: 1, .. })
        ));
    }

    #[test]
    fn unbalanced_close_is_an_error() {
        let mut cf = control(3);
        cf.choice_end[1] = 1;
        let stmts = vec![Some(call("f")), Some(call("g")), Some(Stmt::Return)];
        assert!(matches!(
            structure_entry(0, &cf, &stmts, false),
            Err(DestackError::ScopeStack { line: 1, .. })
        ));
    }
}
