//! Loop and conditional recovery from jump-target arithmetic.
//!
//! `loop_begin[l]` counts loops whose header is line `l`; `choice_end[l]`
//! counts conditionals that close right before `l`. Every classification
//! nets these counters to zero over the span it covers, otherwise the jump
//! is left as `None` and its target receives a label.

use std::collections::BTreeSet;

use serde::Serialize;

use crate::catalogue::{Catalogue, PrimitiveId};
use crate::ir::{IrProgram, Op};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum JumpType {
    #[default]
    None,
    Loop,
    If,
    Else,
    Break,
    Continue,
}

#[derive(Debug, Clone, Serialize)]
pub struct ControlFlow {
    pub entries: Vec<Option<String>>,
    /// Synthetic entry reached by falling through from the previous one.
    pub entry_continue: Vec<bool>,
    pub jump_types: Vec<JumpType>,
    pub loop_begin: Vec<i32>,
    pub choice_end: Vec<i32>,
    pub labels: Vec<Option<String>>,
    pub branch_targets: BTreeSet<usize>,
}

impl ControlFlow {
    pub fn len(&self) -> usize {
        self.jump_types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jump_types.is_empty()
    }

    pub fn is_branch_target(&self, line: usize) -> bool {
        self.branch_targets.contains(&line)
    }
}

fn jump_target(ir: &IrProgram, line: usize) -> Option<usize> {
    match &ir.code[line].op {
        Op::Jump { target, .. } => ir.target_line(*target),
        _ => None,
    }
}

fn is_unconditional(ir: &IrProgram, line: usize) -> bool {
    matches!(ir.code[line].op, Op::Jump { cond: None, .. })
}

fn mark_entries(ir: &IrProgram, cf: &mut ControlFlow) {
    let n = ir.len();
    let mut synthetic = vec![false; n];
    for (name, line) in &ir.entries {
        match &cf.entries[*line] {
            Some(kept) => {
                tracing::warn!(line, %kept, dropped = %name, "entries share a line, keeping the first");
            }
            None => cf.entries[*line] = Some(name.clone()),
        }
    }
    for ins in &ir.code {
        if let Op::Call { target } = ins.op {
            if let Some(line) = ir.target_line(target) {
                if cf.entries[line].is_none() {
                    synthetic[line] = true;
                }
            }
        }
    }

    let mut group = String::from("Init");
    let mut next_id = 0;
    for line in 0..n {
        if synthetic[line] {
            cf.entries[line] = Some(format!("{group}_{next_id}"));
            cf.entry_continue[line] = true;
            next_id += 1;
        } else if let Some(name) = &cf.entries[line] {
            group = name.clone();
            next_id = 0;
        }
    }
}

fn locate_loops(ir: &IrProgram, cf: &mut ControlFlow) {
    for line in (0..ir.len()).rev() {
        let Some(target) = jump_target(ir, line) else { continue };
        if target > line {
            continue;
        }
        let mut level = 0;
        let mut i = line;
        while i > target && level >= 0 {
            level -= cf.loop_begin[i];
            i -= 1;
        }
        if level == 0 {
            cf.jump_types[line] = JumpType::Loop;
            cf.loop_begin[target] += 1;
        }
    }
}

fn locate_choices(ir: &IrProgram, cf: &mut ControlFlow) {
    for line in 0..ir.len() {
        let Some(target) = jump_target(ir, line) else { continue };
        if target <= line {
            continue;
        }
        let mut ty = JumpType::If;
        let mut level = 0;
        if line + 1 < target && cf.choice_end[line + 1] == 1 && is_unconditional(ir, line) {
            ty = JumpType::Else;
            level = 1;
        }
        let mut i = line + 1;
        while i < target && level >= 0 {
            level -= cf.choice_end[i];
            if level < 0 {
                break;
            }
            level += cf.loop_begin[i];
            if cf.jump_types[i] == JumpType::Loop {
                level -= 1;
            }
            i += 1;
        }
        if level == 0 {
            cf.jump_types[line] = ty;
            cf.choice_end[target] += 1;
            if ty == JumpType::Else {
                cf.choice_end[line + 1] -= 1;
            }
        }
    }
}

fn locate_breaks(ir: &IrProgram, cf: &mut ControlFlow) {
    let mut loops: Vec<usize> = Vec::new();
    for line in (0..ir.len()).rev() {
        if let Some(target) = jump_target(ir, line) {
            match cf.jump_types[line] {
                JumpType::Loop => loops.push(line),
                JumpType::None => {
                    if let Some(&loop_line) = loops.last() {
                        if target == loop_line + 1 {
                            cf.jump_types[line] = JumpType::Break;
                        } else if Some(target) == jump_target(ir, loop_line) {
                            cf.jump_types[line] = JumpType::Continue;
                        }
                    }
                }
                _ => {}
            }
        }
        for _ in 0..cf.loop_begin[line] {
            loops.pop();
        }
    }
}

fn mark_labels(ir: &IrProgram, cf: &mut ControlFlow) {
    for line in 0..ir.len() {
        let target = match &ir.code[line].op {
            Op::Jump { .. } if cf.jump_types[line] == JumpType::None => jump_target(ir, line),
            _ => None,
        };
        if let Some(target) = target {
            tracing::warn!(line, target, "unstructured jump left as goto");
            cf.labels[target].get_or_insert_with(|| format!("label_{target}"));
        }
        if let Op::Switch { targets, .. } = &ir.code[line].op {
            for &t in targets {
                if let Some(target) = ir.target_line(t) {
                    cf.labels[target].get_or_insert_with(|| format!("label_{target}"));
                }
            }
        }
    }
}

fn mark_branch_targets(ir: &IrProgram, catalogue: &Catalogue, cf: &mut ControlFlow) {
    let n = ir.len();
    for line in 0..n {
        if cf.entries[line].is_some() {
            cf.branch_targets.insert(line);
        }
        let falls_into_target = match &ir.code[line].op {
            Op::Call { target } => {
                if let Some(t) = ir.target_line(*target) {
                    cf.branch_targets.insert(t);
                }
                true
            }
            Op::Jump { target, .. } => {
                if let Some(t) = ir.target_line(*target) {
                    cf.branch_targets.insert(t);
                }
                false
            }
            Op::Switch { targets, .. } => {
                cf.branch_targets.extend(targets.iter().filter_map(|&t| ir.target_line(t)));
                false
            }
            Op::Extern { primitive, .. } => {
                *primitive != PrimitiveId::COPY && catalogue.get(*primitive).is_some_and(|d| d.has_effects())
            }
            Op::Exit { .. } | Op::Return => false,
        };
        if falls_into_target && line + 1 < n {
            cf.branch_targets.insert(line + 1);
        }
    }
}

/// Annotates every IR line in the fixed order entries, loops, choices,
/// breaks, labels, branch targets.
pub fn analyze(ir: &IrProgram, catalogue: &Catalogue) -> ControlFlow {
    let n = ir.len();
    let mut cf = ControlFlow {
        entries: vec![None; n],
        entry_continue: vec![false; n],
        jump_types: vec![JumpType::None; n],
        loop_begin: vec![0; n],
        choice_end: vec![0; n],
        labels: vec![None; n],
        branch_targets: BTreeSet::new(),
    };
    mark_entries(ir, &mut cf);
    locate_loops(ir, &mut cf);
    locate_choices(ir, &mut cf);
    locate_breaks(ir, &mut cf);
    mark_labels(ir, &mut cf);
    mark_branch_targets(ir, catalogue, &mut cf);

    tracing::debug!(
        lines = n,
        loops = cf.jump_types.iter().filter(|t| **t == JumpType::Loop).count(),
        labels = cf.labels.iter().flatten().count(),
        "control flow recovered"
    );
    cf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalogue::{Param, ParamDir};
    use crate::ir::Instruction;
    use crate::symbols::EntryDecl;

    fn addr(line: usize) -> u32 {
        line as u32 * 8
    }

    fn jump(to: usize, cond: bool) -> Op {
        Op::Jump {
            target: addr(to),
            cond: cond.then(|| "c".to_string()),
        }
    }

    fn nop() -> Op {
        Op::Extern {
            primitive: PrimitiveId::COPY,
            args: vec!["a".into(), "b".into()],
        }
    }

    /// `n` copy lines with the given jumps patched in, ending in a return.
    fn program(n: usize, jumps: &[(usize, Op)]) -> IrProgram {
        let mut ops: Vec<Op> = (0..n).map(|_| nop()).collect();
        ops[n - 1] = Op::Return;
        for (line, op) in jumps {
            ops[*line] = op.clone();
        }
        let code = ops
            .into_iter()
            .enumerate()
            .map(|(l, op)| Instruction::new(addr(l), op))
            .collect();
        IrProgram::from_instructions(code, &[EntryDecl::new("_start", 0)]).unwrap()
    }

    #[test]
    fn backward_jump_is_loop() {
        let ir = program(12, &[(10, jump(3, false))]);
        let cf = analyze(&ir, &Catalogue::new());
        assert_eq!(cf.jump_types[10], JumpType::Loop);
        assert_eq!(cf.loop_begin[3], 1);
        assert_eq!(cf.loop_begin.iter().sum::<i32>(), 1);
        assert!(cf.labels.iter().all(Option::is_none));
        assert!(cf.is_branch_target(3));
    }

    #[test]
    fn if_else_shape() {
        let ir = program(10, &[(5, jump(7, true)), (6, jump(9, false))]);
        let cf = analyze(&ir, &Catalogue::new());
        assert_eq!(cf.jump_types[5], JumpType::If);
        assert_eq!(cf.jump_types[6], JumpType::Else);
        assert_eq!(cf.choice_end[7], 0);
        assert_eq!(cf.choice_end[9], 1);
        assert!(cf.labels.iter().all(Option::is_none));
    }

    #[test]
    fn both_forward_to_same_line_are_nested_ifs() {
        let ir = program(10, &[(5, jump(9, true)), (6, jump(9, false))]);
        let cf = analyze(&ir, &Catalogue::new());
        assert_eq!(cf.jump_types[5], JumpType::If);
        assert_eq!(cf.jump_types[6], JumpType::If);
        assert_eq!(cf.choice_end[9], 2);
    }

    #[test]
    fn exit_from_loop_is_break() {
        let ir = program(10, &[(3, jump(9, true)), (8, jump(1, false))]);
        let cf = analyze(&ir, &Catalogue::new());
        assert_eq!(cf.jump_types[8], JumpType::Loop);
        assert_eq!(cf.jump_types[3], JumpType::Break);
        assert_eq!(cf.choice_end.iter().sum::<i32>(), 0);
        assert!(cf.labels.iter().all(Option::is_none));
    }

    #[test]
    fn shared_header_nests_loops() {
        let ir = program(10, &[(5, jump(1, true)), (8, jump(1, false))]);
        let cf = analyze(&ir, &Catalogue::new());
        assert_eq!(cf.jump_types[5], JumpType::Loop);
        assert_eq!(cf.jump_types[8], JumpType::Loop);
        assert_eq!(cf.loop_begin[1], 2);
    }

    #[test]
    fn crossing_edges_fall_back_to_labels() {
        // 2 -> 6 jumps into the middle of the loop 4..=8
        let ir = program(10, &[(2, jump(6, true)), (8, jump(4, false))]);
        let cf = analyze(&ir, &Catalogue::new());
        assert_eq!(cf.jump_types[8], JumpType::Loop);
        assert_eq!(cf.jump_types[2], JumpType::None);
        assert_eq!(cf.labels[6].as_deref(), Some("label_6"));
    }

    #[test]
    fn synthetic_entries_and_effect_targets() {
        let mut catalogue = Catalogue::new();
        let log = catalogue.insert(
            "UnityEngineDebug.__Log__SystemObject__SystemVoid",
            vec![Param::new(ParamDir::In, "SystemObject")],
            None,
        );
        let code = vec![
            Instruction::new(0, Op::Call { target: 16 }),
            Instruction::new(8, Op::Return),
            Instruction::new(
                16,
                Op::Extern {
                    primitive: log,
                    args: vec!["m".into()],
                },
            ),
            Instruction::new(24, Op::Return),
        ];
        let ir = IrProgram::from_instructions(code, &[EntryDecl::new("_start", 0)]).unwrap();
        let cf = analyze(&ir, &catalogue);
        assert_eq!(cf.entries[2].as_deref(), Some("_start_0"));
        assert!(cf.entry_continue[2]);
        assert!(!cf.entry_continue[0]);
        let targets: Vec<usize> = cf.branch_targets.iter().copied().collect();
        assert_eq!(targets, vec![0, 1, 2, 3]);
    }

    #[test]
    fn subroutines_before_any_entry_join_the_init_group() {
        let code = vec![
            Instruction::new(0, Op::Call { target: 8 }),
            Instruction::new(8, Op::Return),
            Instruction::new(16, Op::Return),
        ];
        let ir = IrProgram::from_instructions(code, &[EntryDecl::new("_start", 16)]).unwrap();
        let cf = analyze(&ir, &Catalogue::new());
        assert_eq!(cf.entries[1].as_deref(), Some("Init_0"));
        assert_eq!(cf.entries[2].as_deref(), Some("_start"));
    }

    #[test]
    fn entries_sharing_a_line_keep_the_first_name() {
        let code = vec![Instruction::new(0, Op::Return)];
        let ir = IrProgram::from_instructions(code, &[EntryDecl::new("_start", 0), EntryDecl::new("_update", 0)]).unwrap();
        let cf = analyze(&ir, &Catalogue::new());
        assert_eq!(cf.entries, vec![Some("_start".to_string())]);
    }
}
