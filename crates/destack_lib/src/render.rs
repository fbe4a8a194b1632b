use crate::catalogue::Catalogue;
use crate::ctrl_flow::JumpType;
use crate::data_flow::PortDir;
use crate::ir::Op;
use crate::listing::format_address;
use crate::stmt::Stmt;
use crate::{Decompilation, EntryBlock};

fn stmts_to_string(stmts: &[Stmt], indent: usize) -> String {
    let mut out = String::new();
    let pad = " ".repeat(indent);
    for s in stmts {
        match s {
            Stmt::Assign { target, value } => out.push_str(&format!("{pad}{target} = {value};\n")),
            Stmt::Expr(e) => out.push_str(&format!("{pad}{e};\n")),
            Stmt::Store { place, value } => out.push_str(&format!("{pad}{place} = {value};\n")),
            Stmt::If {
                cond,
                then_body,
                else_body,
            } => {
                out.push_str(&format!("{pad}if ({cond}) {{\n"));
                out.push_str(&stmts_to_string(then_body, indent + 2));
                if else_body.is_empty() {
                    out.push_str(&format!("{pad}}}\n"));
                } else {
                    out.push_str(&format!("{pad}}} else {{\n"));
                    out.push_str(&stmts_to_string(else_body, indent + 2));
                    out.push_str(&format!("{pad}}}\n"));
                }
            }
            Stmt::Loop {
                init,
                cond,
                step,
                body,
            } => {
                if init.is_none() && step.is_none() {
                    match cond {
                        Some(c) => out.push_str(&format!("{pad}while ({c}) {{\n")),
                        None => out.push_str(&format!("{pad}while (true) {{\n")),
                    }
                } else {
                    let init = init.as_deref().map(inline_stmt).unwrap_or_default();
                    let cond = cond.as_ref().map(ToString::to_string).unwrap_or_default();
                    let step = step.as_deref().map(inline_stmt).unwrap_or_default();
                    out.push_str(&format!("{pad}for ({init}; {cond}; {step}) {{\n"));
                }
                out.push_str(&stmts_to_string(body, indent + 2));
                out.push_str(&format!("{pad}}}\n"));
            }
            Stmt::Break => out.push_str(&format!("{pad}break;\n")),
            Stmt::Continue => out.push_str(&format!("{pad}continue;\n")),
            Stmt::Return => out.push_str(&format!("{pad}return;\n")),
            Stmt::Goto(label) => out.push_str(&format!("{pad}goto {label};\n")),
            Stmt::Label(label) => out.push_str(&format!("{label}:\n")),
            Stmt::Call(entry) => out.push_str(&format!("{pad}{entry}();\n")),
            Stmt::Switch { table, index } => out.push_str(&format!("{pad}goto *{table}[{index}];\n")),
        }
    }
    out
}

/// Header-position form of a loop initializer or step.
fn inline_stmt(s: &Stmt) -> String {
    match s {
        Stmt::Assign { target, value } => format!("{target} = {value}"),
        Stmt::Expr(e) => e.to_string(),
        Stmt::Store { place, value } => format!("{place} = {value}"),
        other => stmts_to_string(std::slice::from_ref(other), 0).trim_end_matches([';', '\n']).to_string(),
    }
}

pub fn entry_to_string(block: &EntryBlock) -> String {
    let mut out = String::new();
    out.push_str(&format!("function {}({}) {{\n", block.name, block.params.join(", ")));
    out.push_str(&stmts_to_string(&block.body, 2));
    out.push_str("}\n");
    out
}

/// Brace-delimited pseudo-code, one function per entry.
pub fn pseudo(out: &Decompilation) -> String {
    let mut s = String::new();
    for block in &out.entries {
        if !s.is_empty() {
            s.push('\n');
        }
        s.push_str(&entry_to_string(block));
    }
    for failure in &out.failures {
        if !s.is_empty() {
            s.push('\n');
        }
        s.push_str(&format!("// {}: decompilation error: {}\n", failure.entry, failure.error));
    }
    s
}

fn jump_type_tag(t: JumpType) -> &'static str {
    match t {
        JumpType::None => "",
        JumpType::Loop => "loop",
        JumpType::If => "if",
        JumpType::Else => "else",
        JumpType::Break => "break",
        JumpType::Continue => "continue",
    }
}

/// One IR line per row with its control annotations and port counts.
pub fn annotated_ir(out: &Decompilation, catalogue: &Catalogue) -> String {
    let ir = &out.ir;
    let cf = &out.control;
    let df = &out.data;
    let mut s = String::new();
    for (line, ins) in ir.code.iter().enumerate() {
        if let Some(name) = &cf.entries[line] {
            let tag = if cf.entry_continue[line] { " (continuation)" } else { "" };
            s.push_str(&format!("{name}:{tag}\n"));
        }
        if let Some(label) = &cf.labels[line] {
            s.push_str(&format!("  {label}:\n"));
        }

        let target = if cf.is_branch_target(line) { '>' } else { ' ' };
        s.push_str(&format!("{target}{line:05} {} ", format_address(ins.address)));
        let body = match &ins.op {
            Op::Extern { primitive, args } => {
                let sig = catalogue
                    .get(*primitive)
                    .map(|d| d.signature.as_str())
                    .unwrap_or("?");
                format!("EXTERN   {sig} ({})", args.join(", "))
            }
            Op::Call { target } => format!("CALL     {}", format_address(*target)),
            Op::Jump { target, cond } => match cond {
                Some(c) => format!("JUMP     {} unless {c}", format_address(*target)),
                None => format!("JUMP     {}", format_address(*target)),
            },
            Op::Switch { table, index, targets } => {
                format!("SWITCH   {table}[{index}] ({} targets)", targets.len())
            }
            Op::Exit { cond: Some(c) } => format!("EXIT     unless {c}"),
            Op::Exit { cond: None } => "EXIT".to_string(),
            Op::Return => "RETURN".to_string(),
        };
        s.push_str(&format!("{body:<60}"));

        let mut notes = Vec::new();
        let tag = jump_type_tag(cf.jump_types[line]);
        if !tag.is_empty() {
            notes.push(tag.to_string());
        }
        if cf.loop_begin[line] > 0 {
            notes.push(format!("loop_begin={}", cf.loop_begin[line]));
        }
        if cf.choice_end[line] > 0 {
            notes.push(format!("choice_end={}", cf.choice_end[line]));
        }
        if !df.ports[line].is_empty() {
            let refs: Vec<String> = df.ports[line]
                .iter()
                .map(|p| {
                    if p.dir.contains(PortDir::WRITE) {
                        p.ref_count.to_string()
                    } else {
                        "-".to_string()
                    }
                })
                .collect();
            notes.push(format!("refs=[{}] stmt={}", refs.join(","), df.statements[line].ref_count));
        }
        if !df.is_live(line) {
            notes.push("dead".to_string());
        }
        if notes.is_empty() {
            s.push('\n');
        } else {
            s.push_str(&format!(" ; {}\n", notes.join(" ")));
        }
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalogue::BinOp;
    use crate::stmt::Expr;
    use crate::symbols::HeapValue;

    #[test]
    fn renders_nested_blocks_with_two_space_indent() {
        let block = EntryBlock {
            name: "_update".into(),
            params: vec![],
            line: 0,
            continuation: false,
            body: vec![
                Stmt::Loop {
                    init: None,
                    cond: Some(Expr::var("running")),
                    step: None,
                    body: vec![Stmt::If {
                        cond: Expr::var("done"),
                        then_body: vec![Stmt::Break],
                        else_body: vec![Stmt::assign("n", Expr::Const(HeapValue::Int(1)))],
                    }],
                },
                Stmt::Label("label_7".into()),
                Stmt::Call("_update_0".into()),
            ],
        };
        assert_eq!(
            entry_to_string(&block),
            "function _update() {\n  while (running) {\n    if (done) {\n      break;\n    } else {\n      n = 1;\n    }\n  }\nlabel_7:\n  _update_0();\n}\n"
        );
    }

    #[test]
    fn renders_counted_loop_header_and_event_parameters() {
        let i = || Expr::var("i");
        let one = || Expr::Const(HeapValue::Int(1));
        let block = EntryBlock {
            name: "_onPlayerJoined".into(),
            params: vec!["onPlayerJoinedPlayer".into()],
            line: 0,
            continuation: false,
            body: vec![Stmt::Loop {
                init: Some(Box::new(Stmt::assign("i", Expr::Const(HeapValue::Int(0))))),
                cond: Some(Expr::binary(BinOp::Lt, i(), Expr::var("n"))),
                step: Some(Box::new(Stmt::assign("i", Expr::binary(BinOp::Add, i(), one())))),
                body: vec![],
            }],
        };
        assert_eq!(
            entry_to_string(&block),
            "function _onPlayerJoined(onPlayerJoinedPlayer) {\n  for (i = 0; i < n; i = i + 1) {\n  }\n}\n"
        );
    }
}
