use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::DestackError;

pub fn format_address(address: u32) -> String {
    format!("0x{address:08X}")
}

pub fn parse_address(s: &str) -> Option<u32> {
    let s = s.trim();
    let hex = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X"))?;
    u32::from_str_radix(hex, 16).ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RawOpcode {
    Nop,
    Push,
    Pop,
    JumpIfFalse,
    Jump,
    Extern,
    Annotation,
    JumpIndirect,
    Copy,
}

impl RawOpcode {
    pub fn from_mnemonic(s: &str) -> Option<Self> {
        match s {
            "NOP" => Some(RawOpcode::Nop),
            "PUSH" => Some(RawOpcode::Push),
            "POP" => Some(RawOpcode::Pop),
            "JUMP_IF_FALSE" => Some(RawOpcode::JumpIfFalse),
            "JUMP" => Some(RawOpcode::Jump),
            "EXTERN" => Some(RawOpcode::Extern),
            "ANNOTATION" => Some(RawOpcode::Annotation),
            "JUMP_INDIRECT" => Some(RawOpcode::JumpIndirect),
            "COPY" => Some(RawOpcode::Copy),
            _ => None,
        }
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            RawOpcode::Nop => "NOP",
            RawOpcode::Push => "PUSH",
            RawOpcode::Pop => "POP",
            RawOpcode::JumpIfFalse => "JUMP_IF_FALSE",
            RawOpcode::Jump => "JUMP",
            RawOpcode::Extern => "EXTERN",
            RawOpcode::Annotation => "ANNOTATION",
            RawOpcode::JumpIndirect => "JUMP_INDIRECT",
            RawOpcode::Copy => "COPY",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RawOperand {
    Address(u32),
    Signature(String),
    Symbol(String),
}

impl RawOperand {
    fn parse(s: &str) -> Self {
        let s = s.trim();
        if s.len() >= 2 && s.starts_with('"') && s.ends_with('"') {
            return RawOperand::Signature(s[1..s.len() - 1].to_string());
        }
        match parse_address(s) {
            Some(a) => RawOperand::Address(a),
            None => RawOperand::Symbol(s.to_string()),
        }
    }
}

impl fmt::Display for RawOperand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RawOperand::Address(a) => write!(f, "0x{a:08X}"),
            RawOperand::Signature(s) => write!(f, "\"{s}\""),
            RawOperand::Symbol(s) => write!(f, "{s}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawInstruction {
    pub address: u32,
    pub opcode: RawOpcode,
    pub operand: Option<RawOperand>,
}

impl fmt::Display for RawInstruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}: {}", self.address, self.opcode.mnemonic())?;
        if let Some(op) = &self.operand {
            write!(f, ", {op}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Listing {
    instructions: Vec<RawInstruction>,
    line_from_address: HashMap<u32, usize>,
}

impl Listing {
    /// Addresses must be unique and strictly increasing.
    pub fn new(instructions: Vec<RawInstruction>) -> Result<Self, DestackError> {
        let mut line_from_address = HashMap::with_capacity(instructions.len());
        let mut last: Option<u32> = None;
        for (line, ins) in instructions.iter().enumerate() {
            if line_from_address.insert(ins.address, line).is_some() {
                return Err(DestackError::DuplicateAddress(ins.address));
            }
            if last.is_some_and(|prev| prev > ins.address) {
                return Err(DestackError::UnorderedAddress(ins.address));
            }
            last = Some(ins.address);
        }
        Ok(Self {
            instructions,
            line_from_address,
        })
    }

    /// One instruction per line, `0xADDR: OPCODE[, OPERAND]`.
    pub fn parse(text: &str) -> Result<Self, DestackError> {
        let mut instructions = Vec::new();
        for (idx, raw) in text.lines().enumerate() {
            let l = raw.trim();
            if l.is_empty() {
                continue;
            }
            let malformed = || DestackError::MalformedListing {
                line: idx + 1,
                text: l.to_string(),
            };
            let (addr, rest) = l.split_once(':').ok_or_else(malformed)?;
            let address = parse_address(addr).ok_or_else(malformed)?;
            let (mnemonic, operand) = match rest.split_once(',') {
                Some((m, o)) => (m.trim(), Some(RawOperand::parse(o))),
                None => (rest.trim(), None),
            };
            let opcode = RawOpcode::from_mnemonic(mnemonic)
                .ok_or_else(|| DestackError::UnknownOpcode(mnemonic.to_string()))?;
            instructions.push(RawInstruction {
                address,
                opcode,
                operand,
            });
        }
        Self::new(instructions)
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    pub fn instructions(&self) -> &[RawInstruction] {
        &self.instructions
    }

    pub fn get(&self, line: usize) -> Option<&RawInstruction> {
        self.instructions.get(line)
    }

    pub fn line_of(&self, address: u32) -> Option<usize> {
        self.line_from_address.get(&address).copied()
    }
}
