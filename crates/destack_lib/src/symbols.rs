use std::collections::{BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::DestackError;

/// Statically known heap value of a variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HeapValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Address(u32),
    AddressTable(Vec<u32>),
    Opaque(String),
}

impl HeapValue {
    pub fn as_address(&self) -> Option<u32> {
        match self {
            HeapValue::Address(a) => Some(*a),
            HeapValue::Int(v) => u32::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_address_table(&self) -> Option<&[u32]> {
        match self {
            HeapValue::AddressTable(t) => Some(t),
            _ => None,
        }
    }
}

impl fmt::Display for HeapValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeapValue::Null => write!(f, "null"),
            HeapValue::Bool(b) => write!(f, "{b}"),
            HeapValue::Int(v) => write!(f, "{v}"),
            HeapValue::Float(v) => write!(f, "{v:?}"),
            HeapValue::String(s) => write!(f, "{s:?}"),
            HeapValue::Address(a) => write!(f, "0x{a:08X}"),
            HeapValue::AddressTable(t) => write!(f, "<table:{}>", t.len()),
            HeapValue::Opaque(s) => write!(f, "<{s}>"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Interpolation {
    None,
    Linear,
    Smooth,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    pub address: u32,
    #[serde(default, rename = "type")]
    pub ty: String,
    #[serde(default)]
    pub value: Option<HeapValue>,
    #[serde(default)]
    pub exported: bool,
    #[serde(default)]
    pub replicated: Option<Interpolation>,
}

impl Variable {
    pub fn new(name: &str, address: u32, value: Option<HeapValue>) -> Self {
        Self {
            name: name.to_string(),
            address,
            ty: String::new(),
            value,
            exported: false,
            replicated: None,
        }
    }

    /// Visible to the host, so every write to it is observable.
    pub fn is_volatile(&self) -> bool {
        self.exported || self.replicated.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryDecl {
    pub name: String,
    pub address: u32,
    /// Variables the host fills before running an event handler
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<String>,
}

impl EntryDecl {
    pub fn new(name: &str, address: u32) -> Self {
        Self {
            name: name.to_string(),
            address,
            params: Vec::new(),
        }
    }

    pub fn with_params(mut self, params: &[&str]) -> Self {
        self.params = params.iter().map(|p| p.to_string()).collect();
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct VariableTable {
    vars: Vec<Variable>,
    by_name: HashMap<String, usize>,
    by_address: HashMap<u32, usize>,
    host_written: BTreeSet<String>,
}

impl VariableTable {
    pub fn new(vars: Vec<Variable>) -> Result<Self, DestackError> {
        let mut by_name = HashMap::with_capacity(vars.len());
        let mut by_address = HashMap::with_capacity(vars.len());
        for (i, v) in vars.iter().enumerate() {
            if by_name.insert(v.name.clone(), i).is_some() {
                return Err(DestackError::DuplicateVariable(v.name.clone()));
            }
            by_address.insert(v.address, i);
        }
        Ok(Self {
            vars,
            by_name,
            by_address,
            host_written: BTreeSet::new(),
        })
    }

    /// Marks variables the host writes behind the program's back, such as
    /// event parameters.
    pub fn mark_host_written<'a>(&mut self, names: impl IntoIterator<Item = &'a str>) {
        self.host_written.extend(names.into_iter().map(str::to_string));
    }

    pub fn host_written(&self) -> impl Iterator<Item = &str> {
        self.host_written.iter().map(String::as_str)
    }

    pub fn get(&self, name: &str) -> Option<&Variable> {
        self.by_name.get(name).map(|&i| &self.vars[i])
    }

    pub fn at_address(&self, address: u32) -> Option<&Variable> {
        self.by_address.get(&address).map(|&i| &self.vars[i])
    }

    pub fn lookup(&self, name: &str) -> Result<&Variable, DestackError> {
        self.get(name)
            .ok_or_else(|| DestackError::UnknownVariable(name.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Variable> {
        self.vars.iter()
    }

    pub fn is_volatile(&self, name: &str) -> bool {
        self.get(name).is_some_and(Variable::is_volatile)
    }

    /// The constant address held by `name`, used to spot pushed return addresses.
    pub fn constant_address(&self, name: &str) -> Option<u32> {
        self.get(name)?.value.as_ref()?.as_address()
    }
}

#[derive(Debug, Clone, Deserialize)]
struct SymbolsDoc {
    #[serde(default)]
    variables: Vec<Variable>,
    #[serde(default)]
    entries: Vec<EntryDecl>,
}

/// Loads the host's variable table and entry declarations from JSON.
pub fn load_symbols(text: &str) -> Result<(VariableTable, Vec<EntryDecl>), DestackError> {
    let doc: SymbolsDoc = serde_json::from_str(text)?;
    let mut vars = VariableTable::new(doc.variables)?;
    vars.mark_host_written(doc.entries.iter().flat_map(|e| e.params.iter().map(String::as_str)));
    Ok((vars, doc.entries))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_variables_and_entries() {
        let (vars, entries) = load_symbols(
            r#"{
                "variables": [
                    {"name": "score", "address": 3, "type": "SystemInt32",
                     "value": {"Int": 7}, "exported": true},
                    {"name": "__ret", "address": 4, "value": {"Address": 40}},
                    {"name": "pos", "address": 5, "replicated": "Linear"}
                ],
                "entries": [{"name": "_start", "address": 0}]
            }"#,
        )
        .unwrap();
        assert_eq!(entries, vec![EntryDecl::new("_start", 0)]);
        assert!(vars.is_volatile("score"));
        assert!(vars.is_volatile("pos"));
        assert!(!vars.is_volatile("__ret"));
        assert_eq!(vars.constant_address("__ret"), Some(40));
        assert_eq!(vars.at_address(3).unwrap().name, "score");
        assert!(matches!(vars.lookup("nope"), Err(DestackError::UnknownVariable(_))));
    }

    #[test]
    fn event_parameters_are_host_written() {
        let (vars, entries) = load_symbols(
            r#"{
                "variables": [{"name": "onPlayerJoinedPlayer", "address": 0}],
                "entries": [{"name": "_onPlayerJoined", "address": 0, "params": ["onPlayerJoinedPlayer"]}]
            }"#,
        )
        .unwrap();
        assert_eq!(entries[0], EntryDecl::new("_onPlayerJoined", 0).with_params(&["onPlayerJoinedPlayer"]));
        assert_eq!(vars.host_written().collect::<Vec<_>>(), vec!["onPlayerJoinedPlayer"]);
    }

    #[test]
    fn rejects_duplicate_names() {
        let vars = vec![Variable::new("a", 0, None), Variable::new("a", 1, None)];
        assert!(matches!(
            VariableTable::new(vars),
            Err(DestackError::DuplicateVariable(_))
        ));
    }
}
