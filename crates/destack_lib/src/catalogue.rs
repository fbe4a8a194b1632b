use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::DestackError;

/// Signature of the reserved primitive that stands for a raw `COPY`.
pub const COPY_SIGNATURE: &str = "copy";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PrimitiveId(pub u32);

impl PrimitiveId {
    pub const COPY: PrimitiveId = PrimitiveId(0);

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParamDir {
    In,
    Out,
    InOut,
}

impl ParamDir {
    pub fn reads(self) -> bool {
        self != ParamDir::Out
    }

    pub fn writes(self) -> bool {
        self != ParamDir::In
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Param {
    #[serde(default)]
    pub name: Option<String>,
    pub dir: ParamDir,
    #[serde(default, rename = "type")]
    pub ty: String,
}

impl Param {
    pub fn new(dir: ParamDir, ty: &str) -> Self {
        Self {
            name: None,
            dir,
            ty: ty.to_string(),
        }
    }

    pub fn named(name: &str, dir: ParamDir, ty: &str) -> Self {
        Self {
            name: Some(name.to_string()),
            ..Self::new(dir, ty)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    AndAlso,
    OrElse,
    BitAnd,
    BitOr,
    Xor,
    Shl,
    Shr,
}

impl BinOp {
    fn from_method(name: &str) -> Option<Self> {
        let op = match name {
            "op_Addition" => BinOp::Add,
            "op_Subtraction" => BinOp::Sub,
            "op_Multiply" | "op_Multiplication" => BinOp::Mul,
            "op_Division" => BinOp::Div,
            "op_Modulus" | "op_Remainder" => BinOp::Rem,
            "op_Equality" => BinOp::Eq,
            "op_Inequality" => BinOp::Ne,
            "op_LessThan" => BinOp::Lt,
            "op_GreaterThan" => BinOp::Gt,
            "op_LessThanOrEqual" => BinOp::Le,
            "op_GreaterThanOrEqual" => BinOp::Ge,
            "op_ConditionalAnd" => BinOp::AndAlso,
            "op_ConditionalOr" => BinOp::OrElse,
            "op_LogicalAnd" => BinOp::BitAnd,
            "op_LogicalOr" => BinOp::BitOr,
            "op_LogicalXor" => BinOp::Xor,
            "op_LeftShift" => BinOp::Shl,
            "op_RightShift" => BinOp::Shr,
            _ => return None,
        };
        Some(op)
    }

    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Rem => "%",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Lt => "<",
            BinOp::Gt => ">",
            BinOp::Le => "<=",
            BinOp::Ge => ">=",
            BinOp::AndAlso => "&&",
            BinOp::OrElse => "||",
            BinOp::BitAnd => "&",
            BinOp::BitOr => "|",
            BinOp::Xor => "^",
            BinOp::Shl => "<<",
            BinOp::Shr => ">>",
        }
    }

    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Gt | BinOp::Le | BinOp::Ge
        )
    }
}

impl fmt::Display for BinOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnOp {
    Not,
    Neg,
    Plus,
}

impl UnOp {
    fn from_method(name: &str) -> Option<Self> {
        match name {
            "op_UnaryNegation" => Some(UnOp::Not),
            "op_UnaryMinus" => Some(UnOp::Neg),
            "op_UnaryPlus" => Some(UnOp::Plus),
            _ => None,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            UnOp::Not => "!",
            UnOp::Neg => "-",
            UnOp::Plus => "+",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrimitiveKind {
    Copy,
    Binary(BinOp),
    Unary(UnOp),
    /// `op_Implicit`, or `op_Explicit` when `explicit`
    Cast { explicit: bool },
    /// `__ctor__`, array constructors take the length
    Ctor,
    /// `get_Name` or `set_Name`
    Property { setter: bool },
    /// `<Elem>Array.__Get__SystemInt32__<Elem>`
    ArrayGet,
    /// `get_Item` on a non-array type
    IndexGet,
    /// `<Elem>Array.__Set__...` or `set_Item`
    IndexSet,
    Invoke,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrimitiveDef {
    pub signature: String,
    pub params: Vec<Param>,
    pub pure: bool,
    pub kind: PrimitiveKind,
}

impl PrimitiveDef {
    /// Declaring type, the part before the first `.`.
    pub fn type_name(&self) -> &str {
        match self.signature.split_once('.') {
            Some((ty, _)) => ty,
            None => "",
        }
    }

    /// Method name, the first `__`-delimited segment after the type.
    pub fn method_name(&self) -> &str {
        method_name(&self.signature)
    }

    /// True when running the primitive can be observed outside the program.
    pub fn has_effects(&self) -> bool {
        !self.pure && self.kind != PrimitiveKind::Copy
    }

    /// Property name of a `get_`/`set_` accessor.
    pub fn property_name(&self) -> &str {
        let name = self.method_name();
        name.strip_prefix("get_")
            .or_else(|| name.strip_prefix("set_"))
            .unwrap_or(name)
    }

    /// Type produced by the primitive, the last `__` segment of the signature.
    pub fn result_type(&self) -> &str {
        self.signature.rsplit("__").next().unwrap_or("")
    }

    /// The trailing unnamed (or generic `T`) out parameter is the call's value;
    /// any other out parameter is passed by reference.
    pub fn returns_value(&self) -> bool {
        self.params.last().is_some_and(|p| {
            p.dir == ParamDir::Out && matches!(p.name.as_deref(), None | Some("T") | Some("T[]"))
        })
    }

    /// First parameter is the receiver of an instance method.
    pub fn has_instance(&self) -> bool {
        self.params
            .first()
            .is_some_and(|p| p.dir == ParamDir::In && p.name.as_deref() == Some("instance"))
    }
}

fn method_name(signature: &str) -> &str {
    let rest = match signature.split_once('.') {
        Some((_, rest)) => rest,
        None => signature,
    };
    let rest = rest.strip_prefix("__").unwrap_or(rest);
    match rest.split_once("__") {
        Some((name, _)) => name,
        None => rest,
    }
}

fn classify(signature: &str, params: &[Param]) -> PrimitiveKind {
    if signature == COPY_SIGNATURE {
        return PrimitiveKind::Copy;
    }
    let name = method_name(signature);
    let ty = signature.split_once('.').map(|(t, _)| t).unwrap_or("");
    if let Some(op) = BinOp::from_method(name) {
        if params.len() == 3 {
            return PrimitiveKind::Binary(op);
        }
    }
    if let Some(op) = UnOp::from_method(name) {
        if params.len() == 2 {
            return PrimitiveKind::Unary(op);
        }
    }
    match name {
        "op_Implicit" | "op_Explicit" if params.len() == 2 => {
            return PrimitiveKind::Cast {
                explicit: name == "op_Explicit",
            };
        }
        "ctor" if !params.is_empty() => return PrimitiveKind::Ctor,
        _ => {}
    }
    let is_array = ty.ends_with("Array");
    if is_array && name == "Get" && params.len() == 3 {
        return PrimitiveKind::ArrayGet;
    }
    if params.len() >= 2 {
        if (is_array && name == "Set") || (!is_array && name == "set_Item") {
            return PrimitiveKind::IndexSet;
        }
        if !is_array && name == "get_Item" {
            return PrimitiveKind::IndexGet;
        }
    }
    if !params.is_empty() && params.len() <= 2 {
        if name.starts_with("get_") {
            return PrimitiveKind::Property { setter: false };
        }
        if name.starts_with("set_") {
            return PrimitiveKind::Property { setter: true };
        }
    }
    PrimitiveKind::Invoke
}

#[derive(Debug, Clone, Deserialize)]
struct PrimitiveEntry {
    signature: String,
    #[serde(default)]
    params: Vec<Param>,
    #[serde(default)]
    pure: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
struct CatalogueDoc {
    primitives: Vec<PrimitiveEntry>,
}

#[derive(Debug, Clone)]
pub struct Catalogue {
    defs: Vec<PrimitiveDef>,
    by_signature: HashMap<String, PrimitiveId>,
}

impl Default for Catalogue {
    fn default() -> Self {
        Self::new()
    }
}

impl Catalogue {
    pub fn new() -> Self {
        let mut c = Self {
            defs: Vec::new(),
            by_signature: HashMap::new(),
        };
        c.insert(
            COPY_SIGNATURE,
            vec![Param::new(ParamDir::In, ""), Param::new(ParamDir::Out, "")],
            Some(true),
        );
        c
    }

    /// Registers a primitive. `pure` defaults to true for operators, casts,
    /// property reads and indexer reads, false for everything else. Re-registering a signature
    /// replaces its definition and keeps its id.
    pub fn insert(&mut self, signature: &str, params: Vec<Param>, pure: Option<bool>) -> PrimitiveId {
        let kind = classify(signature, &params);
        let pure = pure.unwrap_or(!matches!(
            kind,
            PrimitiveKind::Invoke
                | PrimitiveKind::Ctor
                | PrimitiveKind::IndexSet
                | PrimitiveKind::Property { setter: true }
        ));
        let def = PrimitiveDef {
            signature: signature.to_string(),
            params,
            pure,
            kind,
        };
        if let Some(&id) = self.by_signature.get(signature) {
            self.defs[id.index()] = def;
            return id;
        }
        let id = PrimitiveId(self.defs.len() as u32);
        self.defs.push(def);
        self.by_signature.insert(signature.to_string(), id);
        id
    }

    pub fn from_json(text: &str) -> Result<Self, DestackError> {
        let doc: CatalogueDoc = serde_json::from_str(text)?;
        let mut c = Self::new();
        for entry in doc.primitives {
            c.insert(&entry.signature, entry.params, entry.pure);
        }
        Ok(c)
    }

    pub fn resolve(&self, signature: &str) -> Result<PrimitiveId, DestackError> {
        self.by_signature
            .get(signature)
            .copied()
            .ok_or_else(|| DestackError::UnknownPrimitive(signature.to_string()))
    }

    pub fn get(&self, id: PrimitiveId) -> Option<&PrimitiveDef> {
        self.defs.get(id.index())
    }

    pub fn def(&self, id: PrimitiveId) -> Result<&PrimitiveDef, DestackError> {
        self.get(id).ok_or(DestackError::UnknownPrimitiveId(id.0))
    }

    pub fn len(&self) -> usize {
        self.defs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(dirs: &[ParamDir]) -> Vec<Param> {
        dirs.iter().map(|&d| Param::new(d, "SystemInt32")).collect()
    }

    #[test]
    fn classifies_operators_from_signature() {
        use ParamDir::*;
        let mut c = Catalogue::new();
        let add = c.insert(
            "SystemInt32.__op_Addition__SystemInt32_SystemInt32__SystemInt32",
            params(&[In, In, Out]),
            None,
        );
        let not = c.insert(
            "SystemBoolean.__op_UnaryNegation__SystemBoolean__SystemBoolean",
            params(&[In, Out]),
            None,
        );
        let get = c.insert(
            "SystemUInt32Array.__Get__SystemInt32__SystemUInt32",
            params(&[In, In, Out]),
            None,
        );
        let log = c.insert(
            "UnityEngineDebug.__Log__SystemObject__SystemVoid",
            params(&[In]),
            None,
        );

        assert_eq!(c.def(add).unwrap().kind, PrimitiveKind::Binary(BinOp::Add));
        assert!(c.def(add).unwrap().pure);
        assert_eq!(c.def(not).unwrap().kind, PrimitiveKind::Unary(UnOp::Not));
        assert_eq!(c.def(get).unwrap().kind, PrimitiveKind::ArrayGet);
        let log = c.def(log).unwrap();
        assert_eq!(log.kind, PrimitiveKind::Invoke);
        assert!(log.has_effects());
        assert_eq!(log.type_name(), "UnityEngineDebug");
        assert_eq!(log.method_name(), "Log");
        assert!(!c.def(PrimitiveId::COPY).unwrap().has_effects());
    }

    #[test]
    fn classifies_accessors_and_constructors() {
        use ParamDir::*;
        let mut c = Catalogue::new();
        let mut kind = |sig: &str, dirs: &[ParamDir]| {
            let id = c.insert(sig, params(dirs), None);
            c.def(id).unwrap().clone()
        };
        let getter = kind("UnityEngineTransform.__get_position__UnityEngineVector3", &[In, Out]);
        assert_eq!(getter.kind, PrimitiveKind::Property { setter: false });
        assert_eq!(getter.property_name(), "position");
        assert!(getter.pure);
        let setter = kind("UnityEngineTransform.__set_position__UnityEngineVector3__SystemVoid", &[In, In]);
        assert_eq!(setter.kind, PrimitiveKind::Property { setter: true });
        assert!(setter.has_effects());
        assert_eq!(kind("SystemInt32Array.__Set__SystemInt32_SystemInt32__SystemVoid", &[In, In, In]).kind, PrimitiveKind::IndexSet);
        assert_eq!(kind("SystemCollectionsHashtable.__get_Item__SystemObject__SystemObject", &[In, In, Out]).kind, PrimitiveKind::IndexGet);
        assert_eq!(kind("SystemSingle.__op_Implicit__SystemInt32__SystemSingle", &[In, Out]).kind, PrimitiveKind::Cast { explicit: false });
        let ctor = kind("UnityEngineVector3.__ctor__SystemSingle_SystemSingle_SystemSingle__UnityEngineVector3", &[In, In, In, Out]);
        assert_eq!(ctor.kind, PrimitiveKind::Ctor);
        assert!(ctor.has_effects());
        assert_eq!(ctor.result_type(), "UnityEngineVector3");
    }

    #[test]
    fn loads_json_and_rejects_unknown_signatures() {
        let c = Catalogue::from_json(
            r#"{"primitives": [
                {"signature": "SystemInt32.__op_LessThan__SystemInt32_SystemInt32__SystemBoolean",
                 "params": [{"dir": "In", "type": "SystemInt32"},
                            {"dir": "In", "type": "SystemInt32"},
                            {"dir": "Out", "type": "SystemBoolean"}]},
                {"signature": "SystemMath.__Max__SystemInt32_SystemInt32__SystemInt32",
                 "params": [{"dir": "In"}, {"dir": "In"}, {"dir": "Out"}],
                 "pure": true}
            ]}"#,
        )
        .unwrap();
        assert_eq!(c.len(), 3);
        let max = c
            .resolve("SystemMath.__Max__SystemInt32_SystemInt32__SystemInt32")
            .unwrap();
        assert!(c.def(max).unwrap().pure);
        assert!(c.def(max).unwrap().returns_value());
        assert!(matches!(
            c.resolve("SystemMath.__Min__SystemInt32_SystemInt32__SystemInt32"),
            Err(DestackError::UnknownPrimitive(_))
        ));
    }
}
