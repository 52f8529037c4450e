use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::ir_opcodes::Opcode;
use crate::span::Span;

/// Jump target identity, an index into the owning unit's label table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Label(pub u32);

impl std::fmt::Display for Label {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// Instruction operand. Side-table operands index into the owning unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Operand {
    #[default]
    None,
    Int(u32),
    Label(Label),
    /// Index into `consts`.
    Const(u32),
    /// Index into `names`.
    Name(u32),
    /// Index into `varnames`.
    Local(u32),
    /// Index into `cellvars ++ freevars`.
    Deref(u32),
}

impl Operand {
    /// Raw integer value, as used by stack-effect computation.
    pub fn raw(&self) -> u32 {
        match *self {
            Operand::None => 0,
            Operand::Int(v)
            | Operand::Const(v)
            | Operand::Name(v)
            | Operand::Local(v)
            | Operand::Deref(v) => v,
            Operand::Label(l) => l.0,
        }
    }

    pub fn label(&self) -> Option<Label> {
        match *self {
            Operand::Label(l) => Some(l),
            _ => None,
        }
    }
}

/// One emitted instruction. A `None` span marks generated code with no
/// user-visible source line (unwind and cleanup sequences).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    pub op: Opcode,
    #[serde(default, skip_serializing_if = "is_no_operand")]
    pub arg: Operand,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span: Option<Span>,
}

fn is_no_operand(arg: &Operand) -> bool {
    *arg == Operand::None
}

/// Literal values held in a unit's constant table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Constant {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Complex { real: f64, imag: f64 },
    Str(String),
    Bytes(Vec<u8>),
    Ellipsis,
    Tuple(Vec<Constant>),
    /// A finished nested unit (function, class body, comprehension...).
    Code(Box<CodeUnit>),
}

impl Constant {
    /// Identity key used to deduplicate constants. Nested code units are
    /// never shared, so they have no key.
    pub fn dedup_key(&self) -> Option<String> {
        let key = match self {
            Constant::None => "none".to_string(),
            Constant::Bool(b) => format!("bool:{}", b),
            Constant::Int(i) => format!("int:{}", i),
            // bit pattern keeps 0.0 and -0.0 apart
            Constant::Float(f) => format!("float:{:x}", f.to_bits()),
            Constant::Complex { real, imag } => {
                format!("complex:{:x}:{:x}", real.to_bits(), imag.to_bits())
            }
            Constant::Str(s) => format!("str:{}", s),
            Constant::Bytes(b) => format!("bytes:{:?}", b),
            Constant::Ellipsis => "ellipsis".to_string(),
            Constant::Tuple(items) => {
                let mut key = String::from("tuple(");
                for item in items {
                    key.push_str(&item.dedup_key()?);
                    key.push(',');
                }
                key.push(')');
                key
            }
            Constant::Code(_) => return None,
        };
        Some(key)
    }
}

impl std::fmt::Display for Constant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Constant::None => write!(f, "None"),
            Constant::Bool(true) => write!(f, "True"),
            Constant::Bool(false) => write!(f, "False"),
            Constant::Int(i) => write!(f, "{}", i),
            Constant::Float(v) => write!(f, "{:?}", v),
            Constant::Complex { real, imag } => write!(f, "({:?}+{:?}j)", real, imag),
            Constant::Str(s) => write!(f, "{:?}", s),
            Constant::Bytes(b) => write!(f, "b{:?}", String::from_utf8_lossy(b)),
            Constant::Ellipsis => write!(f, "Ellipsis"),
            Constant::Tuple(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                if items.len() == 1 {
                    write!(f, ",")?;
                }
                write!(f, ")")
            }
            Constant::Code(unit) => write!(f, "<code {}>", unit.qualname),
        }
    }
}

/// What kind of scope a unit was compiled from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitKind {
    Module,
    Class,
    Function,
    AsyncFunction,
    Lambda,
    Comprehension,
    Annotation,
}

impl UnitKind {
    /// Units whose locals live in fast slots.
    pub fn is_function_like(self) -> bool {
        !matches!(self, UnitKind::Module | UnitKind::Class)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CodeFlags {
    #[serde(default)]
    pub generator: bool,
    #[serde(default)]
    pub coroutine: bool,
    #[serde(default)]
    pub async_generator: bool,
    #[serde(default)]
    pub varargs: bool,
    #[serde(default)]
    pub varkeywords: bool,
    #[serde(default)]
    pub nested: bool,
}

/// A finished compilation unit: the instruction stream plus the side tables
/// it indexes. Labels are still symbolic; `labels[id]` is the instruction
/// index the label was placed at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeUnit {
    pub name: String,
    pub qualname: String,
    pub kind: UnitKind,
    #[serde(default)]
    pub filename: String,
    pub first_line: u32,
    #[serde(default)]
    pub argcount: u32,
    #[serde(default)]
    pub posonlyargcount: u32,
    #[serde(default)]
    pub kwonlyargcount: u32,
    #[serde(default)]
    pub flags: CodeFlags,
    #[serde(default)]
    pub max_stack_depth: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub consts: Vec<Constant>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub names: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub varnames: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cellvars: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub freevars: Vec<String>,
    pub instructions: Vec<Instruction>,
    #[serde(default)]
    pub labels: Vec<Option<usize>>,
}

impl CodeUnit {
    /// Instruction index a label was placed at.
    pub fn label_target(&self, label: Label) -> Option<usize> {
        self.labels.get(label.0 as usize).copied().flatten()
    }

    /// Nested units stored in the constant table, in emission order.
    pub fn children(&self) -> impl Iterator<Item = &CodeUnit> {
        self.consts.iter().filter_map(|c| match c {
            Constant::Code(unit) => Some(unit.as_ref()),
            _ => None,
        })
    }

    pub fn deref_name(&self, idx: u32) -> Option<&str> {
        let idx = idx as usize;
        if idx < self.cellvars.len() {
            Some(&self.cellvars[idx])
        } else {
            self.freevars
                .get(idx - self.cellvars.len())
                .map(String::as_str)
        }
    }

    /// Opcodes in emission order, handy for structural assertions.
    pub fn opcodes(&self) -> Vec<Opcode> {
        self.instructions.iter().map(|i| i.op).collect()
    }

    /// Human-readable description of an operand in the context of this unit.
    pub fn describe_operand(&self, instr: &Instruction) -> String {
        match instr.arg {
            Operand::None => String::new(),
            Operand::Int(v) => v.to_string(),
            Operand::Label(l) => format!("to {}", l),
            Operand::Const(i) => match self.consts.get(i as usize) {
                Some(c) => format!("{} ({})", i, c),
                None => format!("{} (?)", i),
            },
            Operand::Name(i) => format!("{} ({})", i, self.names.get(i as usize).map_or("?", String::as_str)),
            Operand::Local(i) => {
                format!("{} ({})", i, self.varnames.get(i as usize).map_or("?", String::as_str))
            }
            Operand::Deref(i) => format!("{} ({})", i, self.deref_name(i).unwrap_or("?")),
        }
    }

    /// Disassembly of this unit followed by every nested unit.
    pub fn listing(&self) -> String {
        let mut out = String::new();
        self.write_listing(&mut out);
        out
    }

    fn write_listing(&self, out: &mut String) {
        let _ = writeln!(out, "Disassembly of <code {}> ({:?}):", self.qualname, self.kind);
        let mut placed: Vec<(usize, u32)> = self
            .labels
            .iter()
            .enumerate()
            .filter_map(|(id, pos)| pos.map(|p| (p, id as u32)))
            .collect();
        placed.sort();
        let mut next_label = placed.iter().peekable();
        let mut last_line = 0;
        for (idx, instr) in self.instructions.iter().enumerate() {
            while let Some(&&(pos, id)) = next_label.peek() {
                if pos != idx {
                    break;
                }
                let _ = writeln!(out, "  L{}:", id);
                next_label.next();
            }
            let line = match instr.span {
                Some(span) if span.start.line != last_line => {
                    last_line = span.start.line;
                    format!("{:>5}", span.start.line)
                }
                _ => "     ".to_string(),
            };
            let _ = writeln!(
                out,
                "{} {:>5} {:<24} {}",
                line,
                idx,
                instr.op.name(),
                self.describe_operand(instr)
            );
        }
        for (pos, id) in next_label {
            if *pos >= self.instructions.len() {
                let _ = writeln!(out, "  L{}:", id);
            }
        }
        for child in self.children() {
            out.push('\n');
            child.write_listing(out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit() -> CodeUnit {
        CodeUnit {
            name: "<module>".to_string(),
            qualname: "<module>".to_string(),
            kind: UnitKind::Module,
            filename: "t.py".to_string(),
            first_line: 1,
            argcount: 0,
            posonlyargcount: 0,
            kwonlyargcount: 0,
            flags: CodeFlags::default(),
            max_stack_depth: 1,
            consts: vec![Constant::None],
            names: vec!["x".to_string()],
            varnames: Vec::new(),
            cellvars: vec!["c".to_string()],
            freevars: vec!["f".to_string()],
            instructions: vec![
                Instruction {
                    op: Opcode::LoadConst,
                    arg: Operand::Const(0),
                    span: Some(Span::lines(1, 1, 1, 5)),
                },
                Instruction {
                    op: Opcode::ReturnValue,
                    arg: Operand::None,
                    span: None,
                },
            ],
            labels: vec![Some(1)],
        }
    }

    #[test]
    fn listing_marks_labels_and_resolves_constants() {
        let text = unit().listing();
        assert!(text.contains("LOAD_CONST"));
        assert!(text.contains("0 (None)"));
        assert!(text.contains("  L0:"));
    }

    #[test]
    fn deref_indexes_cells_then_frees() {
        let u = unit();
        assert_eq!(u.deref_name(0), Some("c"));
        assert_eq!(u.deref_name(1), Some("f"));
        assert_eq!(u.deref_name(2), None);
    }

    #[test]
    fn tuple_keys_distinguish_nested_values() {
        let a = Constant::Tuple(vec![Constant::Int(1), Constant::Str("a".into())]);
        let b = Constant::Tuple(vec![Constant::Int(1), Constant::Str("b".into())]);
        assert_ne!(a.dedup_key(), b.dedup_key());
        assert_ne!(
            Constant::Float(0.0).dedup_key(),
            Constant::Float(-0.0).dedup_key()
        );
    }

    #[test]
    fn serializes_to_json() {
        let json = serde_json::to_string(&unit()).unwrap();
        assert!(json.contains("\"LOAD_CONST\""));
        let back: CodeUnit = serde_json::from_str(&json).unwrap();
        assert_eq!(back.instructions.len(), 2);
    }
}
