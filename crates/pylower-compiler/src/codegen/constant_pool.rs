use std::collections::HashMap;

use pylower_common::Constant;

use crate::error::{CompileError, CompileErrorKind, CompileResult};

fn table_full(what: &'static str) -> CompileError {
    CompileError::internal(CompileErrorKind::AllocationFailed(what))
}

/// Deduplicating constant table of one unit.
///
/// Each distinct literal is stored once; nested code units always get a
/// fresh slot.
#[derive(Debug, Default)]
pub struct ConstantPool {
    constants: Vec<Constant>,
    /// Maps [`Constant::dedup_key`] to the slot holding that constant.
    dedup: HashMap<String, u32>,
}

impl ConstantPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a constant, returning its index.
    pub fn add(&mut self, constant: Constant) -> CompileResult<u32> {
        match constant.dedup_key() {
            Some(key) => {
                if let Some(&idx) = self.dedup.get(&key) {
                    return Ok(idx);
                }
                let idx = self.push(constant)?;
                self.dedup.insert(key, idx);
                Ok(idx)
            }
            None => self.push(constant),
        }
    }

    fn push(&mut self, constant: Constant) -> CompileResult<u32> {
        let idx = u32::try_from(self.constants.len()).map_err(|_| table_full("constant table"))?;
        self.constants
            .try_reserve(1)
            .map_err(|_| table_full("constant table"))?;
        self.constants.push(constant);
        Ok(idx)
    }

    pub fn len(&self) -> usize {
        self.constants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constants.is_empty()
    }

    /// Consume the pool and return all constants.
    pub fn into_constants(self) -> Vec<Constant> {
        self.constants
    }
}

/// Insertion-ordered set of identifiers (attribute/global names, local slots).
#[derive(Debug, Clone, Default)]
pub struct NameTable {
    names: Vec<String>,
    index: HashMap<String, u32>,
}

impl NameTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_names(names: impl IntoIterator<Item = String>) -> CompileResult<Self> {
        let mut table = Self::new();
        for name in names {
            table.get_or_insert(&name)?;
        }
        Ok(table)
    }

    pub fn get_or_insert(&mut self, name: &str) -> CompileResult<u32> {
        if let Some(&idx) = self.index.get(name) {
            return Ok(idx);
        }
        let idx = u32::try_from(self.names.len()).map_err(|_| table_full("name table"))?;
        self.names.try_reserve(1).map_err(|_| table_full("name table"))?;
        self.names.push(name.to_string());
        self.index.insert(name.to_string(), idx);
        Ok(idx)
    }

    pub fn get(&self, name: &str) -> Option<u32> {
        self.index.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn into_names(self) -> Vec<String> {
        self.names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pylower_common::ir::{CodeFlags, CodeUnit, UnitKind};

    fn empty_unit(name: &str) -> CodeUnit {
        CodeUnit {
            name: name.into(),
            qualname: name.into(),
            kind: UnitKind::Function,
            filename: String::new(),
            first_line: 1,
            argcount: 0,
            posonlyargcount: 0,
            kwonlyargcount: 0,
            flags: CodeFlags::default(),
            max_stack_depth: 0,
            consts: Vec::new(),
            names: Vec::new(),
            varnames: Vec::new(),
            cellvars: Vec::new(),
            freevars: Vec::new(),
            instructions: Vec::new(),
            labels: Vec::new(),
        }
    }

    #[test]
    fn deduplicates_same_values() {
        let mut pool = ConstantPool::new();
        let a = pool.add(Constant::Int(42)).unwrap();
        let b = pool.add(Constant::Int(42)).unwrap();
        assert_eq!(a, b);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn different_values_get_different_indices() {
        let mut pool = ConstantPool::new();
        let a = pool.add(Constant::Int(1)).unwrap();
        let b = pool.add(Constant::Int(2)).unwrap();
        let c = pool.add(Constant::Str("hello".into())).unwrap();
        let d = pool.add(Constant::Bool(true)).unwrap();
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_ne!(a, d);
        assert_eq!(pool.len(), 4);
    }

    #[test]
    fn signed_zeros_are_distinct() {
        let mut pool = ConstantPool::new();
        let pos = pool.add(Constant::Float(0.0)).unwrap();
        let neg = pool.add(Constant::Float(-0.0)).unwrap();
        assert_ne!(pos, neg);
    }

    #[test]
    fn code_units_are_never_shared() {
        let mut pool = ConstantPool::new();
        let a = pool.add(Constant::Code(Box::new(empty_unit("f")))).unwrap();
        let b = pool.add(Constant::Code(Box::new(empty_unit("f")))).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn name_table_keeps_first_index() {
        let mut names = NameTable::from_names(vec!["a".to_string(), "b".to_string()]).unwrap();
        assert_eq!(names.get_or_insert("b").unwrap(), 1);
        assert_eq!(names.get_or_insert("c").unwrap(), 2);
        assert_eq!(names.get("a"), Some(0));
        assert_eq!(names.into_names(), vec!["a", "b", "c"]);
    }
}
