//! Signature symbol interning.
//!
//! Method dispatch is by *signature*: a textual name plus arity shape such as
//! `call(_,_)` or `iterate(_)`. Signatures are interned into a per-VM dense
//! table so a method lookup is a single index into a class's flat method
//! vector. The table is append-only; ids are sequential `u16`s and
//! re-interning an existing signature returns its original id.

use std::collections::HashMap;
use std::fmt;

/// Interned signature id. Indexes directly into class method tables.
pub type SymbolId = u16;

/// Append-only signature table: name to dense id and back.
#[derive(Debug, Default)]
pub struct SymbolTable {
    names: Vec<String>,
    ids: HashMap<String, SymbolId>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self {
            names: Vec::new(),
            ids: HashMap::new(),
        }
    }

    /// Intern a signature, returning its id. Existing signatures keep their id.
    pub fn ensure(&mut self, name: &str) -> SymbolId {
        if let Some(&id) = self.ids.get(name) {
            return id;
        }
        let id = self.names.len() as SymbolId;
        self.names.push(name.to_string());
        self.ids.insert(name.to_string(), id);
        id
    }

    /// Look up an already-interned signature.
    pub fn find(&self, name: &str) -> Option<SymbolId> {
        self.ids.get(name).copied()
    }

    /// The signature text for an id.
    pub fn name(&self, id: SymbolId) -> &str {
        &self.names[id as usize]
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl fmt::Display for SymbolTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SymbolTable({} signatures)", self.names.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_is_stable() {
        let mut table = SymbolTable::new();
        let a = table.ensure("iterate(_)");
        let b = table.ensure("toString");
        let again = table.ensure("iterate(_)");
        assert_eq!(a, again);
        assert_ne!(a, b);
        assert_eq!(table.name(a), "iterate(_)");
        assert_eq!(table.name(b), "toString");
    }

    #[test]
    fn test_find_without_insert() {
        let mut table = SymbolTable::new();
        table.ensure("call()");
        assert_eq!(table.find("call()"), Some(0));
        assert_eq!(table.find("call(_)"), None);
        assert_eq!(table.len(), 1);
    }
}
