//! Interned selectors

use std::cell::RefCell;
use std::rc::Rc;

use rustc_hash::FxHashMap;

/// An interned selector. Raw value 0 is the null selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Sel(usize);

impl Sel {
    /// The null selector
    pub const NULL: Sel = Sel(0);

    /// Raw value as stored in a call frame
    pub fn as_raw(self) -> usize {
        self.0
    }

    /// Rebuild from a raw value read out of native memory
    pub fn from_raw(raw: usize) -> Sel {
        Sel(raw)
    }

    /// Whether this is the null selector
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// Name ↔ selector table
#[derive(Debug, Default)]
pub struct SelectorTable {
    by_name: RefCell<FxHashMap<Rc<str>, Sel>>,
    names: RefCell<Vec<Rc<str>>>,
}

impl SelectorTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern a selector name
    pub fn intern(&self, name: &str) -> Sel {
        if let Some(sel) = self.by_name.borrow().get(name) {
            return *sel;
        }
        let name: Rc<str> = Rc::from(name);
        let mut names = self.names.borrow_mut();
        names.push(name.clone());
        let sel = Sel(names.len());
        self.by_name.borrow_mut().insert(name, sel);
        sel
    }

    /// Name of a selector, if it was interned here
    pub fn name(&self, sel: Sel) -> Option<Rc<str>> {
        if sel.is_null() {
            return None;
        }
        self.names.borrow().get(sel.0 - 1).cloned()
    }

    /// Number of interned selectors
    pub fn len(&self) -> usize {
        self.names.borrow().len()
    }

    /// Whether nothing was interned
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_is_stable() {
        let table = SelectorTable::new();
        let a = table.intern("init");
        let b = table.intern("initWithInt:");
        assert_eq!(table.intern("init"), a);
        assert_ne!(a, b);
        assert_eq!(table.name(b).as_deref(), Some("initWithInt:"));
        assert_eq!(table.name(Sel::NULL), None);
        assert_eq!(table.len(), 2);
    }
}
