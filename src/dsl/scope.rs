//! Lexical scopes and symbol resolution.
//!
//! Scopes live in an arena so that lambda scopes can be reopened and
//! re-populated once per call signature while inner scopes created by an
//! earlier analysis stay resolvable.

#![allow(clippy::cast_possible_truncation)]

use indexmap::IndexMap;
use thiserror::Error;

use super::ast::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Root,
    Block,
    Lambda,
}

/// A declared name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Symbol {
    /// Bound to its declaring `var` statement.
    Variable(NodeId),
    /// Bound to its position in a lambda's parameter list.
    LambdaParameter {
        lambda: NodeId,
        index: usize,
        param: NodeId,
    },
}

impl Symbol {
    /// The node under which the symbol's shape is recorded.
    pub fn node(self) -> NodeId {
        match self {
            Self::Variable(id) => id,
            Self::LambdaParameter { param, .. } => param,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeId(u32);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScopeError {
    #[error("'{0}' is already declared in this scope")]
    DuplicateDeclaration(String),
    #[error("'{0}' is already declared in an enclosing scope")]
    ShadowsEnclosing(String),
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    symbol: Symbol,
    declared_at: usize,
}

#[derive(Debug)]
struct Scope {
    kind: ScopeKind,
    parent: Option<ScopeId>,
    symbols: IndexMap<String, Entry>,
    children: Vec<ScopeId>,
    alive: bool,
}

#[derive(Debug)]
pub struct SymbolTable {
    scopes: Vec<Scope>,
    current: ScopeId,
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolTable {
    pub fn new() -> Self {
        Self {
            scopes: vec![Scope {
                kind: ScopeKind::Root,
                parent: None,
                symbols: IndexMap::new(),
                children: Vec::new(),
                alive: true,
            }],
            current: ScopeId(0),
        }
    }

    pub fn root(&self) -> ScopeId {
        ScopeId(0)
    }

    pub fn current(&self) -> ScopeId {
        self.current
    }

    pub fn set_current(&mut self, scope: ScopeId) {
        self.current = scope;
    }

    fn scope(&self, id: ScopeId) -> Option<&Scope> {
        self.scopes.get(id.0 as usize)
    }

    fn scope_mut(&mut self, id: ScopeId) -> Option<&mut Scope> {
        self.scopes.get_mut(id.0 as usize)
    }

    pub fn kind(&self, id: ScopeId) -> Option<ScopeKind> {
        self.scope(id).map(|s| s.kind)
    }

    pub fn is_alive(&self, id: ScopeId) -> bool {
        self.scope(id).is_some_and(|s| s.alive)
    }

    /// Open a child of the current scope and make it current.
    pub fn declare_scope(&mut self, kind: ScopeKind) -> ScopeId {
        let id = ScopeId(self.scopes.len() as u32);
        let parent = self.current;
        self.scopes.push(Scope {
            kind,
            parent: Some(parent),
            symbols: IndexMap::new(),
            children: Vec::new(),
            alive: true,
        });
        if let Some(p) = self.scope_mut(parent) {
            p.children.push(id);
        }
        self.current = id;
        id
    }

    /// Leave the current scope. Its symbols stay resolvable for lambdas
    /// defined inside it that are analyzed later.
    pub fn end_scope(&mut self) {
        let current = self.current;
        if let Some(scope) = self.scope_mut(current) {
            scope.alive = false;
            if let Some(parent) = scope.parent {
                self.current = parent;
            }
        }
    }

    /// Declare `name` in the current scope at source offset `pos`.
    pub fn register(&mut self, name: &str, symbol: Symbol, pos: usize) -> Result<(), ScopeError> {
        let current = self.current;
        let Some(scope) = self.scope(current) else {
            return Ok(());
        };
        if scope.symbols.contains_key(name) {
            return Err(ScopeError::DuplicateDeclaration(name.to_string()));
        }
        if let Some(parent) = scope.parent {
            if self.find_from(parent, name, pos).is_some() {
                return Err(ScopeError::ShadowsEnclosing(name.to_string()));
            }
        }
        if let Some(scope) = self.scope_mut(current) {
            scope.symbols.insert(
                name.to_string(),
                Entry {
                    symbol,
                    declared_at: pos,
                },
            );
        }
        Ok(())
    }

    /// Nearest declaration of `name` visible from source offset `use_pos`.
    pub fn find_going_up(&self, name: &str, use_pos: usize) -> Option<(Symbol, ScopeId)> {
        self.find_from(self.current, name, use_pos)
    }

    fn find_from(&self, start: ScopeId, name: &str, use_pos: usize) -> Option<(Symbol, ScopeId)> {
        let mut cursor = Some(start);
        while let Some(id) = cursor {
            let scope = self.scope(id)?;
            if let Some(entry) = scope.symbols.get(name) {
                if entry.declared_at <= use_pos {
                    return Some((entry.symbol, id));
                }
            }
            cursor = scope.parent;
        }
        None
    }

    /// Forget every symbol declared directly in `scope`.
    pub fn clear(&mut self, scope: ScopeId) {
        if let Some(s) = self.scope_mut(scope) {
            s.symbols.clear();
        }
    }

    /// Detach and retire the children of `scope`.
    pub fn destroy_children(&mut self, scope: ScopeId) {
        let children = match self.scope_mut(scope) {
            Some(s) => std::mem::take(&mut s.children),
            None => return,
        };
        let mut pending = children;
        while let Some(child) = pending.pop() {
            if let Some(c) = self.scope_mut(child) {
                c.alive = false;
                pending.extend(c.children.iter().copied());
            }
        }
    }

    /// Reset a lambda scope for a fresh analysis and make it current.
    pub fn reopen(&mut self, scope: ScopeId) {
        self.clear(scope);
        self.destroy_children(scope);
        if let Some(s) = self.scope_mut(scope) {
            s.alive = true;
        }
        self.current = scope;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn var(n: u32) -> Symbol {
        Symbol::Variable(NodeId(n))
    }

    #[test]
    fn lookup_walks_parents() {
        let mut table = SymbolTable::new();
        table.register("a", var(1), 0).unwrap();
        table.declare_scope(ScopeKind::Block);
        table.register("b", var(2), 10).unwrap();
        assert_eq!(table.find_going_up("a", 20).unwrap().0, var(1));
        assert_eq!(table.find_going_up("b", 20).unwrap().0, var(2));
        table.end_scope();
        assert!(table.find_going_up("b", 20).is_none());
    }

    #[test]
    fn duplicate_in_current_scope() {
        let mut table = SymbolTable::new();
        table.register("x", var(1), 0).unwrap();
        let err = table.register("x", var(2), 5).unwrap_err();
        assert_eq!(err, ScopeError::DuplicateDeclaration("x".into()));
    }

    #[test]
    fn shadowing_is_rejected() {
        let mut table = SymbolTable::new();
        table.register("x", var(1), 0).unwrap();
        table.declare_scope(ScopeKind::Block);
        let err = table.register("x", var(2), 5).unwrap_err();
        assert_eq!(err, ScopeError::ShadowsEnclosing("x".into()));
    }

    #[test]
    fn later_declarations_are_invisible() {
        let mut table = SymbolTable::new();
        table.register("y", var(1), 50).unwrap();
        assert!(table.find_going_up("y", 10).is_none());
        // An inner declaration before the outer one does not shadow it.
        table.declare_scope(ScopeKind::Lambda);
        table.register("y", var(2), 20).unwrap();
    }

    #[test]
    fn reopen_clears_symbols_but_keeps_dead_children_resolvable() {
        let mut table = SymbolTable::new();
        let lambda = table.declare_scope(ScopeKind::Lambda);
        table.register("p", var(1), 0).unwrap();
        let inner = table.declare_scope(ScopeKind::Block);
        table.register("q", var(2), 5).unwrap();
        table.end_scope();
        table.end_scope();

        table.reopen(lambda);
        assert!(!table.is_alive(inner));
        assert!(table.find_going_up("p", 10).is_none());
        table.register("p", var(3), 0).unwrap();

        table.set_current(inner);
        assert_eq!(table.find_going_up("q", 10).unwrap().0, var(2));
        assert_eq!(table.find_going_up("p", 10).unwrap().0, var(3));
    }
}
