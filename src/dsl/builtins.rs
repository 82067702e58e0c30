//! Members that script-native values expose without host registration.

/// Receiver category of a built-in member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuiltinReceiver {
    Array,
    String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinKind {
    /// `arr.length`, `s.length`
    Length,
    /// `arr.add(x)`
    Add,
}

/// Built-in member: single source of truth for name, receiver and arity.
/// Inference, code generation and the dynamic runtime all read from this.
#[derive(Debug, Clone)]
pub struct BuiltinMember {
    pub name: &'static str,
    pub receiver: BuiltinReceiver,
    pub kind: BuiltinKind,
    /// `None` for members read as values, `Some(n)` for methods taking `n` arguments.
    pub arity: Option<usize>,
    pub description: &'static str,
}

pub static BUILTINS: &[BuiltinMember] = &[
    BuiltinMember {
        name: "length", receiver: BuiltinReceiver::Array, kind: BuiltinKind::Length,
        arity: None, description: "Number of elements",
    },
    BuiltinMember {
        name: "add", receiver: BuiltinReceiver::Array, kind: BuiltinKind::Add,
        arity: Some(1), description: "Append an element",
    },
    BuiltinMember {
        name: "length", receiver: BuiltinReceiver::String, kind: BuiltinKind::Length,
        arity: None, description: "Number of characters",
    },
];

pub fn lookup(receiver: BuiltinReceiver, name: &str) -> Option<&'static BuiltinMember> {
    BUILTINS
        .iter()
        .find(|b| b.receiver == receiver && b.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_by_receiver() {
        assert_eq!(lookup(BuiltinReceiver::Array, "add").map(|b| b.kind), Some(BuiltinKind::Add));
        assert_eq!(lookup(BuiltinReceiver::String, "length").map(|b| b.kind), Some(BuiltinKind::Length));
        assert!(lookup(BuiltinReceiver::String, "add").is_none());
    }

    #[test]
    fn no_duplicate_entries() {
        let mut seen = std::collections::HashSet::new();
        for b in BUILTINS {
            assert!(seen.insert((b.receiver, b.name)), "duplicate builtin: {}", b.name);
        }
    }
}
