///
/// Callback slots.
///
/// A slot is one extension point on a handle that holds at most one active
/// closure. Busy handler, trace and the three transaction hooks exist once
/// per handle; functions, collations and tokenizers are keyed by name.
///
/// SQLite resolves function and collation names without regard to ASCII
/// case, so those names are folded to lower case here. A function is
/// identified by name and arity because SQLite keeps one definition per
/// `(name, nArg)` pair. Tokenizer names are matched exactly, within the FTS3
/// module they are bound under.
///

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Slot {
    BusyHandler,
    Trace,
    UpdateHook,
    CommitHook,
    RollbackHook,
    Function { name: String, arity: i32 },
    Collation { name: String },
    Tokenizer { module: String, name: String },
}

impl Slot {
    pub fn function(name: &str, arity: i32) -> Self {
        Slot::Function {
            name: name.to_ascii_lowercase(),
            arity,
        }
    }

    pub fn collation(name: &str) -> Self {
        Slot::Collation {
            name: name.to_ascii_lowercase(),
        }
    }

    pub fn tokenizer(module: &str, name: &str) -> Self {
        Slot::Tokenizer {
            module: module.to_string(),
            name: name.to_string(),
        }
    }

    /// Short label of the slot kind, used in log events.
    pub fn kind(&self) -> &'static str {
        match self {
            Slot::BusyHandler => "busy_handler",
            Slot::Trace => "trace",
            Slot::UpdateHook => "update_hook",
            Slot::CommitHook => "commit_hook",
            Slot::RollbackHook => "rollback_hook",
            Slot::Function { .. } => "function",
            Slot::Collation { .. } => "collation",
            Slot::Tokenizer { .. } => "tokenizer",
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Slot::Function { name, arity } => write!(f, "function {}/{}", name, arity),
            Slot::Collation { name } => write!(f, "collation {}", name),
            Slot::Tokenizer { module, name } => write!(f, "tokenizer {}:{}", module, name),
            other => f.write_str(other.kind()),
        }
    }
}

/// Row change reported by the update hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOperation {
    Insert,
    Update,
    Delete,
    Unknown(i32),
}

impl UpdateOperation {
    pub fn from_code(code: i32) -> Self {
        match code {
            rusqlite::ffi::SQLITE_INSERT => UpdateOperation::Insert,
            rusqlite::ffi::SQLITE_UPDATE => UpdateOperation::Update,
            rusqlite::ffi::SQLITE_DELETE => UpdateOperation::Delete,
            other => UpdateOperation::Unknown(other),
        }
    }

    pub fn code(self) -> i32 {
        match self {
            UpdateOperation::Insert => rusqlite::ffi::SQLITE_INSERT,
            UpdateOperation::Update => rusqlite::ffi::SQLITE_UPDATE,
            UpdateOperation::Delete => rusqlite::ffi::SQLITE_DELETE,
            UpdateOperation::Unknown(code) => code,
        }
    }
}
