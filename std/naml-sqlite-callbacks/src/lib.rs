//!
//! naml SQLite Callback Adapter
//!
//! Lets closures serve as callbacks for SQLite's C extension points. SQLite
//! registers callbacks as a function pointer plus an opaque `void*` context;
//! this crate bridges that convention to owned Rust closures.
//!
//! Architecture:
//! - `Handle` owns one rusqlite `Connection` and exposes one registration
//!   entry point per slot. `Some(closure)` registers or replaces, `None`
//!   clears.
//! - Closures live in a process-wide registry behind
//!   LazyLock<Mutex<Registry>>, keyed by an integer `ContextKey` that SQLite
//!   stores as the callback context.
//! - Each slot kind has one fixed `extern "C"` trampoline that resolves the
//!   key, runs the closure and encodes the result for SQLite.
//! - Closures are released when replaced, cleared, destroyed by SQLite or
//!   when their handle closes.
//!
//! Slots:
//! - Busy handler, trace, update hook, commit hook, rollback hook
//! - SQL functions (by name and arity), collations (by name)
//! - FTS3/FTS4 tokenizers (by module and name)
//!

mod error;
mod function;
mod handle;
mod registry;
mod slot;
mod tokenizer;
mod trampoline;

pub mod config;

pub use config::{BridgeConfig, DEFAULT_TOKENIZER_MODULE, TokenizerConfig, TraceConfig};
pub use error::{CallbackError, Result};
pub use function::FunctionContext;
pub use handle::Handle;
pub use registry::{
    BusyFn, CollationFn, CommitFn, FunctionFn, HandleId, RollbackFn, TokenizeFn, TraceFn,
    UpdateFn,
};
pub use slot::{Slot, UpdateOperation};
pub use tokenizer::TokenSpan;

pub use rusqlite;
