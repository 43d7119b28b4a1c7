///
/// naml SQLite Callback Runtime
///
/// C ABI exports that let compiled naml programs register closures as
/// SQLite callbacks. This crate produces a static library
/// (libnaml_sqlite_runtime.a) linked into naml binaries.
///
/// Contains:
/// - Connections: configure, log_init, open, open_memory, close, exec,
///   busy_timeout
/// - Hooks: busy_handler, trace, update_hook, commit_hook, rollback_hook
/// - Functions: create_function, fn_arg_*, fn_result_*
/// - Collations: create_collation
/// - Tokenizers: register_tokenizer
///

mod closure;
mod functions;
mod handles;
mod hooks;
mod tokenizer;

pub use closure::HostClosure;
pub use functions::*;
pub use handles::{
    naml_db_sqlite_busy_timeout, naml_db_sqlite_close, naml_db_sqlite_configure,
    naml_db_sqlite_exec, naml_db_sqlite_log_init, naml_db_sqlite_open, naml_db_sqlite_open_memory,
};
pub use hooks::*;
pub use tokenizer::*;
