///
/// Connection handles and runtime configuration.
///
/// HANDLE_REGISTRY maps i64 handle → `Arc<Mutex<Handle>>`. The registry lock
/// is only held to look a handle up; the handle's own lock is held while an
/// export works on it, so a callback running on one handle can drive another
/// handle but not re-enter its own.
///
/// Status convention: exports return SQLite status codes (`SQLITE_OK` on
/// success). Open returns a positive handle or a negated status. Unknown
/// handles report `SQLITE_MISUSE`.
///

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use naml_sqlite_callbacks::rusqlite::ffi;
use naml_sqlite_callbacks::{BridgeConfig, CallbackError, Handle, Result};
use tracing::{debug, warn};

struct HandleRegistry {
    handles: HashMap<i64, Arc<Mutex<Handle>>>,
    next_id: i64,
    config: BridgeConfig,
}

impl HandleRegistry {
    fn new() -> Self {
        Self {
            handles: HashMap::new(),
            next_id: 1,
            config: BridgeConfig::default(),
        }
    }

    fn insert(&mut self, handle: Handle) -> i64 {
        let id = self.next_id;
        self.next_id += 1;
        self.handles.insert(id, Arc::new(Mutex::new(handle)));
        id
    }
}

static HANDLE_REGISTRY: LazyLock<Mutex<HandleRegistry>> =
    LazyLock::new(|| Mutex::new(HandleRegistry::new()));

fn registry() -> MutexGuard<'static, HandleRegistry> {
    HANDLE_REGISTRY.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Copies a (ptr, len) string argument; null or negative lengths read as empty.
pub(crate) fn text_arg(ptr: *const u8, len: i64) -> String {
    if ptr.is_null() || len <= 0 {
        return String::new();
    }
    let bytes = unsafe { std::slice::from_raw_parts(ptr, len as usize) };
    String::from_utf8_lossy(bytes).into_owned()
}

pub(crate) fn config() -> BridgeConfig {
    registry().config.clone()
}

/// Runs `f` on the handle and converts the outcome to a status code.
pub(crate) fn with_handle(handle: i64, f: impl FnOnce(&Handle) -> Result<()>) -> i32 {
    let Some(entry) = registry().handles.get(&handle).cloned() else {
        warn!(handle, "unknown database handle");
        return CallbackError::UnknownHandle(handle).status();
    };
    let guard = entry.lock().unwrap_or_else(PoisonError::into_inner);
    match f(&guard) {
        Ok(()) => ffi::SQLITE_OK,
        Err(e) => {
            debug!(handle, error = %e, "database call failed");
            e.status()
        }
    }
}

fn register(opened: Result<Handle>) -> i64 {
    match opened {
        Ok(handle) => {
            let adapter_id = handle.id();
            let id = registry().insert(handle);
            debug!(handle = id, adapter = %adapter_id, "opened database");
            id
        }
        Err(e) => {
            warn!(error = %e, "failed to open database");
            -i64::from(e.status())
        }
    }
}

/// Parses a TOML bridge configuration applied to handles opened afterwards.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn naml_db_sqlite_configure(toml: *const u8, len: i64) -> i32 {
    match BridgeConfig::from_toml_str(&text_arg(toml, len)) {
        Ok(config) => {
            registry().config = config;
            ffi::SQLITE_OK
        }
        Err(e) => {
            warn!(error = %e, "rejected bridge config");
            e.status()
        }
    }
}

/// Installs a stderr log subscriber. Later calls are no-ops.
#[unsafe(no_mangle)]
pub extern "C" fn naml_db_sqlite_log_init() {
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .try_init();
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn naml_db_sqlite_open(path: *const u8, len: i64) -> i64 {
    let path = text_arg(path, len);
    register(Handle::open(&path, &config()))
}

#[unsafe(no_mangle)]
pub extern "C" fn naml_db_sqlite_open_memory() -> i64 {
    register(Handle::open_in_memory(&config()))
}

/// Clears every callback and closes the connection. A handle that is in use
/// elsewhere, or that SQLite refuses to close, stays open.
#[unsafe(no_mangle)]
pub extern "C" fn naml_db_sqlite_close(handle: i64) -> i32 {
    let mut reg = registry();
    let Some(entry) = reg.handles.remove(&handle) else {
        return CallbackError::UnknownHandle(handle).status();
    };
    let inner = match Arc::try_unwrap(entry) {
        Ok(inner) => inner.into_inner().unwrap_or_else(PoisonError::into_inner),
        Err(entry) => {
            reg.handles.insert(handle, entry);
            warn!(handle, "close of a handle that is still in use");
            return ffi::SQLITE_BUSY;
        }
    };
    drop(reg);

    match inner.close() {
        Ok(()) => {
            debug!(handle, "closed database");
            ffi::SQLITE_OK
        }
        Err((inner, e)) => {
            warn!(handle, error = %e, "database refused to close");
            registry()
                .handles
                .insert(handle, Arc::new(Mutex::new(inner)));
            e.status()
        }
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn naml_db_sqlite_exec(handle: i64, sql: *const u8, len: i64) -> i32 {
    let sql = text_arg(sql, len);
    with_handle(handle, |h| Ok(h.connection().execute_batch(&sql)?))
}

/// Installs SQLite's sleeping busy handler, replacing any busy callback.
#[unsafe(no_mangle)]
pub extern "C" fn naml_db_sqlite_busy_timeout(handle: i64, ms: i64) -> i32 {
    let ms = if ms < 0 { 0 } else { ms as u64 };
    with_handle(handle, |h| h.set_busy_timeout(Duration::from_millis(ms)))
}
