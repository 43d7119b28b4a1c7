///
/// Database handle with callback slots.
///
/// A `Handle` owns one `rusqlite::Connection` and exposes one registration
/// entry point per callback slot. Every entry point takes an `Option`
/// closure: `Some` registers (or replaces) the slot's closure, `None`
/// unregisters the slot with SQLite and releases the stored closure.
///
/// Registration order is fixed: the closure is staged in the registry under
/// a fresh context key, SQLite is given the slot kind's trampoline and that
/// key, and only after SQLite accepted it is the previous closure released.
/// SQLite therefore never holds a context that no longer resolves.
///
/// Closing (explicitly or by drop) clears the busy handler, trace and
/// transaction hooks, closes the connection (SQLite destroys function and
/// collation contexts on the way), then releases everything the handle still
/// owns, tokenizer modules last.
///

use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::ffi::CString;
use std::os::raw::{c_int, c_uint, c_void};
use std::path::Path;
use std::ptr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::{Connection, ffi};
use tracing::debug;

use crate::config::BridgeConfig;
use crate::error::{CallbackError, Result, check};
use crate::function::FunctionContext;
use crate::registry::{self, Callback, HandleId};
use crate::slot::{Slot, UpdateOperation};
use crate::tokenizer::{TokenSpan, TokenizerModule};
use crate::trampoline;

pub struct Handle {
    id: HandleId,
    conn: Option<Connection>,
    trace_expanded: bool,
    tokenizer_modules: RefCell<HashMap<String, Box<TokenizerModule>>>,
}

impl Handle {
    pub fn open<P: AsRef<Path>>(path: P, config: &BridgeConfig) -> Result<Self> {
        Self::new(Connection::open(path)?, config)
    }

    pub fn open_in_memory(config: &BridgeConfig) -> Result<Self> {
        Self::new(Connection::open_in_memory()?, config)
    }

    /// Takes over a connection opened by the caller.
    pub fn new(conn: Connection, config: &BridgeConfig) -> Result<Self> {
        if let Some(ms) = config.busy_timeout_ms {
            conn.busy_timeout(Duration::from_millis(ms))?;
        }
        let id = HandleId::next();
        debug!(handle = %id, "opened handle");
        Ok(Self {
            id,
            conn: Some(conn),
            trace_expanded: config.trace.expanded,
            tokenizer_modules: RefCell::new(HashMap::new()),
        })
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn connection(&self) -> &Connection {
        match &self.conn {
            Some(conn) => conn,
            None => unreachable!("connection is only taken while the handle closes"),
        }
    }

    fn raw(&self) -> *mut ffi::sqlite3 {
        unsafe { self.connection().handle() }
    }

    /// Whether `slot` currently holds a closure.
    pub fn is_registered(&self, slot: &Slot) -> bool {
        registry::is_active(self.id, slot)
    }

    /// Number of closures this handle keeps alive.
    pub fn registered_count(&self) -> usize {
        registry::registration_count(self.id)
    }

    fn install(
        &self,
        slot: Slot,
        callback: Callback,
        register: impl FnOnce(*mut c_void) -> c_int,
    ) -> Result<()> {
        let key = registry::stage(self.id, slot.clone(), callback);
        let status = register(key.as_ptr());
        if status != ffi::SQLITE_OK {
            drop(registry::discard(key));
            debug!(handle = %self.id, %slot, status, "registration rejected");
            return Err(CallbackError::from_status(status));
        }
        let previous = registry::activate(key);
        debug!(handle = %self.id, %slot, replaced = previous.is_some(), "registered callback");
        drop(previous);
        Ok(())
    }

    fn uninstall(&self, slot: Slot, unregister: impl FnOnce() -> c_int) -> Result<()> {
        check(unregister())?;
        let previous = registry::deactivate(self.id, &slot);
        debug!(handle = %self.id, %slot, released = previous.is_some(), "cleared callback");
        drop(previous);
        Ok(())
    }

    /// Called with the number of times it already ran for the current lock;
    /// returning `true` makes SQLite retry, `false` returns `SQLITE_BUSY`.
    pub fn busy_handler<F>(&self, callback: Option<F>) -> Result<()>
    where
        F: FnMut(i32) -> bool + Send + 'static,
    {
        let db = self.raw();
        match callback {
            Some(f) => self.install(
                Slot::BusyHandler,
                Callback::Busy(Arc::new(Mutex::new(f))),
                |ctx| unsafe { ffi::sqlite3_busy_handler(db, Some(trampoline::busy), ctx) },
            ),
            None => self.uninstall(Slot::BusyHandler, || unsafe {
                ffi::sqlite3_busy_handler(db, None, ptr::null_mut())
            }),
        }
    }

    /// Installs SQLite's sleeping busy handler. SQLite keeps one busy
    /// handler per connection, so this releases any busy handler closure.
    pub fn set_busy_timeout(&self, timeout: Duration) -> Result<()> {
        self.connection().busy_timeout(timeout)?;
        drop(registry::deactivate(self.id, &Slot::BusyHandler));
        Ok(())
    }

    /// Receives the SQL of every statement as it starts running.
    pub fn trace<F>(&self, callback: Option<F>) -> Result<()>
    where
        F: FnMut(&str) + Send + 'static,
    {
        let db = self.raw();
        match callback {
            Some(f) => self.install(
                Slot::Trace,
                Callback::Trace {
                    callback: Arc::new(Mutex::new(f)),
                    expanded: self.trace_expanded,
                },
                |ctx| unsafe {
                    ffi::sqlite3_trace_v2(
                        db,
                        ffi::SQLITE_TRACE_STMT as c_uint,
                        Some(trampoline::trace),
                        ctx,
                    )
                },
            ),
            None => self.uninstall(Slot::Trace, || unsafe {
                ffi::sqlite3_trace_v2(db, 0, None, ptr::null_mut())
            }),
        }
    }

    pub fn update_hook<F>(&self, callback: Option<F>) -> Result<()>
    where
        F: FnMut(UpdateOperation, &str, &str, i64) + Send + 'static,
    {
        let db = self.raw();
        match callback {
            Some(f) => self.install(
                Slot::UpdateHook,
                Callback::Update(Arc::new(Mutex::new(f))),
                |ctx| unsafe {
                    ffi::sqlite3_update_hook(db, Some(trampoline::update), ctx);
                    ffi::SQLITE_OK
                },
            ),
            None => self.uninstall(Slot::UpdateHook, || unsafe {
                ffi::sqlite3_update_hook(db, None, ptr::null_mut());
                ffi::SQLITE_OK
            }),
        }
    }

    /// Returning `true` turns the commit into a rollback.
    pub fn commit_hook<F>(&self, callback: Option<F>) -> Result<()>
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let db = self.raw();
        match callback {
            Some(f) => self.install(
                Slot::CommitHook,
                Callback::Commit(Arc::new(Mutex::new(f))),
                |ctx| unsafe {
                    ffi::sqlite3_commit_hook(db, Some(trampoline::commit), ctx);
                    ffi::SQLITE_OK
                },
            ),
            None => self.uninstall(Slot::CommitHook, || unsafe {
                ffi::sqlite3_commit_hook(db, None, ptr::null_mut());
                ffi::SQLITE_OK
            }),
        }
    }

    pub fn rollback_hook<F>(&self, callback: Option<F>) -> Result<()>
    where
        F: FnMut() + Send + 'static,
    {
        let db = self.raw();
        match callback {
            Some(f) => self.install(
                Slot::RollbackHook,
                Callback::Rollback(Arc::new(Mutex::new(f))),
                |ctx| unsafe {
                    ffi::sqlite3_rollback_hook(db, Some(trampoline::rollback), ctx);
                    ffi::SQLITE_OK
                },
            ),
            None => self.uninstall(Slot::RollbackHook, || unsafe {
                ffi::sqlite3_rollback_hook(db, None, ptr::null_mut());
                ffi::SQLITE_OK
            }),
        }
    }

    /// Creates, replaces or deletes the SQL function `name` taking `arity`
    /// arguments (`-1` for any number). The closure delivers its result
    /// through the `FunctionContext`.
    pub fn create_function<F>(
        &self,
        name: &str,
        arity: i32,
        deterministic: bool,
        callback: Option<F>,
    ) -> Result<()>
    where
        F: FnMut(&mut FunctionContext<'_>) + Send + 'static,
    {
        let c_name = CString::new(name).map_err(|e| CallbackError::invalid_name(name, e))?;
        let slot = Slot::function(name, arity);
        let db = self.raw();
        match callback {
            Some(f) => {
                let mut flags = ffi::SQLITE_UTF8;
                if deterministic {
                    flags |= ffi::SQLITE_DETERMINISTIC;
                }
                self.install(slot, Callback::Function(Arc::new(Mutex::new(f))), |ctx| unsafe {
                    ffi::sqlite3_create_function_v2(
                        db,
                        c_name.as_ptr(),
                        arity,
                        flags,
                        ctx,
                        Some(trampoline::function),
                        None,
                        None,
                        Some(trampoline::destroy),
                    )
                })
            }
            None => self.uninstall(slot, || unsafe {
                ffi::sqlite3_create_function_v2(
                    db,
                    c_name.as_ptr(),
                    arity,
                    ffi::SQLITE_UTF8,
                    ptr::null_mut(),
                    None,
                    None,
                    None,
                    None,
                )
            }),
        }
    }

    /// Creates, replaces or deletes the collation `name`.
    pub fn create_collation<F>(&self, name: &str, callback: Option<F>) -> Result<()>
    where
        F: FnMut(&str, &str) -> Ordering + Send + 'static,
    {
        let c_name = CString::new(name).map_err(|e| CallbackError::invalid_name(name, e))?;
        let slot = Slot::collation(name);
        let db = self.raw();
        match callback {
            Some(f) => self.install(slot, Callback::Collation(Arc::new(Mutex::new(f))), |ctx| unsafe {
                ffi::sqlite3_create_collation_v2(
                    db,
                    c_name.as_ptr(),
                    ffi::SQLITE_UTF8,
                    ctx,
                    Some(trampoline::collation),
                    Some(trampoline::destroy),
                )
            }),
            None => self.uninstall(slot, || unsafe {
                ffi::sqlite3_create_collation_v2(
                    db,
                    c_name.as_ptr(),
                    ffi::SQLITE_UTF8,
                    ptr::null_mut(),
                    None,
                    None,
                )
            }),
        }
    }

    /// Registers the FTS3/FTS4 tokenizer `name` under the tokenizer module
    /// `module`, usable as `tokenize=<module> "<name>"`.
    pub fn register_tokenizer<F>(&self, module: &str, name: &str, callback: Option<F>) -> Result<()>
    where
        F: FnMut(&str, &mut TokenSpan) -> Option<String> + Send + 'static,
    {
        if module.contains('\0') {
            return Err(CallbackError::InvalidName {
                name: module.escape_default().to_string(),
            });
        }
        let slot = Slot::tokenizer(module, name);
        match callback {
            Some(f) => {
                self.bind_tokenizer_module(module)?;
                self.install(slot, Callback::Tokenizer(Arc::new(Mutex::new(f))), |_| {
                    ffi::SQLITE_OK
                })
            }
            None => self.uninstall(slot, || ffi::SQLITE_OK),
        }
    }

    fn bind_tokenizer_module(&self, module: &str) -> Result<()> {
        let mut modules = self.tokenizer_modules.borrow_mut();
        if modules.contains_key(module) {
            return Ok(());
        }
        let instance = TokenizerModule::new(self.id, module);
        instance.bind(self.connection())?;
        debug!(handle = %self.id, module, "bound tokenizer module");
        modules.insert(module.to_string(), instance);
        Ok(())
    }

    fn clear_hooks(&self) {
        let db = self.raw();
        unsafe {
            ffi::sqlite3_busy_handler(db, None, ptr::null_mut());
            ffi::sqlite3_trace_v2(db, 0, None, ptr::null_mut());
            ffi::sqlite3_update_hook(db, None, ptr::null_mut());
            ffi::sqlite3_commit_hook(db, None, ptr::null_mut());
            ffi::sqlite3_rollback_hook(db, None, ptr::null_mut());
        }
        let released: Vec<_> = [
            Slot::BusyHandler,
            Slot::Trace,
            Slot::UpdateHook,
            Slot::CommitHook,
            Slot::RollbackHook,
        ]
        .iter()
        .filter_map(|slot| registry::deactivate(self.id, slot))
        .collect();
        drop(released);
    }

    fn release(&mut self) {
        let released = registry::release_handle(self.id);
        let modules = std::mem::take(self.tokenizer_modules.get_mut());
        debug!(
            handle = %self.id,
            callbacks = released.len(),
            modules = modules.len(),
            "released handle"
        );
        drop(released);
        drop(modules);
    }

    /// Clears every slot and closes the connection. On failure the handle
    /// comes back still open, with its hooks cleared and its functions,
    /// collations and tokenizers still registered.
    pub fn close(mut self) -> std::result::Result<(), (Handle, CallbackError)> {
        self.clear_hooks();
        let Some(conn) = self.conn.take() else {
            return Ok(());
        };
        match conn.close() {
            Ok(()) => {
                self.release();
                Ok(())
            }
            Err((conn, err)) => {
                self.conn = Some(conn);
                Err((self, err.into()))
            }
        }
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        if self.conn.is_some() {
            self.clear_hooks();
            drop(self.conn.take());
        }
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    fn handle() -> Handle {
        Handle::open_in_memory(&BridgeConfig::default()).unwrap()
    }

    #[test]
    fn test_handles_get_distinct_ids() {
        let a = handle();
        let b = handle();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_config_busy_timeout_is_applied() {
        let config = BridgeConfig {
            busy_timeout_ms: Some(0),
            ..BridgeConfig::default()
        };
        let handle = Handle::open_in_memory(&config).unwrap();
        assert!(!handle.is_registered(&Slot::BusyHandler));
    }

    #[test]
    fn test_busy_timeout_releases_busy_handler() {
        let h = handle();
        h.busy_handler(Some(|_| false)).unwrap();
        assert!(h.is_registered(&Slot::BusyHandler));
        h.set_busy_timeout(Duration::from_millis(10)).unwrap();
        assert!(!h.is_registered(&Slot::BusyHandler));
        assert_eq!(h.registered_count(), 0);
    }

    #[test]
    fn test_invalid_function_name_is_rejected_before_sqlite() {
        let h = handle();
        let err = h
            .create_function("bad\0name", 1, true, Some(|_: &mut FunctionContext<'_>| {}))
            .unwrap_err();
        assert_eq!(err.status(), ffi::SQLITE_MISUSE);
        assert_eq!(h.registered_count(), 0);
    }

    #[test]
    fn test_rejected_registration_releases_staged_closure() {
        let h = handle();
        let long_name = "f".repeat(300);
        let err = h
            .create_function(&long_name, 1, false, Some(|_: &mut FunctionContext<'_>| {}))
            .unwrap_err();
        assert_eq!(err.status(), ffi::SQLITE_MISUSE);
        assert_eq!(h.registered_count(), 0);
        assert!(!h.is_registered(&Slot::function(&long_name, 1)));
    }

    #[test]
    fn test_close_releases_every_closure() {
        let drops = Arc::new(AtomicUsize::new(0));
        struct Tracked(Arc<AtomicUsize>);
        impl Drop for Tracked {
            fn drop(&mut self) {
                self.0.fetch_add(1, AtomicOrdering::SeqCst);
            }
        }

        let h = handle();
        let id = h.id();
        let t = Tracked(drops.clone());
        h.rollback_hook(Some(move || {
            let _ = &t;
        }))
        .unwrap();
        let t = Tracked(drops.clone());
        h.create_function("f", 0, false, Some(move |ctx: &mut FunctionContext<'_>| {
            let _ = &t;
            ctx.set_result(1i64);
        }))
        .unwrap();
        let t = Tracked(drops.clone());
        h.create_collation("c", Some(move |a: &str, b: &str| {
            let _ = &t;
            a.cmp(b)
        }))
        .unwrap();

        assert_eq!(h.registered_count(), 3);
        assert!(h.close().is_ok());
        assert_eq!(drops.load(AtomicOrdering::SeqCst), 3);
        assert_eq!(registry::registration_count(id), 0);
    }
}
