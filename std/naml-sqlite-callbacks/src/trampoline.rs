///
/// Fixed-signature trampolines, one per slot kind.
///
/// SQLite calls these directly. Each one resolves its `void*` context back
/// to a registered closure, runs it and encodes the result the way SQLite
/// expects. A context that does not resolve, resolves to another slot kind,
/// or a closure that panics is an adapter defect: it is logged and the
/// process aborts rather than unwinding into C.
///

use std::borrow::Cow;
use std::cmp::Ordering;
use std::ffi::CStr;
use std::os::raw::{c_char, c_int, c_uint, c_void};
use std::panic::{AssertUnwindSafe, catch_unwind};

use rusqlite::ffi;
use tracing::error;

use crate::function::{FunctionContext, raw_bytes};
use crate::registry::{self, Callback, ContextKey, invoke};
use crate::slot::UpdateOperation;

pub(crate) fn fatal(kind: &str, reason: &str) -> ! {
    error!(slot = kind, reason, "callback adapter defect, aborting");
    std::process::abort()
}

pub(crate) fn guarded<R>(kind: &str, body: impl FnOnce() -> R) -> R {
    match catch_unwind(AssertUnwindSafe(body)) {
        Ok(result) => result,
        Err(_) => fatal(kind, "closure panicked"),
    }
}

fn resolve(ctx: *mut c_void, kind: &str) -> Callback {
    match ContextKey::from_ptr(ctx).and_then(registry::resolve) {
        Some(callback) => callback,
        None => fatal(kind, "context does not resolve to a registered closure"),
    }
}

unsafe fn c_text<'a>(text: *const c_char) -> Cow<'a, str> {
    if text.is_null() {
        Cow::Borrowed("")
    } else {
        unsafe { CStr::from_ptr(text) }.to_string_lossy()
    }
}

pub(crate) unsafe extern "C" fn busy(ctx: *mut c_void, count: c_int) -> c_int {
    guarded("busy_handler", || {
        let Callback::Busy(callback) = resolve(ctx, "busy_handler") else {
            fatal("busy_handler", "context resolves to another slot kind");
        };
        c_int::from(invoke(&callback, |f| f(count)))
    })
}

pub(crate) unsafe extern "C" fn trace(
    event: c_uint,
    ctx: *mut c_void,
    stmt: *mut c_void,
    sql: *mut c_void,
) -> c_int {
    if event != ffi::SQLITE_TRACE_STMT as c_uint {
        return 0;
    }
    guarded("trace", || {
        let Callback::Trace { callback, expanded } = resolve(ctx, "trace") else {
            fatal("trace", "context resolves to another slot kind");
        };
        let text = unsafe {
            statement_text(stmt.cast::<ffi::sqlite3_stmt>(), sql.cast::<c_char>(), expanded)
        };
        invoke(&callback, |f| f(text.as_str()));
        0
    })
}

/// SQL for a traced statement: the expanded text when requested and
/// available, otherwise the text SQLite passed to the hook.
///
/// Trigger programs report `-- `-prefixed text (`-- TRIGGER name`, then each
/// trigger statement) against the parent statement's handle; expanding those
/// would repeat the parent SQL, so they are always reported raw.
unsafe fn statement_text(
    stmt: *mut ffi::sqlite3_stmt,
    raw: *const c_char,
    expanded: bool,
) -> String {
    let raw = unsafe { c_text(raw) };
    if expanded && !stmt.is_null() && !raw.starts_with("--") {
        let text = unsafe { ffi::sqlite3_expanded_sql(stmt) };
        if !text.is_null() {
            let owned = unsafe { CStr::from_ptr(text) }.to_string_lossy().into_owned();
            unsafe { ffi::sqlite3_free(text.cast()) };
            return owned;
        }
    }
    raw.into_owned()
}

pub(crate) unsafe extern "C" fn update(
    ctx: *mut c_void,
    op: c_int,
    db: *const c_char,
    table: *const c_char,
    rowid: ffi::sqlite3_int64,
) {
    guarded("update_hook", || {
        let Callback::Update(callback) = resolve(ctx, "update_hook") else {
            fatal("update_hook", "context resolves to another slot kind");
        };
        let (db, table) = unsafe { (c_text(db), c_text(table)) };
        invoke(&callback, |f| {
            f(UpdateOperation::from_code(op), &*db, &*table, rowid)
        });
    })
}

pub(crate) unsafe extern "C" fn commit(ctx: *mut c_void) -> c_int {
    guarded("commit_hook", || {
        let Callback::Commit(callback) = resolve(ctx, "commit_hook") else {
            fatal("commit_hook", "context resolves to another slot kind");
        };
        c_int::from(invoke(&callback, |f| f()))
    })
}

pub(crate) unsafe extern "C" fn rollback(ctx: *mut c_void) {
    guarded("rollback_hook", || {
        let Callback::Rollback(callback) = resolve(ctx, "rollback_hook") else {
            fatal("rollback_hook", "context resolves to another slot kind");
        };
        invoke(&callback, |f| f());
    })
}

pub(crate) unsafe extern "C" fn function(
    ctx: *mut ffi::sqlite3_context,
    argc: c_int,
    argv: *mut *mut ffi::sqlite3_value,
) {
    guarded("function", || {
        let user_data = unsafe { ffi::sqlite3_user_data(ctx) };
        let Callback::Function(callback) = resolve(user_data, "function") else {
            fatal("function", "context resolves to another slot kind");
        };
        let mut context = unsafe { FunctionContext::from_raw(ctx, argc, argv) };
        invoke(&callback, |f| f(&mut context));
    })
}

pub(crate) unsafe extern "C" fn collation(
    ctx: *mut c_void,
    lhs_len: c_int,
    lhs: *const c_void,
    rhs_len: c_int,
    rhs: *const c_void,
) -> c_int {
    guarded("collation", || {
        let Callback::Collation(callback) = resolve(ctx, "collation") else {
            fatal("collation", "context resolves to another slot kind");
        };
        let (lhs, rhs) = unsafe { (raw_bytes(lhs.cast(), lhs_len), raw_bytes(rhs.cast(), rhs_len)) };
        let (lhs, rhs) = (String::from_utf8_lossy(lhs), String::from_utf8_lossy(rhs));
        match invoke(&callback, |f| f(&*lhs, &*rhs)) {
            Ordering::Less => -1,
            Ordering::Equal => 0,
            Ordering::Greater => 1,
        }
    })
}

/// `xDestroy` for functions and collations: SQLite is done with the context.
pub(crate) unsafe extern "C" fn destroy(ctx: *mut c_void) {
    if let Some(key) = ContextKey::from_ptr(ctx) {
        drop(registry::discard(key));
    }
}
