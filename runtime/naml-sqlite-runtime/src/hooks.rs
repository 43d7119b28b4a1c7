///
/// Busy handler, trace and transaction hook exports.
///
/// Each export takes the target handle and a naml closure triple. A zero
/// `func_ptr` clears the slot. Host function signatures:
///
/// - busy:     fn(data, count) -> i64, non-zero retries
/// - trace:    fn(data, sql)
/// - update:   fn(data, op, db, table, rowid), op is SQLite's action code
/// - commit:   fn(data) -> i64, non-zero turns the commit into a rollback
/// - rollback: fn(data)
///
/// Strings are NUL-terminated and only valid for the duration of the call.
///

use std::ffi::{CString, c_char};

use naml_sqlite_callbacks::UpdateOperation;

use crate::closure::HostClosure;
use crate::handles::with_handle;

type BusyFn = extern "C" fn(*mut u8, i64) -> i64;
type TraceFn = extern "C" fn(*mut u8, *const c_char);
type UpdateFn = extern "C" fn(*mut u8, i64, *const c_char, *const c_char, i64);
type CommitFn = extern "C" fn(*mut u8) -> i64;
type RollbackFn = extern "C" fn(*mut u8);

fn c_string(text: &str) -> CString {
    CString::new(text).unwrap_or_default()
}

#[unsafe(no_mangle)]
pub extern "C" fn naml_db_sqlite_busy_handler(
    handle: i64,
    func_ptr: i64,
    data_ptr: i64,
    data_size: i64,
) -> i32 {
    let callback = HostClosure::new(func_ptr, data_ptr, data_size).map(|closure| {
        let func: BusyFn = unsafe { std::mem::transmute(closure.func_ptr()) };
        move |count: i32| func(closure.data(), i64::from(count)) != 0
    });
    with_handle(handle, |h| h.busy_handler(callback))
}

#[unsafe(no_mangle)]
pub extern "C" fn naml_db_sqlite_trace(
    handle: i64,
    func_ptr: i64,
    data_ptr: i64,
    data_size: i64,
) -> i32 {
    let callback = HostClosure::new(func_ptr, data_ptr, data_size).map(|closure| {
        let func: TraceFn = unsafe { std::mem::transmute(closure.func_ptr()) };
        move |sql: &str| {
            let sql = c_string(sql);
            func(closure.data(), sql.as_ptr());
        }
    });
    with_handle(handle, |h| h.trace(callback))
}

#[unsafe(no_mangle)]
pub extern "C" fn naml_db_sqlite_update_hook(
    handle: i64,
    func_ptr: i64,
    data_ptr: i64,
    data_size: i64,
) -> i32 {
    let callback = HostClosure::new(func_ptr, data_ptr, data_size).map(|closure| {
        let func: UpdateFn = unsafe { std::mem::transmute(closure.func_ptr()) };
        move |op: UpdateOperation, db: &str, table: &str, rowid: i64| {
            let (db, table) = (c_string(db), c_string(table));
            func(
                closure.data(),
                i64::from(op.code()),
                db.as_ptr(),
                table.as_ptr(),
                rowid,
            );
        }
    });
    with_handle(handle, |h| h.update_hook(callback))
}

#[unsafe(no_mangle)]
pub extern "C" fn naml_db_sqlite_commit_hook(
    handle: i64,
    func_ptr: i64,
    data_ptr: i64,
    data_size: i64,
) -> i32 {
    let callback = HostClosure::new(func_ptr, data_ptr, data_size).map(|closure| {
        let func: CommitFn = unsafe { std::mem::transmute(closure.func_ptr()) };
        move || func(closure.data()) != 0
    });
    with_handle(handle, |h| h.commit_hook(callback))
}

#[unsafe(no_mangle)]
pub extern "C" fn naml_db_sqlite_rollback_hook(
    handle: i64,
    func_ptr: i64,
    data_ptr: i64,
    data_size: i64,
) -> i32 {
    let callback = HostClosure::new(func_ptr, data_ptr, data_size).map(|closure| {
        let func: RollbackFn = unsafe { std::mem::transmute(closure.func_ptr()) };
        move || func(closure.data())
    });
    with_handle(handle, |h| h.rollback_hook(callback))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handles::{naml_db_sqlite_close, naml_db_sqlite_exec, naml_db_sqlite_open_memory};
    use naml_sqlite_callbacks::rusqlite::ffi;
    use std::ffi::CStr;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicI64, Ordering};

    static UPDATES: Mutex<Vec<(i64, String, i64)>> = Mutex::new(Vec::new());
    static TRACED: Mutex<Vec<String>> = Mutex::new(Vec::new());
    static COMMITS: AtomicI64 = AtomicI64::new(0);
    static ROLLBACKS: AtomicI64 = AtomicI64::new(0);

    extern "C" fn record_update(_data: *mut u8, op: i64, _db: *const c_char, table: *const c_char, rowid: i64) {
        let table = unsafe { CStr::from_ptr(table) }.to_string_lossy().into_owned();
        UPDATES.lock().unwrap().push((op, table, rowid));
    }

    extern "C" fn record_trace(data: *mut u8, sql: *const c_char) {
        let tag = unsafe { *(data as *const i64) };
        let sql = unsafe { CStr::from_ptr(sql) }.to_string_lossy().into_owned();
        TRACED.lock().unwrap().push(format!("{}:{}", tag, sql));
    }

    extern "C" fn refuse_commit(_data: *mut u8) -> i64 {
        COMMITS.fetch_add(1, Ordering::SeqCst);
        1
    }

    extern "C" fn count_rollback(_data: *mut u8) {
        ROLLBACKS.fetch_add(1, Ordering::SeqCst);
    }

    fn exec(handle: i64, sql: &str) -> i32 {
        unsafe { naml_db_sqlite_exec(handle, sql.as_ptr(), sql.len() as i64) }
    }

    #[test]
    fn test_update_hook_receives_action_codes() {
        let handle = naml_db_sqlite_open_memory();
        exec(handle, "CREATE TABLE pets (name TEXT)");
        let status = naml_db_sqlite_update_hook(handle, record_update as *const () as i64, 0, 0);
        assert_eq!(status, ffi::SQLITE_OK);

        exec(handle, "INSERT INTO pets VALUES ('rex'); DELETE FROM pets;");
        naml_db_sqlite_update_hook(handle, 0, 0, 0);
        exec(handle, "INSERT INTO pets VALUES ('tom')");

        let updates = UPDATES.lock().unwrap().clone();
        assert_eq!(
            updates,
            vec![
                (i64::from(ffi::SQLITE_INSERT), "pets".to_string(), 1),
                (i64::from(ffi::SQLITE_DELETE), "pets".to_string(), 1),
            ]
        );
        assert_eq!(naml_db_sqlite_close(handle), ffi::SQLITE_OK);
    }

    #[test]
    fn test_trace_passes_closure_data() {
        let handle = naml_db_sqlite_open_memory();
        let (data, size) = crate::closure::tests::closure_data(9);
        naml_db_sqlite_trace(handle, record_trace as *const () as i64, data, size);
        exec(handle, "SELECT 1");
        naml_db_sqlite_trace(handle, 0, 0, 0);
        exec(handle, "SELECT 2");

        assert_eq!(*TRACED.lock().unwrap(), vec!["9:SELECT 1".to_string()]);
        naml_db_sqlite_close(handle);
    }

    #[test]
    fn test_commit_refusal_rolls_back() {
        let handle = naml_db_sqlite_open_memory();
        exec(handle, "CREATE TABLE t (x)");
        naml_db_sqlite_rollback_hook(handle, count_rollback as *const () as i64, 0, 0);
        naml_db_sqlite_commit_hook(handle, refuse_commit as *const () as i64, 0, 0);

        let status = exec(handle, "INSERT INTO t VALUES (1)");
        assert_eq!(status, ffi::SQLITE_CONSTRAINT_COMMITHOOK);
        assert_eq!(COMMITS.load(Ordering::SeqCst), 1);
        assert_eq!(ROLLBACKS.load(Ordering::SeqCst), 1);
        naml_db_sqlite_close(handle);
    }

    #[test]
    fn test_clearing_unregistered_hooks() {
        let handle = naml_db_sqlite_open_memory();
        assert_eq!(naml_db_sqlite_busy_handler(handle, 0, 0, 0), ffi::SQLITE_OK);
        assert_eq!(naml_db_sqlite_trace(handle, 0, 0, 0), ffi::SQLITE_OK);
        assert_eq!(naml_db_sqlite_update_hook(handle, 0, 0, 0), ffi::SQLITE_OK);
        assert_eq!(naml_db_sqlite_commit_hook(handle, 0, 0, 0), ffi::SQLITE_OK);
        assert_eq!(naml_db_sqlite_rollback_hook(handle, 0, 0, 0), ffi::SQLITE_OK);
        assert_eq!(naml_db_sqlite_close(handle), ffi::SQLITE_OK);
    }

    #[test]
    fn test_hooks_on_unknown_handle() {
        let (data, size) = crate::closure::tests::closure_data(1);
        let status = naml_db_sqlite_rollback_hook(-1, count_rollback as *const () as i64, data, size);
        assert_eq!(status, ffi::SQLITE_MISUSE);
    }
}
