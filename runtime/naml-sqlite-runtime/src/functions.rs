///
/// SQL function and collation exports.
///
/// A host SQL function is called as fn(data, ctx, argc). `ctx` is only valid
/// during that call; the function reads its arguments and delivers its
/// result through the `naml_db_sqlite_fn_*` exports. Setting no result
/// yields SQL NULL.
///
/// A host collation is called as fn(data, lhs, lhs_len, rhs, rhs_len) with
/// UTF-8 byte strings and returns a negative, zero or positive i64.
///

use std::cmp::Ordering;
use std::ffi::c_void;

use naml_sqlite_callbacks::FunctionContext;
use naml_sqlite_callbacks::rusqlite::ffi;
use naml_sqlite_callbacks::rusqlite::types::ValueRef;

use crate::closure::HostClosure;
use crate::handles::{text_arg, with_handle};

type FunctionFn = extern "C" fn(*mut u8, *mut c_void, i64);
type CollationFn = extern "C" fn(*mut u8, *const u8, i64, *const u8, i64) -> i64;

/// Registers, replaces or (with `func_ptr == 0`) deletes the SQL function
/// `name` taking `argc` arguments, `-1` for any number.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn naml_db_sqlite_create_function(
    handle: i64,
    name: *const u8,
    name_len: i64,
    argc: i64,
    deterministic: i64,
    func_ptr: i64,
    data_ptr: i64,
    data_size: i64,
) -> i32 {
    let name = text_arg(name, name_len);
    let callback = HostClosure::new(func_ptr, data_ptr, data_size).map(|closure| {
        let func: FunctionFn = unsafe { std::mem::transmute(closure.func_ptr()) };
        move |ctx: &mut FunctionContext<'_>| {
            let argc = ctx.arg_count() as i64;
            func(closure.data(), (ctx as *mut FunctionContext<'_>).cast(), argc);
        }
    });
    let Ok(arity) = i32::try_from(argc) else {
        return ffi::SQLITE_MISUSE;
    };
    with_handle(handle, |h| {
        h.create_function(&name, arity, deterministic != 0, callback)
    })
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn naml_db_sqlite_create_collation(
    handle: i64,
    name: *const u8,
    name_len: i64,
    func_ptr: i64,
    data_ptr: i64,
    data_size: i64,
) -> i32 {
    let name = text_arg(name, name_len);
    let callback = HostClosure::new(func_ptr, data_ptr, data_size).map(|closure| {
        let func: CollationFn = unsafe { std::mem::transmute(closure.func_ptr()) };
        move |lhs: &str, rhs: &str| -> Ordering {
            func(
                closure.data(),
                lhs.as_ptr(),
                lhs.len() as i64,
                rhs.as_ptr(),
                rhs.len() as i64,
            )
            .cmp(&0)
        }
    });
    with_handle(handle, |h| h.create_collation(&name, callback))
}

fn with_context<R>(ctx: *mut c_void, fallback: R, f: impl FnOnce(&mut FunctionContext<'_>) -> R) -> R {
    if ctx.is_null() {
        return fallback;
    }
    let ctx = unsafe { &mut *ctx.cast::<FunctionContext<'_>>() };
    f(ctx)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn naml_db_sqlite_fn_arg_count(ctx: *mut c_void) -> i64 {
    with_context(ctx, 0, |c| c.arg_count() as i64)
}

/// SQLite fundamental type code of argument `index` (`SQLITE_NULL` when out
/// of range).
#[unsafe(no_mangle)]
pub unsafe extern "C" fn naml_db_sqlite_fn_arg_type(ctx: *mut c_void, index: i64) -> i64 {
    with_context(ctx, i64::from(ffi::SQLITE_NULL), |c| {
        let code = match c.arg(index as usize) {
            ValueRef::Null => ffi::SQLITE_NULL,
            ValueRef::Integer(_) => ffi::SQLITE_INTEGER,
            ValueRef::Real(_) => ffi::SQLITE_FLOAT,
            ValueRef::Text(_) => ffi::SQLITE_TEXT,
            ValueRef::Blob(_) => ffi::SQLITE_BLOB,
        };
        i64::from(code)
    })
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn naml_db_sqlite_fn_arg_int(ctx: *mut c_void, index: i64) -> i64 {
    with_context(ctx, 0, |c| match c.arg(index as usize) {
        ValueRef::Integer(i) => i,
        ValueRef::Real(r) => r as i64,
        ValueRef::Text(t) => std::str::from_utf8(t)
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0),
        _ => 0,
    })
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn naml_db_sqlite_fn_arg_float(ctx: *mut c_void, index: i64) -> f64 {
    with_context(ctx, 0.0, |c| match c.arg(index as usize) {
        ValueRef::Integer(i) => i as f64,
        ValueRef::Real(r) => r,
        ValueRef::Text(t) => std::str::from_utf8(t)
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0.0),
        _ => 0.0,
    })
}

/// Bytes of a TEXT or BLOB argument, valid until the host function returns.
/// Other types yield null with a zero length.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn naml_db_sqlite_fn_arg_text(
    ctx: *mut c_void,
    index: i64,
    out_len: *mut i64,
) -> *const u8 {
    let (ptr, len) = with_context(ctx, (std::ptr::null(), 0), |c| match c.arg(index as usize) {
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => (bytes.as_ptr(), bytes.len() as i64),
        _ => (std::ptr::null(), 0),
    });
    if !out_len.is_null() {
        unsafe { *out_len = len };
    }
    ptr
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn naml_db_sqlite_fn_result_int(ctx: *mut c_void, value: i64) {
    with_context(ctx, (), |c| c.set_result(value))
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn naml_db_sqlite_fn_result_float(ctx: *mut c_void, value: f64) {
    with_context(ctx, (), |c| c.set_result(value))
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn naml_db_sqlite_fn_result_text(ctx: *mut c_void, text: *const u8, len: i64) {
    let text = text_arg(text, len);
    with_context(ctx, (), |c| c.set_result(text))
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn naml_db_sqlite_fn_result_null(ctx: *mut c_void) {
    with_context(ctx, (), |c| c.set_result(naml_sqlite_callbacks::rusqlite::types::Null))
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn naml_db_sqlite_fn_result_error(ctx: *mut c_void, message: *const u8, len: i64) {
    let message = text_arg(message, len);
    with_context(ctx, (), |c| c.set_error(&message))
}
