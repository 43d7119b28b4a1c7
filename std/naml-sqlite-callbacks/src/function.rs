///
/// Evaluation context handed to SQL function closures.
///
/// Wraps the raw `sqlite3_context` and argument array for the duration of
/// one call. Arguments are read as `rusqlite::types::ValueRef`; the result is
/// delivered through the context rather than returned, so a closure that
/// sets nothing yields SQL NULL.
///

use std::os::raw::c_int;

use rusqlite::ffi;
use rusqlite::types::{Value, ValueRef};

pub struct FunctionContext<'a> {
    ctx: *mut ffi::sqlite3_context,
    args: &'a [*mut ffi::sqlite3_value],
}

impl<'a> FunctionContext<'a> {
    /// # Safety
    ///
    /// `ctx` must be the context of an in-progress function call and `argv`
    /// must point to `argc` values owned by that call.
    pub(crate) unsafe fn from_raw(
        ctx: *mut ffi::sqlite3_context,
        argc: c_int,
        argv: *mut *mut ffi::sqlite3_value,
    ) -> Self {
        let args = if argv.is_null() || argc <= 0 {
            &[][..]
        } else {
            unsafe { std::slice::from_raw_parts(argv, argc as usize) }
        };
        Self { ctx, args }
    }

    pub fn arg_count(&self) -> usize {
        self.args.len()
    }

    /// Argument `index`, or NULL when the call has fewer arguments.
    pub fn arg(&self, index: usize) -> ValueRef<'_> {
        match self.args.get(index) {
            Some(&value) => unsafe { value_ref(value) },
            None => ValueRef::Null,
        }
    }

    pub fn args(&self) -> Vec<Value> {
        (0..self.args.len()).map(|i| Value::from(self.arg(i))).collect()
    }

    pub fn set_result<V: Into<Value>>(&mut self, value: V) {
        let ctx = self.ctx;
        unsafe {
            match value.into() {
                Value::Null => ffi::sqlite3_result_null(ctx),
                Value::Integer(i) => ffi::sqlite3_result_int64(ctx, i),
                Value::Real(r) => ffi::sqlite3_result_double(ctx, r),
                Value::Text(s) => match c_int::try_from(s.len()) {
                    Ok(len) => ffi::sqlite3_result_text(
                        ctx,
                        s.as_ptr().cast(),
                        len,
                        ffi::SQLITE_TRANSIENT(),
                    ),
                    Err(_) => ffi::sqlite3_result_error_toobig(ctx),
                },
                Value::Blob(b) => match c_int::try_from(b.len()) {
                    Ok(len) => ffi::sqlite3_result_blob(
                        ctx,
                        b.as_ptr().cast(),
                        len,
                        ffi::SQLITE_TRANSIENT(),
                    ),
                    Err(_) => ffi::sqlite3_result_error_toobig(ctx),
                },
            }
        }
    }

    /// Fails the SQL statement evaluating this call with `message`.
    pub fn set_error(&mut self, message: &str) {
        let len = c_int::try_from(message.len()).unwrap_or(c_int::MAX);
        unsafe { ffi::sqlite3_result_error(self.ctx, message.as_ptr().cast(), len) }
    }

    pub fn as_ptr(&self) -> *mut ffi::sqlite3_context {
        self.ctx
    }
}

unsafe fn value_ref<'a>(value: *mut ffi::sqlite3_value) -> ValueRef<'a> {
    unsafe {
        match ffi::sqlite3_value_type(value) {
            ffi::SQLITE_INTEGER => ValueRef::Integer(ffi::sqlite3_value_int64(value)),
            ffi::SQLITE_FLOAT => ValueRef::Real(ffi::sqlite3_value_double(value)),
            ffi::SQLITE_TEXT => {
                let text = ffi::sqlite3_value_text(value);
                let len = ffi::sqlite3_value_bytes(value);
                ValueRef::Text(raw_bytes(text, len))
            }
            ffi::SQLITE_BLOB => {
                let blob = ffi::sqlite3_value_blob(value);
                let len = ffi::sqlite3_value_bytes(value);
                ValueRef::Blob(raw_bytes(blob.cast(), len))
            }
            _ => ValueRef::Null,
        }
    }
}

/// Borrows `len` bytes at `ptr`; SQLite uses a null pointer for empty values.
pub(crate) unsafe fn raw_bytes<'a>(ptr: *const u8, len: c_int) -> &'a [u8] {
    if ptr.is_null() || len <= 0 {
        &[]
    } else {
        unsafe { std::slice::from_raw_parts(ptr, len as usize) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_bytes_handles_null_and_empty() {
        assert!(unsafe { raw_bytes(std::ptr::null(), 4) }.is_empty());
        let data = b"abc";
        assert!(unsafe { raw_bytes(data.as_ptr(), 0) }.is_empty());
        assert_eq!(unsafe { raw_bytes(data.as_ptr(), 2) }, b"ab");
    }

    #[test]
    fn test_missing_arguments_read_as_null() {
        let ctx = unsafe { FunctionContext::from_raw(std::ptr::null_mut(), 0, std::ptr::null_mut()) };
        assert_eq!(ctx.arg_count(), 0);
        assert_eq!(ctx.arg(3), ValueRef::Null);
        assert!(ctx.args().is_empty());
    }
}
