///
/// FTS3/FTS4 tokenizer export.
///
/// The host tokenizer is called as
/// fn(data, input, input_len, *offset, *length, *token_len) -> token.
/// `input` is the text still to tokenize; `*offset` is where it starts in
/// the full document and `*length` is zero. The host adds the bytes it
/// skipped to `*offset`, stores the token's byte length in the input in
/// `*length` and returns the normalized token text with its length in
/// `*token_len`, or null when the input is exhausted. The returned text only
/// needs to stay valid until the host function is called again.
///

use naml_sqlite_callbacks::TokenSpan;

use crate::closure::HostClosure;
use crate::handles::{config, text_arg, with_handle};

type TokenizeFn = extern "C" fn(*mut u8, *const u8, i64, *mut i64, *mut i64, *mut i64) -> *const u8;

/// Registers the tokenizer `name` under the FTS3 module `module`. An empty
/// module name selects the configured default module.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn naml_db_sqlite_register_tokenizer(
    handle: i64,
    module: *const u8,
    module_len: i64,
    name: *const u8,
    name_len: i64,
    func_ptr: i64,
    data_ptr: i64,
    data_size: i64,
) -> i32 {
    let mut module = text_arg(module, module_len);
    if module.is_empty() {
        module = config().tokenizer.module;
    }
    let name = text_arg(name, name_len);
    let callback = HostClosure::new(func_ptr, data_ptr, data_size).map(|closure| {
        let func: TokenizeFn = unsafe { std::mem::transmute(closure.func_ptr()) };
        move |input: &str, span: &mut TokenSpan| -> Option<String> {
            let mut offset = span.offset as i64;
            let mut length = 0i64;
            let mut token_len = 0i64;
            let token = func(
                closure.data(),
                input.as_ptr(),
                input.len() as i64,
                &mut offset,
                &mut length,
                &mut token_len,
            );
            if token.is_null() || offset < 0 || length < 0 {
                return None;
            }
            span.offset = offset as usize;
            span.length = length as usize;
            Some(text_arg(token, token_len))
        }
    });
    with_handle(handle, |h| h.register_tokenizer(&module, &name, callback))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handles::{naml_db_sqlite_close, naml_db_sqlite_exec, naml_db_sqlite_open_memory, with_handle};
    use naml_sqlite_callbacks::rusqlite::ffi;
    use std::cell::RefCell;

    thread_local! {
        static TOKEN: RefCell<Vec<u8>> = const { RefCell::new(Vec::new()) };
    }

    /// Splits on ASCII whitespace and upper-cases each token.
    extern "C" fn upper_words(
        _data: *mut u8,
        input: *const u8,
        input_len: i64,
        offset: *mut i64,
        length: *mut i64,
        token_len: *mut i64,
    ) -> *const u8 {
        let input = unsafe { std::slice::from_raw_parts(input, input_len as usize) };
        let Some(start) = input.iter().position(|b| !b.is_ascii_whitespace()) else {
            return std::ptr::null();
        };
        let end = input[start..]
            .iter()
            .position(|b| b.is_ascii_whitespace())
            .map_or(input.len(), |n| start + n);
        TOKEN.with(|token| {
            let mut token = token.borrow_mut();
            *token = input[start..end].to_ascii_uppercase();
            unsafe {
                *offset += start as i64;
                *length = (end - start) as i64;
                *token_len = token.len() as i64;
            }
            token.as_ptr()
        })
    }

    fn exec(handle: i64, sql: &str) -> i32 {
        unsafe { naml_db_sqlite_exec(handle, sql.as_ptr(), sql.len() as i64) }
    }

    fn register(handle: i64, module: &str, name: &str, func: i64) -> i32 {
        unsafe {
            naml_db_sqlite_register_tokenizer(
                handle,
                module.as_ptr(),
                module.len() as i64,
                name.as_ptr(),
                name.len() as i64,
                func,
                0,
                0,
            )
        }
    }

    #[test]
    fn test_host_tokenizer_under_default_module() {
        let handle = naml_db_sqlite_open_memory();
        assert_eq!(register(handle, "", "upper", upper_words as *const () as i64), ffi::SQLITE_OK);
        assert_eq!(
            exec(
                handle,
                r#"CREATE VIRTUAL TABLE notes USING fts4(body, tokenize=naml "upper");
                   INSERT INTO notes (body) VALUES ('alpha  beta'), ('gamma');"#,
            ),
            ffi::SQLITE_OK
        );

        let mut hits = Vec::new();
        with_handle(handle, |h| {
            let mut stmt = h
                .connection()
                .prepare("SELECT rowid, offsets(notes) FROM notes WHERE notes MATCH 'beta'")?;
            hits = stmt
                .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(())
        });
        assert_eq!(hits, vec![(1, "0 0 7 4".to_string())]);

        assert_eq!(register(handle, "", "upper", 0), ffi::SQLITE_OK);
        assert_ne!(exec(handle, "INSERT INTO notes (body) VALUES ('delta')"), ffi::SQLITE_OK);
        assert_eq!(naml_db_sqlite_close(handle), ffi::SQLITE_OK);
    }

    #[test]
    fn test_tokenizer_on_unknown_handle() {
        assert_eq!(
            register(-3, "naml", "upper", upper_words as *const () as i64),
            ffi::SQLITE_MISUSE
        );
    }
}
