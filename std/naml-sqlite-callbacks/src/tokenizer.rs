///
/// FTS3/FTS4 tokenizer bridge.
///
/// SQLite's full-text engine loads tokenizers through a C vtable
/// (`sqlite3_tokenizer_module`, version 0) bound to a module name with
/// `SELECT fts3_tokenizer(name, pointer)`. Each handle gets its own module
/// instance per module name; the instance records which handle it belongs
/// to, so a table declared with
///
/// ```sql
/// CREATE VIRTUAL TABLE docs USING fts4(body, tokenize=naml "words")
/// ```
///
/// resolves the tokenizer `words` in that handle's slots when a cursor opens.
///
/// ## Cursor Protocol
///
/// Before each call the cursor advances `offset` by the previous `length`
/// and resets `length`. The closure receives the input from `offset` on,
/// adds the bytes it skipped to `span.offset`, sets `span.length` to the byte
/// length of the token in the input and returns the token text. `None`, a
/// span outside the input, or a step that does not move past the previous
/// token ends tokenization.
///
/// Input must be UTF-8. Offsets always index the raw FTS input, so the
/// closure only ever sees the valid UTF-8 prefix of the remaining bytes and
/// tokenization ends at the first byte that does not decode.
///
/// The closure is captured when the cursor opens, so clearing or replacing a
/// tokenizer only affects cursors opened afterwards. FTS3 offers no way to
/// unbind a module; module instances live until their handle has closed.
///

use std::ffi::CStr;
use std::os::raw::{c_char, c_int};
use std::ptr;

use rusqlite::config::DbConfig;
use rusqlite::{Connection, ffi, params};
use tracing::warn;

use crate::error::Result;
use crate::registry::{self, Callback, HandleId, Shared, TokenizeFn};
use crate::slot::Slot;
use crate::trampoline::{fatal, guarded};

/// Byte span of the current token within the cursor's input.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenSpan {
    pub offset: usize,
    pub length: usize,
}

#[allow(dead_code)]
#[repr(C)]
struct ModuleVtable {
    version: c_int,
    create: Option<unsafe extern "C" fn(c_int, *const *const c_char, *mut *mut RawTokenizer) -> c_int>,
    destroy: Option<unsafe extern "C" fn(*mut RawTokenizer) -> c_int>,
    open: Option<
        unsafe extern "C" fn(*mut RawTokenizer, *const c_char, c_int, *mut *mut RawCursor) -> c_int,
    >,
    close: Option<unsafe extern "C" fn(*mut RawCursor) -> c_int>,
    next: Option<
        unsafe extern "C" fn(
            *mut RawCursor,
            *mut *const c_char,
            *mut c_int,
            *mut c_int,
            *mut c_int,
            *mut c_int,
        ) -> c_int,
    >,
}

/// `sqlite3_tokenizer`: FTS3 fills in `module` after `xCreate` returns.
#[repr(C)]
struct RawTokenizer {
    module: *const ModuleVtable,
}

/// `sqlite3_tokenizer_cursor`: FTS3 fills in `tokenizer` after `xOpen`.
#[allow(dead_code)]
#[repr(C)]
struct RawCursor {
    tokenizer: *mut RawTokenizer,
}

/// A module instance bound to one handle under one module name.
#[repr(C)]
pub(crate) struct TokenizerModule {
    vtable: ModuleVtable,
    handle: HandleId,
    name: String,
}

#[repr(C)]
struct NamedTokenizer {
    base: RawTokenizer,
    name: String,
}

#[allow(dead_code)]
#[repr(C)]
struct TokenCursor {
    base: RawCursor,
    input: *const u8,
    input_len: usize,
    span: TokenSpan,
    position: c_int,
    token: Vec<u8>,
    callback: Shared<TokenizeFn>,
}

impl TokenizerModule {
    pub(crate) fn new(handle: HandleId, name: &str) -> Box<Self> {
        Box::new(Self {
            vtable: ModuleVtable {
                version: 0,
                create: Some(create),
                destroy: Some(destroy),
                open: Some(open),
                close: Some(close),
                next: Some(next),
            },
            handle,
            name: name.to_string(),
        })
    }

    /// Makes this instance the FTS3 tokenizer module called `self.name` on
    /// `conn`. The instance must outlive the connection.
    pub(crate) fn bind(&self, conn: &Connection) -> Result<()> {
        conn.set_db_config(DbConfig::SQLITE_DBCONFIG_ENABLE_FTS3_TOKENIZER, true)?;
        let address = (self as *const TokenizerModule as usize).to_ne_bytes();
        conn.query_row(
            "SELECT fts3_tokenizer(?1, ?2)",
            params![self.name, &address[..]],
            |_| Ok(()),
        )?;
        Ok(())
    }
}

impl TokenCursor {
    fn input(&self) -> &[u8] {
        if self.input.is_null() {
            &[]
        } else {
            unsafe { std::slice::from_raw_parts(self.input, self.input_len) }
        }
    }

    /// Moves to the next token, returning its start and end byte offsets.
    fn advance(&mut self) -> Option<(usize, usize)> {
        let consumed = self.span.offset.checked_add(self.span.length)?;
        if consumed > self.input_len {
            return None;
        }
        self.span = TokenSpan {
            offset: consumed,
            length: 0,
        };

        let text = utf8_prefix(&self.input()[consumed..]);
        if text.is_empty() && consumed < self.input_len {
            warn!(offset = consumed, "tokenizer input is not valid UTF-8");
            return None;
        }
        let limit = consumed + text.len();
        let mut span = self.span;
        let token = registry::invoke(&self.callback, |f| f(text, &mut span))?;
        self.span = span;

        let end = span.offset.checked_add(span.length)?;
        if end > limit {
            warn!(offset = span.offset, length = span.length, "tokenizer span is outside its input");
            return None;
        }
        if end <= consumed {
            warn!(offset = span.offset, "tokenizer made no progress");
            return None;
        }
        self.token = token.into_bytes();
        Some((span.offset, end))
    }
}

/// Longest prefix of `bytes` that is valid UTF-8.
fn utf8_prefix(bytes: &[u8]) -> &str {
    match std::str::from_utf8(bytes) {
        Ok(text) => text,
        Err(err) => std::str::from_utf8(&bytes[..err.valid_up_to()]).unwrap_or_default(),
    }
}

unsafe extern "C" fn create(
    argc: c_int,
    argv: *const *const c_char,
    out: *mut *mut RawTokenizer,
) -> c_int {
    if argc < 1 || argv.is_null() {
        return ffi::SQLITE_ERROR;
    }
    let first = unsafe { *argv };
    if first.is_null() {
        return ffi::SQLITE_ERROR;
    }
    let name = unsafe { CStr::from_ptr(first) }.to_string_lossy().into_owned();
    let tokenizer = Box::new(NamedTokenizer {
        base: RawTokenizer {
            module: ptr::null(),
        },
        name,
    });
    unsafe { *out = Box::into_raw(tokenizer).cast() };
    ffi::SQLITE_OK
}

unsafe extern "C" fn destroy(tokenizer: *mut RawTokenizer) -> c_int {
    if !tokenizer.is_null() {
        drop(unsafe { Box::from_raw(tokenizer.cast::<NamedTokenizer>()) });
    }
    ffi::SQLITE_OK
}

unsafe extern "C" fn open(
    tokenizer: *mut RawTokenizer,
    input: *const c_char,
    len: c_int,
    out: *mut *mut RawCursor,
) -> c_int {
    let tokenizer = unsafe { &*tokenizer.cast::<NamedTokenizer>() };
    if tokenizer.base.module.is_null() {
        fatal("tokenizer", "tokenizer opened before FTS3 assigned its module");
    }
    let module = unsafe { &*tokenizer.base.module.cast::<TokenizerModule>() };
    let slot = Slot::tokenizer(&module.name, &tokenizer.name);

    let callback = match registry::resolve_active(module.handle, &slot) {
        Some(Callback::Tokenizer(callback)) => callback,
        Some(_) => fatal("tokenizer", "slot holds a closure of another kind"),
        None => {
            warn!(handle = %module.handle, %slot, "no tokenizer registered");
            return ffi::SQLITE_ERROR;
        }
    };

    let input_len = if input.is_null() {
        0
    } else if len < 0 {
        unsafe { CStr::from_ptr(input) }.to_bytes().len()
    } else {
        len as usize
    };
    let cursor = Box::new(TokenCursor {
        base: RawCursor {
            tokenizer: ptr::null_mut(),
        },
        input: input.cast(),
        input_len,
        span: TokenSpan::default(),
        position: 0,
        token: Vec::new(),
        callback,
    });
    unsafe { *out = Box::into_raw(cursor).cast() };
    ffi::SQLITE_OK
}

unsafe extern "C" fn close(cursor: *mut RawCursor) -> c_int {
    if !cursor.is_null() {
        drop(unsafe { Box::from_raw(cursor.cast::<TokenCursor>()) });
    }
    ffi::SQLITE_OK
}

unsafe extern "C" fn next(
    cursor: *mut RawCursor,
    token: *mut *const c_char,
    token_len: *mut c_int,
    start: *mut c_int,
    end: *mut c_int,
    position: *mut c_int,
) -> c_int {
    let cursor = unsafe { &mut *cursor.cast::<TokenCursor>() };
    let Some((from, to)) = guarded("tokenizer", || cursor.advance()) else {
        return ffi::SQLITE_DONE;
    };
    let (Ok(bytes), Ok(from), Ok(to)) = (
        c_int::try_from(cursor.token.len()),
        c_int::try_from(from),
        c_int::try_from(to),
    ) else {
        return ffi::SQLITE_DONE;
    };
    unsafe {
        *token = cursor.token.as_ptr().cast();
        *token_len = bytes;
        *start = from;
        *end = to;
        *position = cursor.position;
    }
    cursor.position += 1;
    ffi::SQLITE_OK
}
