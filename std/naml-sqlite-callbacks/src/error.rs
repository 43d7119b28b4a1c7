///
/// Callback adapter error types.
///
/// Registration calls surface SQLite's own status codes unchanged through
/// `CallbackError::Engine`. The remaining variants cover argument errors
/// detected before SQLite is reached and configuration loading.
///

use std::ffi::{CStr, NulError};
use std::os::raw::c_int;

use rusqlite::ffi;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CallbackError>;

#[derive(Debug, Error)]
pub enum CallbackError {
    #[error("SQLite error {code}: {message}")]
    Engine { code: i32, message: String },

    #[error("Invalid name '{name}': contains an interior NUL byte")]
    InvalidName { name: String },

    #[error("Unknown database handle {0}")]
    UnknownHandle(i64),

    #[error("Failed to parse bridge config: {0}")]
    Config(#[from] toml::de::Error),

    #[error("{0}")]
    Io(#[from] std::io::Error),
}

impl CallbackError {
    /// Builds an engine error from a raw status code returned by the C API.
    pub fn from_status(code: c_int) -> Self {
        CallbackError::Engine {
            code,
            message: status_message(code),
        }
    }

    pub(crate) fn invalid_name(name: &str, _err: NulError) -> Self {
        CallbackError::InvalidName {
            name: name.escape_default().to_string(),
        }
    }

    /// The SQLite status code reported across the C ABI for this error.
    pub fn status(&self) -> i32 {
        match self {
            CallbackError::Engine { code, .. } => *code,
            CallbackError::InvalidName { .. } | CallbackError::UnknownHandle(_) => {
                ffi::SQLITE_MISUSE
            }
            CallbackError::Config(_) | CallbackError::Io(_) => ffi::SQLITE_ERROR,
        }
    }
}

impl From<rusqlite::Error> for CallbackError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::SqliteFailure(inner, message) => CallbackError::Engine {
                code: inner.extended_code,
                message: message.unwrap_or_else(|| status_message(inner.extended_code)),
            },
            other => CallbackError::Engine {
                code: ffi::SQLITE_ERROR,
                message: other.to_string(),
            },
        }
    }
}

/// Converts a status code into `Ok(())` or an engine error.
pub(crate) fn check(code: c_int) -> Result<()> {
    if code == ffi::SQLITE_OK {
        Ok(())
    } else {
        Err(CallbackError::from_status(code))
    }
}

fn status_message(code: c_int) -> String {
    unsafe {
        let msg = ffi::sqlite3_errstr(code);
        if msg.is_null() {
            return format!("status {}", code);
        }
        CStr::from_ptr(msg).to_string_lossy().into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_status_passes_through() {
        let err = CallbackError::from_status(ffi::SQLITE_BUSY);
        assert_eq!(err.status(), ffi::SQLITE_BUSY);
        assert!(err.to_string().contains("SQLite error 5"));
    }

    #[test]
    fn test_check_ok_and_failure() {
        assert!(check(ffi::SQLITE_OK).is_ok());
        let err = check(ffi::SQLITE_MISUSE).unwrap_err();
        assert_eq!(err.status(), ffi::SQLITE_MISUSE);
    }

    #[test]
    fn test_adapter_errors_map_to_misuse() {
        let err = CallbackError::UnknownHandle(7);
        assert_eq!(err.status(), ffi::SQLITE_MISUSE);
        assert!(err.to_string().contains("7"));

        let nul = std::ffi::CString::new("a\0b").unwrap_err();
        let err = CallbackError::invalid_name("a\0b", nul);
        assert_eq!(err.status(), ffi::SQLITE_MISUSE);
        assert!(err.to_string().contains("a\\u{0}b"));
    }

    #[test]
    fn test_rusqlite_failure_keeps_extended_code() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let err: CallbackError = conn.execute_batch("NOT VALID SQL").unwrap_err().into();
        assert_eq!(err.status(), ffi::SQLITE_ERROR);
    }
}
