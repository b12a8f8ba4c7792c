//! FFI bindings for the weight tracker
//!
//! C-compatible entry points for hosting a [`TrackerSession`] from another UI
//! runtime. Strings are null-terminated UTF-8. Returned strings are allocated here
//! and must be released with `wt_free_string`.

use std::cell::RefCell;
use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::ptr;
use std::sync::Arc;

use crate::config::TrackerConfig;
use crate::error::SessionError;
use crate::session::TrackerSession;
use crate::store::SqliteStore;
use crate::types::SampleId;

thread_local! {
    static LAST_ERROR: RefCell<Option<CString>> = const { RefCell::new(None) };
}

fn set_last_error(msg: &str) {
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = CString::new(msg).ok();
    });
}

fn clear_last_error() {
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = None;
    });
}

unsafe fn cstr_to_string(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    CStr::from_ptr(ptr).to_str().ok().map(|s| s.to_string())
}

/// Like `cstr_to_string`, but records an error naming `what` when it fails
unsafe fn required_string(ptr: *const c_char, what: &str) -> Option<String> {
    let value = cstr_to_string(ptr);
    if value.is_none() {
        set_last_error(&format!("Invalid {} string pointer", what));
    }
    value
}

fn string_to_cstr(s: &str) -> *mut c_char {
    match CString::new(s) {
        Ok(cstr) => cstr.into_raw(),
        Err(_) => ptr::null_mut(),
    }
}

/// Map a session result onto the 0 / -1 status convention
fn status(result: Result<(), SessionError>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(e) => {
            set_last_error(&e.to_string());
            -1
        }
    }
}

fn json_or_null<T: serde::Serialize>(value: &T) -> *mut c_char {
    match serde_json::to_string(value) {
        Ok(json) => string_to_cstr(&json),
        Err(e) => {
            set_last_error(&e.to_string());
            ptr::null_mut()
        }
    }
}

// ============================================================================
// Session lifecycle
// ============================================================================

/// Opaque handle to a TrackerSession
pub struct WtSessionHandle {
    session: TrackerSession,
}

/// Open a session over the SQLite database at `db_path`.
///
/// # Safety
/// - `db_path` must be a valid null-terminated C string, or NULL for an in-memory database.
/// - Must be freed with `wt_session_free`.
/// - Returns NULL on error; call `wt_last_error` to get the error message.
#[no_mangle]
pub unsafe extern "C" fn wt_session_open(db_path: *const c_char) -> *mut WtSessionHandle {
    clear_last_error();

    let opened = if db_path.is_null() {
        SqliteStore::open_in_memory()
            .map(|store| TrackerSession::new(Arc::new(store), TrackerConfig::default()))
            .map_err(SessionError::from)
    } else {
        let Some(path) = required_string(db_path, "database path") else {
            return ptr::null_mut();
        };
        TrackerSession::open(TrackerConfig {
            database_path: path.into(),
            ..TrackerConfig::default()
        })
    };

    match opened {
        Ok(session) => Box::into_raw(Box::new(WtSessionHandle { session })),
        Err(e) => {
            set_last_error(&e.to_string());
            ptr::null_mut()
        }
    }
}

/// Free a session, unbinding its engine.
///
/// # Safety
/// - `handle` must be a valid pointer returned by `wt_session_open`, or NULL.
/// - After calling this function, the pointer is invalid.
#[no_mangle]
pub unsafe extern "C" fn wt_session_free(handle: *mut WtSessionHandle) {
    if !handle.is_null() {
        drop(Box::from_raw(handle));
    }
}

/// Resolve a handle pointer, recording an error for NULL
unsafe fn session_mut<'a>(handle: *mut WtSessionHandle) -> Option<&'a mut TrackerSession> {
    if handle.is_null() {
        set_last_error("Null session pointer");
        return None;
    }
    Some(&mut (*handle).session)
}

// ============================================================================
// Users
// ============================================================================

/// Log in as `username`, registering it on first use.
///
/// # Safety
/// - `handle` must be a valid pointer returned by `wt_session_open`.
/// - `username` must be a valid null-terminated C string.
/// - Returns 0 on success, -1 on error.
#[no_mangle]
pub unsafe extern "C" fn wt_log_in(handle: *mut WtSessionHandle, username: *const c_char) -> i32 {
    clear_last_error();
    let Some(session) = session_mut(handle) else {
        return -1;
    };
    let Some(username) = required_string(username, "username") else {
        return -1;
    };
    status(session.log_in(&username).map(|_| ()))
}

/// Log in with the guest account.
///
/// # Safety
/// - `handle` must be a valid pointer returned by `wt_session_open`.
/// - Returns 0 on success, -1 on error.
#[no_mangle]
pub unsafe extern "C" fn wt_log_in_guest(handle: *mut WtSessionHandle) -> i32 {
    clear_last_error();
    let Some(session) = session_mut(handle) else {
        return -1;
    };
    status(session.log_in_guest().map(|_| ()))
}

/// Log out. Metrics reset to their unknown-input values.
///
/// # Safety
/// - `handle` must be a valid pointer returned by `wt_session_open`.
/// - Returns 0 on success, -1 on a NULL handle.
#[no_mangle]
pub unsafe extern "C" fn wt_log_out(handle: *mut WtSessionHandle) -> i32 {
    clear_last_error();
    let Some(session) = session_mut(handle) else {
        return -1;
    };
    session.log_out();
    0
}

// ============================================================================
// Records
// ============================================================================

/// Record a weight for the active user.
///
/// # Safety
/// - `handle` must be a valid pointer returned by `wt_session_open`.
/// - `weight` must be a valid null-terminated C string.
/// - `date` must be a valid null-terminated C string, or NULL for today.
/// - Returns 1 when the goal has been reached, 0 when not, -1 on error.
#[no_mangle]
pub unsafe extern "C" fn wt_add_sample(
    handle: *mut WtSessionHandle,
    weight: *const c_char,
    date: *const c_char,
) -> i32 {
    clear_last_error();
    let Some(session) = session_mut(handle) else {
        return -1;
    };
    let Some(weight) = required_string(weight, "weight") else {
        return -1;
    };
    let date = cstr_to_string(date);

    match session.add_sample(&weight, date.as_deref()) {
        Ok(outcome) => i32::from(outcome.goal_reached),
        Err(e) => {
            set_last_error(&e.to_string());
            -1
        }
    }
}

/// Change a recorded weight. NULL fields keep their stored value.
///
/// # Safety
/// - `handle` must be a valid pointer returned by `wt_session_open`.
/// - `weight` and `date` must be valid null-terminated C strings or NULL.
/// - Returns 0 on success, -1 on error.
#[no_mangle]
pub unsafe extern "C" fn wt_edit_sample(
    handle: *mut WtSessionHandle,
    sample_id: i64,
    weight: *const c_char,
    date: *const c_char,
) -> i32 {
    clear_last_error();
    let Some(session) = session_mut(handle) else {
        return -1;
    };
    let weight = cstr_to_string(weight);
    let date = cstr_to_string(date);
    status(
        session
            .edit_sample(SampleId(sample_id), weight.as_deref(), date.as_deref())
            .map(|_| ()),
    )
}

/// Delete a recorded weight.
///
/// # Safety
/// - `handle` must be a valid pointer returned by `wt_session_open`.
/// - Returns 0 on success, -1 on error.
#[no_mangle]
pub unsafe extern "C" fn wt_delete_sample(handle: *mut WtSessionHandle, sample_id: i64) -> i32 {
    clear_last_error();
    let Some(session) = session_mut(handle) else {
        return -1;
    };
    status(session.delete_sample(SampleId(sample_id)))
}

/// Set the active user's goal weight.
///
/// # Safety
/// - `handle` must be a valid pointer returned by `wt_session_open`.
/// - `weight` must be a valid null-terminated C string.
/// - Returns 0 on success, -1 on error.
#[no_mangle]
pub unsafe extern "C" fn wt_set_goal(handle: *mut WtSessionHandle, weight: *const c_char) -> i32 {
    clear_last_error();
    let Some(session) = session_mut(handle) else {
        return -1;
    };
    let Some(weight) = required_string(weight, "weight") else {
        return -1;
    };
    status(session.set_goal(&weight).map(|_| ()))
}

// ============================================================================
// Queries
// ============================================================================

/// Current metrics snapshot as JSON.
///
/// # Safety
/// - `handle` must be a valid pointer returned by `wt_session_open`.
/// - Returns a newly allocated string that must be freed with `wt_free_string`.
/// - Returns NULL on error; call `wt_last_error` to get the error message.
#[no_mangle]
pub unsafe extern "C" fn wt_metrics_json(handle: *mut WtSessionHandle) -> *mut c_char {
    clear_last_error();
    let Some(session) = session_mut(handle) else {
        return ptr::null_mut();
    };
    json_or_null(&session.metrics())
}

/// The active user's samples as a JSON array, newest first.
///
/// # Safety
/// - `handle` must be a valid pointer returned by `wt_session_open`.
/// - Returns a newly allocated string that must be freed with `wt_free_string`.
/// - Returns NULL on error; call `wt_last_error` to get the error message.
#[no_mangle]
pub unsafe extern "C" fn wt_history_json(handle: *mut WtSessionHandle) -> *mut c_char {
    clear_last_error();
    let Some(session) = session_mut(handle) else {
        return ptr::null_mut();
    };
    match session.history() {
        Ok(history) => json_or_null(&history),
        Err(e) => {
            set_last_error(&e.to_string());
            ptr::null_mut()
        }
    }
}

// ============================================================================
// Memory Management
// ============================================================================

/// Free a string returned by this library.
///
/// # Safety
/// - `ptr` must be a valid pointer returned by a `wt_*` function, or NULL.
/// - After calling this function, the pointer is invalid.
#[no_mangle]
pub unsafe extern "C" fn wt_free_string(ptr: *mut c_char) {
    if !ptr.is_null() {
        drop(CString::from_raw(ptr));
    }
}

/// Get the last error message.
///
/// # Safety
/// - The returned pointer is valid until the next `wt_*` call on this thread.
/// - Do NOT free the returned pointer.
/// - Returns NULL if the last call succeeded.
#[no_mangle]
pub unsafe extern "C" fn wt_last_error() -> *const c_char {
    LAST_ERROR.with(|e| match &*e.borrow() {
        Some(cstr) => cstr.as_ptr(),
        None => ptr::null(),
    })
}

/// Get the library version.
///
/// # Safety
/// - Returns a pointer to a static string. Do NOT free.
#[no_mangle]
pub unsafe extern "C" fn wt_version() -> *const c_char {
    static VERSION: &[u8] = concat!(env!("CARGO_PKG_VERSION"), "\0").as_bytes();
    VERSION.as_ptr() as *const c_char
}
