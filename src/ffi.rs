//! FFI interface for host interop
//!
//! Provides C-compatible functions for running extractions over raw markup.
//! Requests and results are passed as JSON; the host owns persistence and
//! passes the pagination state in with every request.

use std::ffi::{c_char, CStr, CString};
use std::ptr;

use serde::{Deserialize, Serialize};

use crate::config::ExtractionContext;
use crate::document::{Dialect, RawDocument};
use crate::error::Result;
use crate::messages::{Message, MessageLog};
use crate::pipeline::{ExtractionBatch, Extractor};
use crate::progress::{MemoryProgressStore, PaginationState, ProgressStore};

/// One extraction invocation as sent by the host.
#[derive(Debug, Clone, Deserialize)]
pub struct ExtractionRequest {
    pub dialect: Dialect,
    /// Identity of the document, passed to filters and messages
    #[serde(default)]
    pub feed: String,
    pub config: ExtractionContext,
    /// Cursor persisted by the host after the previous invocation
    #[serde(default)]
    pub state: PaginationState,
}

/// Batch plus the state the host must persist for the next invocation.
#[derive(Debug, Clone, Serialize)]
pub struct ExtractionResponse {
    #[serde(flatten)]
    pub batch: ExtractionBatch,
    pub state: PaginationState,
    pub messages: Vec<Message>,
}

/// Result struct returned to the host
/// Both pointers are owned by Rust and must be freed via free_extraction_result
#[repr(C)]
pub struct ExtractionResultFFI {
    /// JSON-serialized result (null-terminated)
    pub json_ptr: *mut c_char,
    /// Error message if extraction failed (null-terminated), or null on success
    pub error_ptr: *mut c_char,
}

/// Run the next extraction batch over a document.
///
/// # Arguments
/// * `content_ptr` - Pointer to the raw document bytes (not necessarily null-terminated)
/// * `content_len` - Length of the document in bytes
/// * `request_json` - JSON-serialized ExtractionRequest (null-terminated)
///
/// # Returns
/// ExtractionResultFFI with either json_ptr set (success) or error_ptr set (failure)
///
/// # Safety
/// - `content_ptr` must point to valid memory of at least `content_len` bytes
/// - `request_json` must be a valid null-terminated C string
/// - Caller must free the result via `free_extraction_result`
#[no_mangle]
pub unsafe extern "C" fn extract_from_markup(
    content_ptr: *const c_char,
    content_len: usize,
    request_json: *const c_char,
) -> ExtractionResultFFI {
    let content: &[u8] = if content_ptr.is_null() || content_len == 0 {
        &[]
    } else {
        std::slice::from_raw_parts(content_ptr as *const u8, content_len)
    };

    let request_str = match read_c_str(request_json) {
        Ok(s) => s,
        Err(msg) => return make_error_result(msg),
    };

    let request: ExtractionRequest = match serde_json::from_str(request_str) {
        Ok(r) => r,
        Err(e) => {
            return make_error_result(&format!("Failed to parse request JSON: {}", e));
        }
    };

    match perform_extraction(content, &request) {
        Ok(response) => make_json_result(&response),
        Err(e) => make_error_result(&e.to_string()),
    }
}

/// Check an extraction configuration without running it.
///
/// Returns `{"valid":true}` on success, or the validation error.
///
/// # Safety
/// - `config_json` must be a valid null-terminated C string
/// - Caller must free the result via `free_extraction_result`
#[no_mangle]
pub unsafe extern "C" fn validate_extraction_config(config_json: *const c_char) -> ExtractionResultFFI {
    let config_str = match read_c_str(config_json) {
        Ok(s) => s,
        Err(msg) => return make_error_result(msg),
    };

    match check_config(config_str) {
        Ok(()) => make_json_result(&serde_json::json!({ "valid": true })),
        Err(msg) => make_error_result(&msg),
    }
}

/// Free an ExtractionResultFFI returned by this module
///
/// # Safety
/// - `result` must have been returned by `extract_from_markup` or
///   `validate_extraction_config`
/// - Must only be called once per result
#[no_mangle]
pub unsafe extern "C" fn free_extraction_result(result: ExtractionResultFFI) {
    if !result.json_ptr.is_null() {
        drop(CString::from_raw(result.json_ptr));
    }
    if !result.error_ptr.is_null() {
        drop(CString::from_raw(result.error_ptr));
    }
}

unsafe fn read_c_str<'a>(ptr: *const c_char) -> std::result::Result<&'a str, &'static str> {
    if ptr.is_null() {
        return Err("Request JSON is null");
    }
    CStr::from_ptr(ptr)
        .to_str()
        .map_err(|_| "Invalid UTF-8 in request JSON")
}

fn make_json_result<T: Serialize>(value: &T) -> ExtractionResultFFI {
    match serde_json::to_string(value) {
        Ok(json) => match CString::new(json) {
            Ok(cstr) => ExtractionResultFFI {
                json_ptr: cstr.into_raw(),
                error_ptr: ptr::null_mut(),
            },
            Err(_) => make_error_result("Result JSON contains null bytes"),
        },
        Err(e) => make_error_result(&format!("Failed to serialize result: {}", e)),
    }
}

// Helper to create error result
fn make_error_result(msg: &str) -> ExtractionResultFFI {
    let error_cstr = CString::new(msg.replace('\0', " ")).unwrap_or_default();
    ExtractionResultFFI {
        json_ptr: ptr::null_mut(),
        error_ptr: error_cstr.into_raw(),
    }
}

fn check_config(config_json: &str) -> std::result::Result<(), String> {
    let config: ExtractionContext =
        serde_json::from_str(config_json).map_err(|e| format!("Failed to parse config JSON: {}", e))?;
    config.validate().map_err(|e| e.to_string())
}

// Run one batch against a store seeded with the host's state
fn perform_extraction(content: &[u8], request: &ExtractionRequest) -> Result<ExtractionResponse> {
    request.config.validate()?;

    let raw = RawDocument::new(content, request.dialect);
    let store = MemoryProgressStore::with_state(request.state);
    let log = MessageLog::new();
    let extractor = Extractor::new(request.config.clone());

    let batch = extractor.run(&raw, &request.feed, &store, &log)?;

    Ok(ExtractionResponse {
        batch,
        state: store.get()?,
        messages: log.take(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"<html><body>
        <div class="post"><h2>First</h2><a href="/1">more</a></div>
        <div class="post"><h2>Second</h2><a href="/2">more</a></div>
        <div class="post"><h2>Third</h2></div>
    </body></html>"#;

    fn request(state: serde_json::Value) -> String {
        serde_json::json!({
            "dialect": "html",
            "feed": "blog",
            "config": {
                "context": "//div[@class='post']",
                "batch_size": 2,
                "fields": [
                    {"key": "title", "target": "title", "query": "h2"},
                    {"key": "link", "target": "link", "query": "a/@href"}
                ]
            },
            "state": state
        })
        .to_string()
    }

    fn call(content: &str, request: &str) -> std::result::Result<serde_json::Value, String> {
        let request = CString::new(request).unwrap();
        unsafe {
            let result = extract_from_markup(content.as_ptr() as *const c_char, content.len(), request.as_ptr());
            let outcome = if result.json_ptr.is_null() {
                Err(CStr::from_ptr(result.error_ptr).to_str().unwrap().to_string())
            } else {
                Ok(serde_json::from_str(CStr::from_ptr(result.json_ptr).to_str().unwrap()).unwrap())
            };
            free_extraction_result(result);
            outcome
        }
    }

    #[test]
    fn test_extract_returns_records_and_state() {
        let first = call(PAGE, &request(serde_json::json!({}))).unwrap();
        assert_eq!(first["state"], serde_json::json!({"total": 3, "pointer": 2}));
        assert_eq!(first["records"][0], serde_json::json!({"title": "First", "link": "/1"}));
        assert_eq!(first["records"].as_array().unwrap().len(), 2);

        let second = call(PAGE, &request(first["state"].clone())).unwrap();
        assert_eq!(second["records"], serde_json::json!([{"title": "Third"}]));
        assert_eq!(second["state"]["pointer"], 3);
        assert_eq!(second["start"], 2);
    }

    #[test]
    fn test_extract_reports_errors() {
        let err = call(PAGE, "{not json").unwrap_err();
        assert!(err.starts_with("Failed to parse request JSON"));

        let bad = serde_json::json!({
            "dialect": "xml",
            "config": {"context": "//item", "fields": []}
        })
        .to_string();
        let err = call("<open>", &bad).unwrap_err();
        assert!(err.contains("malformed XML document"));
    }

    #[test]
    fn test_validate_config() {
        let ok = CString::new(r#"{"context": "//item"}"#).unwrap();
        let bad = CString::new(r#"{"context": ""}"#).unwrap();
        unsafe {
            let result = validate_extraction_config(ok.as_ptr());
            assert!(result.error_ptr.is_null());
            assert_eq!(CStr::from_ptr(result.json_ptr).to_str().unwrap(), r#"{"valid":true}"#);
            free_extraction_result(result);

            let result = validate_extraction_config(bad.as_ptr());
            assert!(result.json_ptr.is_null());
            assert_eq!(
                CStr::from_ptr(result.error_ptr).to_str().unwrap(),
                "context expression is empty"
            );
            free_extraction_result(result);
        }
    }

    #[test]
    fn test_null_request_is_rejected() {
        unsafe {
            let result = extract_from_markup(ptr::null(), 0, ptr::null());
            assert!(result.json_ptr.is_null());
            assert_eq!(CStr::from_ptr(result.error_ptr).to_str().unwrap(), "Request JSON is null");
            free_extraction_result(result);
        }
    }
}
