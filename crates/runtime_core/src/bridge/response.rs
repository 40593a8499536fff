//! Ops backing the `res` object, §4.6.

use deno_core::{op2, OpState, ToJsBuffer};

use super::state::ExecutionState;

/// Fixed extension → MIME table for `sendFile`, §4.6. Built with `phf` so
/// the lookup is a perfect hash, not a linear scan, the same choice the
/// grounding codebase makes for its small fixed tables.
static CONTENT_TYPES: phf::Map<&'static str, &'static str> = phf::phf_map! {
    "html" => "text/html",
    "css" => "text/css",
    "js" => "application/javascript",
    "json" => "application/json",
    "xml" => "application/xml",
    "txt" => "text/plain",
    "png" => "image/png",
    "jpg" => "image/jpeg",
    "jpeg" => "image/jpeg",
    "gif" => "image/gif",
    "svg" => "image/svg+xml",
    "ico" => "image/x-icon",
    "webp" => "image/webp",
    "pdf" => "application/pdf",
    "zip" => "application/zip",
    "woff" => "font/woff",
    "woff2" => "font/woff2",
    "ttf" => "font/ttf",
    "otf" => "font/otf",
};

pub fn content_type_for_extension(extension: &str) -> &'static str {
    CONTENT_TYPES
        .get(extension.to_ascii_lowercase().as_str())
        .copied()
        .unwrap_or("application/octet-stream")
}

#[op2(fast)]
pub fn op_res_status(state: &mut OpState, code: u32) -> Result<(), anyhow::Error> {
    anyhow::ensure!((100..=599).contains(&code), "status code {code} out of range");
    state.borrow_mut::<ExecutionState>().response.status_code = code as u16;
    Ok(())
}

#[op2(fast)]
pub fn op_res_set_header(state: &mut OpState, #[string] name: String, #[string] value: String) {
    let exec = state.borrow_mut::<ExecutionState>();
    exec.response.headers.insert(name.to_ascii_lowercase(), vec![value]);
}

/// `set-cookie` accumulates a list; every other header joins with `, `,
/// per §4.6's `appendHeader` semantics.
#[op2(fast)]
pub fn op_res_append_header(state: &mut OpState, #[string] name: String, #[string] value: String) {
    let exec = state.borrow_mut::<ExecutionState>();
    let key = name.to_ascii_lowercase();
    exec.response.headers.entry(key).or_default().push(value);
}

/// Guest-facing read-back only; the response envelope the engine returns
/// keeps the full `Vec<String>` per header regardless of name, so
/// `set-cookie` still reaches the caller as a list even though this joins
/// it for the handler's own inspection.
#[op2]
#[string]
pub fn op_res_get_header(state: &mut OpState, #[string] name: String) -> Option<String> {
    let exec = state.borrow_mut::<ExecutionState>();
    let key = name.to_ascii_lowercase();
    exec.response.headers.get(&key).map(|values| values.join(", "))
}

#[op2(fast)]
pub fn op_res_remove_header(state: &mut OpState, #[string] name: String) {
    state
        .borrow_mut::<ExecutionState>()
        .response
        .headers
        .remove(&name.to_ascii_lowercase());
}

fn sniff_content_type(body: &[u8]) -> &'static str {
    match serde_json::from_slice::<serde_json::Value>(body) {
        Ok(_) => "application/json",
        Err(_) => "text/plain",
    }
}

/// `res.send(body)`. `body` arrives already coerced to bytes by the JS
/// shim (strings UTF-8, objects `JSON.stringify`'d, buffers as-is); this op
/// only fills in `content-type` when unset.
#[op2(fast)]
pub fn op_res_send(state: &mut OpState, #[buffer] body: &[u8]) {
    let exec = state.borrow_mut::<ExecutionState>();
    if !exec.response.headers.contains_key("content-type") {
        let content_type = sniff_content_type(body);
        exec.response
            .headers
            .insert("content-type".to_string(), vec![content_type.to_string()]);
    }
    exec.response.body = Some(body.to_vec());
    exec.response.responded = true;
}

#[op2(fast)]
pub fn op_res_end(state: &mut OpState, #[buffer] body: Option<&[u8]>) {
    let exec = state.borrow_mut::<ExecutionState>();
    if let Some(body) = body {
        exec.response.body = Some(body.to_vec());
    }
    exec.response.ended = true;
    exec.response.responded = true;
}

#[op2(async)]
#[buffer]
pub async fn op_res_send_file(
    state: std::rc::Rc<std::cell::RefCell<OpState>>,
    #[string] path: String,
    max_age: Option<u32>,
) -> Result<ToJsBuffer, anyhow::Error> {
    let vfs = {
        let state = state.borrow();
        state.borrow::<ExecutionState>().vfs.clone()
    };
    let bytes = vfs.read(std::path::Path::new(&path)).await?;

    let extension = std::path::Path::new(&path)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("");
    let content_type = content_type_for_extension(extension);

    let mut state = state.borrow_mut();
    let exec = state.borrow_mut::<ExecutionState>();
    exec.response
        .headers
        .insert("content-type".to_string(), vec![content_type.to_string()]);
    if let Some(max_age) = max_age {
        exec.response.headers.insert(
            "cache-control".to_string(),
            vec![format!("public, max-age={max_age}")],
        );
    }
    exec.response.body = Some(bytes.clone());
    exec.response.responded = true;
    Ok(bytes.into())
}
