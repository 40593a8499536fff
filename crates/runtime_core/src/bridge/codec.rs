use deno_core::{op2, ToJsBuffer};

/// Backs `TextEncoder.encode`. Always UTF-8, per the Encoding Standard.
#[op2]
pub fn op_text_encode(#[string] text: String) -> ToJsBuffer {
    text.into_bytes().into()
}

/// Backs `TextDecoder.decode`. Only `utf-8` (aliases `utf8`, `unicode-1-1-
/// utf-8`) is supported, matching §4.3's "safe pure-computation subset".
#[op2]
pub fn op_text_decode(#[buffer] bytes: &[u8], #[string] label: String) -> Result<String, anyhow::Error> {
    match label.to_ascii_lowercase().as_str() {
        "utf-8" | "utf8" | "unicode-1-1-utf-8" => {
            String::from_utf8(bytes.to_vec()).map_err(|e| anyhow::anyhow!("invalid utf-8: {e}"))
        },
        other => anyhow::bail!("unsupported text encoding label: {other}"),
    }
}
