//! Pure translation between the Anthropic message schema and the Gemini
//! generateContent schema, in both directions, one-shot and streaming.

pub mod accumulate;
pub mod preamble;
pub mod request;
pub mod response;
pub mod signature;
pub mod stream;

pub use accumulate::MessageAccumulator;
pub use request::{RequestOptions, to_generate_content, to_message_params};
pub use response::to_message;
pub use signature::{SKIP_SIGNATURE_SENTINEL, SignatureCache};
pub use stream::StreamAdapter;

fn random_hex(len: usize) -> String {
    use rand::RngCore;
    let mut bytes = vec![0u8; len];
    rand::rng().fill_bytes(&mut bytes);
    let mut hex = String::with_capacity(2 * len);
    for byte in bytes {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}

/// Synthesize a tool-call block id. Upstream function calls carry no stable
/// id of their own.
pub(crate) fn new_tool_call_id() -> String {
    format!("call_{}", random_hex(12))
}

pub(crate) fn new_message_id() -> String {
    format!("msg_{}", random_hex(12))
}
