pub mod event_stream;
pub mod sse;

/// Typed event decoded from a provider stream, independent of the wire
/// framing it arrived in.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    /// Stream opened; carries the provider conversation id when known.
    MessageStart { conversation_id: String },
    /// A chunk of assistant text.
    TextDelta { text: String },
    /// A piece of a tool invocation. `input` is the raw JSON fragment as the
    /// provider sent it; reassembly is the client's problem.
    ToolUseFragment {
        tool_use_id: String,
        name: Option<String>,
        input: Option<String>,
        stop: bool,
    },
    /// The assistant turn is complete (CodeWhisperer end-of-response).
    AssistantEnd,
    /// Authoritative token counts reported by the provider.
    Usage {
        input_tokens: u32,
        output_tokens: u32,
    },
    /// Provider-reported finish reason (e.g. Gemini MAX_TOKENS).
    Finish { reason: String },
    /// Undecodable frame payload, surfaced for diagnostics; never fatal.
    Raw { bytes: Vec<u8> },
}
