// Claude <-> Gemini Cloud Assist protocol conversion.

pub mod request;

pub use request::{map_model, transform_claude_request};
