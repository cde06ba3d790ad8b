// OpenAI-dialect models and normalisation into the internal Claude shape.

pub mod bracket;
pub mod models;
pub mod request;

pub use request::to_claude_request;
