//! Per-session conversation state and the relay that wires the session
//! store, the prompt assembler and the LLM gateway together to answer one
//! question, synchronously or as a live stream.

pub mod relay;
pub mod store;
pub mod types;

pub use relay::{ConversationRelay, LlmGateway};
pub use store::ConversationStore;
pub use types::ConversationContext;
