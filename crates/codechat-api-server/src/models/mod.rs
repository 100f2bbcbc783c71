pub mod chat;
pub mod context;

pub use chat::{ChatMessage, Role};
pub use context::{CodeContext, FileContent, FileNode};
