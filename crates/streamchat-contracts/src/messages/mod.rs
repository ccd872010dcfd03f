mod attachment;
mod message;

pub use attachment::{ChatAttachment, OptimizedImageAttachment};
pub use message::{ChatMessage, MessageState, Role};
