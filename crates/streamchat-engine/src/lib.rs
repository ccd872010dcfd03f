pub mod aggregate;
pub mod attachments;
pub mod session;
pub mod transport;

pub use attachments::{
    compress, compress_with, prepare, prepare_with, validate_selection, AttachmentSource,
    Compressed, CompressionAttempt, OptimizerConfig,
};
pub use session::{
    CancelHandle, ChatSession, Clock, MessageList, PendingTurn, StreamOutcome, SystemClock,
};
pub use transport::{build_request_body, chat_completions_url, CompletionClient};
