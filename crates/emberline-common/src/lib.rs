pub mod error;
pub mod message;
pub mod telemetry;

pub use error::{Error, Result};
pub use message::{Attachment, ConversationEntry, EntryRole, InboundMessage, MentionedUser};
