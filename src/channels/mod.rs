//! Channel queues: the boundary between transports and the engine.

pub mod attachments;
pub mod types;

pub use attachments::{AttachmentStore, FsAttachmentStore, MemoryAttachmentStore};
pub use types::{
    Attachment, Channel, InboundItem, NewInboundItem, NewOutboundItem, OutboundItem, ProcessTag,
    START_COMMAND,
};
