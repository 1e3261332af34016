mod blocks;
mod inbound;
mod message;

pub use blocks::{
    home_view, settings_modal, ALT_TEXT_ACTION_ID, COLORING_ACTION_ID, DEMO_BUTTON_ACTION_ID,
    RESIZE_ACTION_ID, RESIZE_CHOICES, SETTINGS_BUTTON_ACTION_ID, SETTINGS_VIEW_CALLBACK_ID,
};
pub use inbound::{parse_envelope, Envelope, InboundEvent};
pub use message::{AttachmentRef, ChatMessage, FileAttachment, ACCEPTED_PRETTY_TYPES};
