pub mod api;
pub mod config;
pub mod delivery;
pub mod presenter;
pub mod session;
pub mod state;
pub mod store;
pub mod transcript;

// Re-export main types for convenience
pub use api::{ApiError, BackendClient, ChatReply, ChatRequest, ConfigStatus, SaasBranding};
pub use config::{Config, Profile, Transport};
pub use delivery::{
    DeliveryClient, DeliveryHandle, DeliveryPhase, DeliveryStatus, DeliveryTask, InboxSource,
    PollSource, PushSource,
};
pub use presenter::{Presenter, ScrollState};
pub use state::{ChatMessage, ChatRole, MessageSource};
pub use store::{FileStore, LocalStore, MemoryStore};
pub use transcript::{ConversationContext, TranscriptStore};
