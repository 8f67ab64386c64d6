//! The collaboration core: task store, smart-assign policy, presence
//! tracking, and editing-conflict coordination.
//!
//! Everything in this module is transport-agnostic. Inbound signals arrive
//! as typed calls from the IPC layer; outbound events leave through the
//! [`crate::ipc::event::EventBroadcaster`] handed to [`store::TaskService`].

pub mod assign;
pub mod editing;
pub mod error;
pub mod model;
pub mod presence;
pub mod store;

pub use editing::EditingSessions;
pub use error::{BoardError, BoardResult};
pub use presence::PresenceTracker;
pub use store::TaskService;
