//! # Schoolbell Core
//! Configuration, error types, domain types and provider traits shared by
//! every Schoolbell crate.

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::SchoolbellConfig;
pub use error::{Result, SchoolbellError, SendError};
pub use traits::{ChannelSender, Inbox};
pub use types::{
    Cadence, Channel, DeliveryReceipt, DomainEvent, NotificationCategory, Recipient,
    RenderedMessage, RunMode, Schedule,
};
