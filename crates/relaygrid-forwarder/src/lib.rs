//! relaygrid-forwarder: the per-channel forwarding loop.
//!
//! A [`ForwardingWorker`] polls one source channel through a
//! [`SourceFeed`], delivers every post newer than its cursor through a
//! [`DeliverySink`], and reports what it did on an event channel.
//! Production implementations are [`TelegramPreview`] and
//! [`DiscordWebhook`]; tests swap in scripted fakes.

pub mod error;
pub mod message;
pub mod sink;
pub mod source;
pub mod worker;

pub use error::{DeliveryError, SourceError};
pub use message::SourceMessage;
pub use sink::{DeliveryResponse, DeliverySink, DiscordWebhook, WebhookPayload, build_payload};
pub use source::{PreviewExtractor, SourceFeed, TelegramPreview};
pub use worker::{
    ForwardingWorker, WorkerDeps, WorkerEvent, WorkerEventKind, WorkerPhase, WorkerSettings,
};
