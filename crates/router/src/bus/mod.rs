mod messages;
mod nats;
mod subscriber;

use bytes::Bytes;
use futures_util::stream::BoxStream;

pub use messages::{RegisterMessage, StartMessage, UnregisterMessage};
pub use nats::NatsBus;
pub use subscriber::Subscriber;

/// One inbound message from a bus subject. `reply_to`, when set, is where a response
/// should be published (used for `router.greet`).
pub struct Message {
	pub subject: String,
	pub payload: Bytes,
	pub reply_to: Option<String>,
}

/// The narrow publish/subscribe surface the [`Subscriber`] is written against.
///
/// The production implementation ([`NatsBus`]) wraps a real message-bus client; none
/// of that client's own connection, retry or clustering behaviour is in scope here —
/// only this trait boundary and what's built on top of it.
#[async_trait::async_trait]
pub trait Bus: Send + Sync {
	async fn publish(&self, subject: &str, payload: Bytes) -> anyhow::Result<()>;

	async fn subscribe(&self, subject: &str) -> anyhow::Result<BoxStream<'static, Message>>;

	/// Subscribes to a subject whose messages each carry their own reply subject
	/// (NATS request/reply semantics), as used for `router.greet`.
	async fn queue_subscribe(&self, subject: &str, queue_group: &str) -> anyhow::Result<BoxStream<'static, Message>>;
}
