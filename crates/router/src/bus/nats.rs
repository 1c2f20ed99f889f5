use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;

use super::{Bus, Message};

/// Production [`Bus`] implementation, backed by a real NATS connection.
///
/// This is a thin adapter: connection management, reconnection backoff and
/// clustering are entirely `async_nats`'s job. Nothing here is in scope beyond
/// translating its `Subscriber`/`Message` types into ours.
pub struct NatsBus {
	client: async_nats::Client,
}

impl NatsBus {
	pub async fn connect(urls: &[String]) -> anyhow::Result<Self> {
		let client = async_nats::connect(urls.join(",")).await?;
		Ok(NatsBus { client })
	}
}

#[async_trait::async_trait]
impl Bus for NatsBus {
	async fn publish(&self, subject: &str, payload: Bytes) -> anyhow::Result<()> {
		self.client.publish(subject.to_string(), payload).await?;
		self.client.flush().await?;
		Ok(())
	}

	async fn subscribe(&self, subject: &str) -> anyhow::Result<BoxStream<'static, Message>> {
		let sub = self.client.subscribe(subject.to_string()).await?;
		Ok(Box::pin(sub.map(|m| Message {
			subject: m.subject.to_string(),
			payload: m.payload,
			reply_to: m.reply.map(|r| r.to_string()),
		})))
	}

	async fn queue_subscribe(&self, subject: &str, queue_group: &str) -> anyhow::Result<BoxStream<'static, Message>> {
		let sub = self
			.client
			.queue_subscribe(subject.to_string(), queue_group.to_string())
			.await?;
		Ok(Box::pin(sub.map(|m| Message {
			subject: m.subject.to_string(),
			payload: m.payload,
			reply_to: m.reply.map(|r| r.to_string()),
		})))
	}
}
