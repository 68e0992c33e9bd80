//! Outbound delivery: chunk, pace, dispatch through the channel adapter.
//!
//! Transient send failures are retried with jittered backoff inside a
//! bounded budget; permanent failures stop the retry loop immediately.
//! Chunks of one reply always go out sequentially.

use std::time::Duration;

use rand::Rng;
use serde::Serialize;

use omnihub_schema::MediaRef;

use crate::adapter::{ChannelAdapter, ChannelError, SendOutcome};
use crate::split::split_text;

#[derive(Debug, Clone)]
pub struct DeliveryOptions {
    pub auto_split: bool,
    /// Delay between consecutive chunks of one reply.
    pub pacing: Duration,
    /// Retries per chunk for transient failures.
    pub max_retries: u32,
    pub retry_base_delay: Duration,
}

impl Default for DeliveryOptions {
    fn default() -> Self {
        Self {
            auto_split: true,
            pacing: Duration::from_millis(500),
            max_retries: 2,
            retry_base_delay: Duration::from_millis(500),
        }
    }
}

/// What happened during one reply delivery, summarized into the
/// `outbound_sent` trace payload.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeliveryReport {
    pub chunks_sent: u32,
    pub media_sent: u32,
    pub message_ids: Vec<String>,
    pub failures: Vec<String>,
}

impl DeliveryReport {
    pub fn success(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn attempted(&self) -> u32 {
        self.chunks_sent + self.media_sent + self.failures.len() as u32
    }
}

/// Deliver a reply: text (split when configured) followed by one send per
/// media item. Empty text never produces an empty chunk.
pub async fn deliver(
    adapter: &dyn ChannelAdapter,
    target: &str,
    text: &str,
    media: &[MediaRef],
    opts: &DeliveryOptions,
) -> DeliveryReport {
    let mut report = DeliveryReport::default();

    let limit = adapter.chunk_limit();
    let chunks: Vec<String> = if text.trim().is_empty() {
        Vec::new()
    } else if opts.auto_split && text.chars().count() > limit {
        split_text(text, limit)
    } else {
        vec![text.to_string()]
    };

    for (index, chunk) in chunks.iter().enumerate() {
        if index > 0 {
            tokio::time::sleep(opts.pacing).await;
        }
        match send_with_retry(opts, || adapter.send_text(target, chunk)).await {
            Ok(outcome) => {
                report.chunks_sent += 1;
                if let Some(id) = outcome.message_id {
                    report.message_ids.push(id);
                }
            }
            Err(e) => {
                tracing::warn!(target, chunk = index, error = %e, "outbound text chunk failed");
                report.failures.push(format!("chunk {index}: {e}"));
            }
        }
    }

    for (index, item) in media.iter().enumerate() {
        if report.attempted() > 0 {
            tokio::time::sleep(opts.pacing).await;
        }
        match send_with_retry(opts, || adapter.send_media(target, item)).await {
            Ok(outcome) => {
                report.media_sent += 1;
                if let Some(id) = outcome.message_id {
                    report.message_ids.push(id);
                }
            }
            Err(e) => {
                tracing::warn!(target, media = index, error = %e, "outbound media failed");
                report.failures.push(format!("media {index}: {e}"));
            }
        }
    }

    report
}

async fn send_with_retry<F, Fut>(
    opts: &DeliveryOptions,
    mut send: F,
) -> Result<SendOutcome, ChannelError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<SendOutcome, ChannelError>>,
{
    let mut attempt = 0u32;
    loop {
        match send().await {
            Ok(outcome) => return Ok(outcome),
            Err(e) if e.is_transient() && attempt < opts.max_retries => {
                let backoff = opts.retry_base_delay * 2u32.pow(attempt);
                let jitter =
                    Duration::from_millis(rand::thread_rng().gen_range(0..250));
                tracing::debug!(attempt, error = %e, "retrying outbound send");
                tokio::time::sleep(backoff + jitter).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
