//! Delivery of queued messages through the transport.

use reqwest::Method;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::error::QueueError;
use super::store::MessageQueue;
use crate::transport::{TransportClient, TransportError};

/// Outcome of one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub delivered: usize,
    pub requeued: usize,
    /// Refused by the backend (4xx) or not sendable.
    pub rejected: usize,
    /// Dropped after exhausting retries.
    pub failed: usize,
}

/// Deliver eligible messages until the queue is empty, a transient failure
/// occurs, or `cancel` fires.
///
/// A transient failure requeues the message and ends the pass so a broken
/// backend is not hammered with the rest of the queue.
pub async fn deliver_pending(
    queue: &MessageQueue,
    transport: &TransportClient,
    cancel: &CancellationToken,
) -> DrainReport {
    let mut report = DrainReport::default();

    while !cancel.is_cancelled() {
        let message = match queue.dequeue().await {
            Ok(message) => message,
            Err(QueueError::Empty) => break,
            Err(e) => {
                warn!(error = %e, "Failed to dequeue message");
                break;
            }
        };

        let method = Method::from_bytes(message.method.as_bytes()).unwrap_or(Method::POST);
        let body = match serde_json::to_vec(&message.payload) {
            Ok(body) => body,
            Err(e) => {
                queue.reject(&message, &e.to_string()).await;
                report.rejected += 1;
                continue;
            }
        };

        match transport
            .send(method, &message.endpoint, Some(body), cancel)
            .await
        {
            Ok(_) => {
                queue.mark_processed(&message.id).await;
                report.delivered += 1;
                debug!(id = %message.id, "Delivered queued message");
            }
            Err(TransportError::Cancelled) => {
                queue.restore(message).await;
                break;
            }
            Err(e) if e.is_transient() => {
                match queue.requeue(message, &e.to_string()).await {
                    Ok(()) => report.requeued += 1,
                    Err(_) => report.failed += 1,
                }
                break;
            }
            Err(e) => {
                queue.reject(&message, &e.to_string()).await;
                report.rejected += 1;
            }
        }
    }

    if report != DrainReport::default() {
        info!(
            delivered = report.delivered,
            requeued = report.requeued,
            rejected = report.rejected,
            failed = report.failed,
            "Queue drain pass finished"
        );
    }
    report
}
