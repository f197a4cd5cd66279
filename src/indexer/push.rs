//! Push-mode ingestion: the event subscription loop.

use anyhow::{Context, Result};

use crate::subscription::{subscribe_events, EventStream, RawEvent, RECONNECT_DELAY};

use super::Indexer;

impl Indexer {
    /// Runs the subscription loop until shutdown. The initial connect or
    /// subscribe failure propagates so the caller can fall back to polling;
    /// read failures after that reconnect with a fixed backoff.
    pub(super) async fn run_push(&self) -> Result<()> {
        let mut stream = self
            .subscribe_from_current()
            .await
            .context("initial subscription failed")?;
        tracing::info!(target: "hasira::indexer", "Push subscription established");

        loop {
            let event = tokio::select! {
                () = self.shutdown.cancelled() => return Ok(()),
                event = stream.next_event() => event,
            };

            match event {
                Ok(raw) => self.handle_push_event(&raw).await,
                Err(e) => {
                    if self.shutdown.is_cancelled() {
                        return Ok(());
                    }
                    tracing::warn!(
                        target: "hasira::indexer",
                        error = %e,
                        "Subscription read failed, reconnecting"
                    );
                    stream = match self.resubscribe().await {
                        Some(stream) => stream,
                        None => return Ok(()),
                    };
                }
            }
        }
    }

    async fn subscribe_from_current(&self) -> Result<EventStream> {
        subscribe_events(
            self.provider.ws_endpoint(),
            self.status.current_block(),
            self.contract,
            Some(self.selector),
        )
        .await
    }

    /// Reconnect loop after a dropped subscription. Returns `None` on
    /// shutdown.
    async fn resubscribe(&self) -> Option<EventStream> {
        loop {
            if !self.sleep_or_shutdown(RECONNECT_DELAY).await {
                return None;
            }
            match self.subscribe_from_current().await {
                Ok(stream) => {
                    tracing::info!(
                        target: "hasira::indexer",
                        from_block = self.status.current_block(),
                        "Resubscribed"
                    );
                    return Some(stream);
                }
                Err(e) => {
                    tracing::warn!(target: "hasira::indexer", error = %e, "Reconnect failed");
                }
            }
        }
    }

    async fn handle_push_event(&self, raw: &RawEvent) {
        // The node was asked to filter by selector; reassert it here anyway.
        if !self.selector_matches(&raw.keys) {
            tracing::debug!(
                target: "hasira::indexer",
                block = raw.block_number,
                "Dropping event with non-matching selector"
            );
            return;
        }

        let result = self
            .retry
            .execute(|| async {
                self.index_event(
                    raw.block_number,
                    &raw.transaction_hash,
                    &raw.from_address,
                    &raw.keys,
                    &raw.data,
                )
                .map_err(anyhow::Error::from)
            })
            .await;

        match result {
            Ok(()) => {
                tracing::debug!(
                    target: "hasira::indexer",
                    block = raw.block_number,
                    "Indexed pushed event"
                );
            }
            Err(e) => {
                tracing::error!(
                    target: "hasira::indexer",
                    block = raw.block_number,
                    error = %e,
                    "Failed to store pushed event"
                );
            }
        }
    }
}
