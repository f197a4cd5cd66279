//! Pull-mode ingestion: windowed range polling with continuation tokens.

use anyhow::Result;
use std::sync::atomic::Ordering;
use std::time::Duration;

use super::Indexer;

/// Blocks fetched per polling iteration.
pub const POLL_WINDOW: u64 = 100;

/// Within this many blocks of the chain head the loop paces normally;
/// further behind it runs in catch-up cadence.
const CATCH_UP_MARGIN: u64 = 50;

const CATCH_UP_DELAY: Duration = Duration::from_millis(100);
const IDLE_DELAY: Duration = Duration::from_secs(2);
const HEAD_RETRY_DELAY: Duration = Duration::from_secs(5);

/// End of the next polling window: `min(latest, current + window)`.
pub fn poll_window_end(current: u64, latest: u64, window: u64) -> u64 {
    latest.min(current + window)
}

impl Indexer {
    pub(super) async fn run_polling(&self) -> Result<()> {
        tracing::info!(
            target: "hasira::indexer",
            from_block = self.status.current_block(),
            "Starting polling loop"
        );

        loop {
            if self.shutdown.is_cancelled() {
                return Ok(());
            }

            let latest = match self.provider.latest_block().await {
                Ok(latest) => latest,
                Err(e) => {
                    tracing::warn!(target: "hasira::indexer", error = %e, "Failed to fetch chain head");
                    if !self.sleep_or_shutdown(HEAD_RETRY_DELAY).await {
                        return Ok(());
                    }
                    continue;
                }
            };

            let current = self.status.current_block();
            if current <= latest {
                let end = poll_window_end(current, latest, POLL_WINDOW);
                tracing::debug!(
                    target: "hasira::indexer",
                    from = current,
                    to = end,
                    latest,
                    "Processing block range"
                );

                match self.process_range(current, end).await {
                    Ok(stored) => {
                        // The range is fully drained: the durable cursor may
                        // move past it even when it produced no events.
                        if let Err(e) = self.store.advance_cursor(end) {
                            // The range will be re-fetched after a restart.
                            tracing::error!(
                                target: "hasira::indexer",
                                to = end,
                                error = %e,
                                "Failed to advance durable cursor"
                            );
                        }
                        self.status.current_block.store(end + 1, Ordering::SeqCst);
                        if stored > 0 {
                            tracing::info!(
                                target: "hasira::indexer",
                                from = current,
                                to = end,
                                events = stored,
                                "Indexed range"
                            );
                        }
                    }
                    Err(e) => {
                        // Skip the range in memory so the loop cannot wedge,
                        // but leave the durable cursor behind it: a restart
                        // will retry the unresolved range.
                        tracing::error!(
                            target: "hasira::indexer",
                            from = current,
                            to = end,
                            error = %e,
                            "Range failed after retries, skipping"
                        );
                        self.status.current_block.store(end + 1, Ordering::SeqCst);
                    }
                }
            }

            let behind = latest.saturating_sub(self.status.current_block());
            let delay = if behind > CATCH_UP_MARGIN {
                CATCH_UP_DELAY
            } else {
                IDLE_DELAY
            };
            if !self.sleep_or_shutdown(delay).await {
                return Ok(());
            }
        }
    }

    /// Fetches and stores every chunk of one block range. Returns the number
    /// of stored events.
    async fn process_range(&self, from: u64, to: u64) -> Result<usize> {
        let mut continuation: Option<String> = None;
        let mut stored = 0usize;

        loop {
            let token = continuation.clone();
            let page = self
                .retry
                .execute(|| {
                    let token = token.clone();
                    async move {
                        self.provider
                            .get_events(
                                from,
                                to,
                                Some(self.contract),
                                Some(vec![vec![self.selector]]),
                                token,
                            )
                            .await
                    }
                })
                .await?;

            for event in &page.events {
                if !self.selector_matches(&event.keys) {
                    continue;
                }
                let Some(block_number) = event.block_number else {
                    // Pre-confirmed events have no block yet; the next poll
                    // of this range will see them mined.
                    tracing::debug!(target: "hasira::indexer", "Skipping pre-confirmed event");
                    continue;
                };
                self.index_event(
                    block_number,
                    &event.transaction_hash,
                    &event.from_address,
                    &event.keys,
                    &event.data,
                )?;
                stored += 1;
            }

            match page.continuation_token {
                Some(token) if !self.shutdown.is_cancelled() => continuation = Some(token),
                _ => return Ok(stored),
            }
        }
    }
}
