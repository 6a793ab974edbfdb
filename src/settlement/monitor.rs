//! Event Monitor
//!
//! Polls the contract for `ThresholdReached` events and feeds them to the
//! coordinator. Each tick first resumes open rounds (oldest first, so a
//! round holding withdrawn funds drains before new ones start), then scans
//! new blocks in bounded ranges. The cursor is persisted only after a range
//! has been fully handed to the coordinator; rescanning a range is harmless
//! because duplicate events are ignored.

use anyhow::{Context, Result};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::coordinator::{EventOutcome, SettlementCoordinator};
use super::store::SettlementStore;
use crate::chain::{ChainClient, ChainError};
use crate::config::ChainConfig;

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub poll_interval: Duration,
    /// First block to scan when no cursor is stored; `None` starts at the head
    pub start_block: Option<u64>,
    pub max_block_range: u64,
    pub call_timeout: Duration,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            start_block: None,
            max_block_range: 1_000,
            call_timeout: Duration::from_secs(15),
        }
    }
}

impl MonitorSettings {
    pub fn from_config(config: &ChainConfig) -> Self {
        Self {
            poll_interval: Duration::from_secs(config.poll_interval_secs),
            start_block: config.start_block,
            max_block_range: config.max_block_range,
            call_timeout: Duration::from_secs(config.rpc_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickSummary {
    pub resumed: usize,
    pub events: usize,
    pub new_rounds: usize,
    pub duplicates: usize,
    pub cursor: Option<u64>,
}

pub struct EventMonitor {
    chain: Arc<dyn ChainClient>,
    store: Arc<dyn SettlementStore>,
    coordinator: Arc<SettlementCoordinator>,
    settings: MonitorSettings,
}

impl EventMonitor {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        store: Arc<dyn SettlementStore>,
        coordinator: Arc<SettlementCoordinator>,
        settings: MonitorSettings,
    ) -> Self {
        Self {
            chain,
            store,
            coordinator,
            settings,
        }
    }

    /// Poll until shutdown is signalled
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            poll_interval = ?self.settings.poll_interval,
            start_block = ?self.settings.start_block,
            "Event monitor started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.tick(Some(&shutdown)).await {
                Ok(summary) => {
                    if summary.events > 0 || summary.resumed > 0 {
                        info!(
                            resumed = summary.resumed,
                            events = summary.events,
                            new_rounds = summary.new_rounds,
                            duplicates = summary.duplicates,
                            cursor = ?summary.cursor,
                            "Monitor tick complete"
                        );
                    }
                }
                Err(e) => error!(error = %e, "Monitor tick failed"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("Event monitor stopped");
        Ok(())
    }

    /// One pass: resume open rounds, then scan for new events
    pub async fn tick(&self, shutdown: Option<&watch::Receiver<bool>>) -> Result<TickSummary> {
        let stopping = || shutdown.map(|rx| *rx.borrow()).unwrap_or(false);
        let mut summary = TickSummary::default();

        let open = self.store.list_open().await.context("Failed to list open rounds")?;
        for record in open {
            if stopping() {
                return Ok(summary);
            }
            summary.resumed += 1;
            if let Err(e) = self.coordinator.drive(&record.request_id).await {
                warn!(request_id = %record.request_id, error = %e, "Failed to resume round");
            }
        }

        let latest = self
            .call("eth_blockNumber", self.chain.latest_block())
            .await
            .context("Failed to read latest block")?;

        let mut from = match self.store.load_cursor().await? {
            Some(cursor) => cursor + 1,
            None => self.settings.start_block.unwrap_or(latest),
        };
        summary.cursor = from.checked_sub(1);

        let range = self.settings.max_block_range.max(1);
        while from <= latest {
            if stopping() {
                break;
            }

            let to = from.saturating_add(range - 1).min(latest);
            let events = self
                .call("eth_getLogs", self.chain.threshold_events(from, to))
                .await
                .with_context(|| format!("Failed to fetch events for blocks {}..={}", from, to))?;

            debug!(from, to, events = events.len(), "Scanned block range");

            for event in &events {
                summary.events += 1;
                match self.coordinator.handle_event(event).await? {
                    EventOutcome::Started(state) => {
                        summary.new_rounds += 1;
                        debug!(request_id = %event.request_id, state = %state, "Round processed");
                    }
                    EventOutcome::Duplicate => summary.duplicates += 1,
                }
            }

            self.store.save_cursor(to).await?;
            summary.cursor = Some(to);
            from = to + 1;
        }

        Ok(summary)
    }

    async fn call<T>(
        &self,
        label: &str,
        call: impl std::future::Future<Output = Result<T, ChainError>>,
    ) -> Result<T, ChainError> {
        tokio::time::timeout(self.settings.call_timeout, call)
            .await
            .map_err(|_| ChainError::Timeout(format!("{} after {:?}", label, self.settings.call_timeout)))?
    }
}
