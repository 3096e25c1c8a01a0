//! The outbox poll engine.
//!
//! One background loop per client. Each tick fetches the oldest pending
//! rows (scoped by the coordination strategy), replays them through their
//! typed producer chains, flushes the shared producer, and records the
//! per-row outcomes. Failed rows stay pending and are retried on a later
//! tick; there is no backoff inside the engine.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::BrokerProducer;
use crate::config::OutboxSettings;
use crate::coordination::{Coordination, OutboxQuery};
use crate::errors::KewError;
use crate::registry::TypeRegistry;
use crate::store::Store;

const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub struct OutboxEngine {
    store: Arc<dyn Store>,
    registry: Arc<TypeRegistry>,
    producer: Arc<dyn BrokerProducer>,
    settings: OutboxSettings,
    coordination: Arc<dyn Coordination>,
    started: AtomicBool,
    cancel: CancellationToken,
}

impl OutboxEngine {
    pub(crate) fn new(
        store: Arc<dyn Store>,
        registry: Arc<TypeRegistry>,
        producer: Arc<dyn BrokerProducer>,
        settings: OutboxSettings,
        coordination: Arc<dyn Coordination>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            registry,
            producer,
            settings,
            coordination,
            started: AtomicBool::new(false),
            cancel,
        }
    }

    /// Start the poll loop once; later calls are no-ops.
    pub fn ensure_started(self: Arc<Self>) {
        if self
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            tokio::spawn(async move { self.run().await });
        }
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    async fn run(&self) {
        info!(
            "🔄 Outbox poll engine started (interval {:?}, batch {})",
            self.settings.polling_interval, self.settings.max_rows_per_tick
        );
        let first_tick = tokio::time::Instant::now() + self.settings.polling_interval;
        let mut ticker = tokio::time::interval_at(first_tick, self.settings.polling_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let tick = self.tick();
                    tokio::pin!(tick);
                    tokio::select! {
                        result = &mut tick => {
                            if let Err(e) = result {
                                error!("❌ Outbox tick failed: {e}");
                            }
                        }
                        _ = self.cancel.cancelled() => {
                            // Give in-flight work a bounded chance to land.
                            match tokio::time::timeout(SHUTDOWN_GRACE, &mut tick).await {
                                Ok(Err(e)) => error!("❌ Outbox tick failed during shutdown: {e}"),
                                Ok(Ok(())) => {}
                                Err(_) => warn!("⏱️ Abandoning in-flight outbox work after {SHUTDOWN_GRACE:?}"),
                            }
                            break;
                        }
                    }
                }
            }
        }
        info!("🏁 Outbox poll engine stopped");
    }

    async fn tick(&self) -> Result<(), KewError> {
        let query = self
            .coordination
            .scope(OutboxQuery::fetch(self.settings.max_rows_per_tick));
        if query.is_empty() {
            return Ok(());
        }

        let mut session = self.store.begin().await?;
        let mut rows = session.pending_outbox(query.limit()).await?;
        if rows.is_empty() {
            return Ok(());
        }
        debug!("📬 Draining {} outbox row(s)", rows.len());

        // Initiate every produce in sequence order before awaiting any
        // outcome, so row N's delivery is in flight while row N+1 is
        // dispatched.
        let mut pending = Vec::new();
        for index in 0..rows.len() {
            let row = rows[index].clone();
            let Some(entry) = self.registry.entry(&row.compile_type) else {
                warn!(
                    "🧭 Outbox row {} routes to unregistered type '{}'",
                    row.id, row.compile_type
                );
                rows[index].retries += 1;
                continue;
            };
            match entry.replay(&row).await {
                Ok(Some(handle)) => pending.push((index, handle)),
                Ok(None) => {
                    warn!(
                        "🧭 Producer chain for '{}' short-circuited outbox row {}",
                        row.compile_type, row.id
                    );
                    rows[index].retries += 1;
                }
                Err(e) => {
                    error!("❌ Replaying outbox row {} failed: {e}", row.id);
                    rows[index].retries += 1;
                }
            }
        }

        if !pending.is_empty() {
            if let Err(e) = self.producer.flush(FLUSH_TIMEOUT).await {
                warn!("⏳ Producer flush incomplete: {e}");
            }
        }

        for (index, handle) in pending {
            match handle.wait().await {
                Ok(delivery) => {
                    rows[index].is_success = true;
                    rows[index].processed_at = Some(Utc::now());
                    debug!(
                        "✅ Outbox row {} delivered to partition {} at offset {}",
                        rows[index].id, delivery.partition, delivery.offset
                    );
                }
                Err(e) => {
                    rows[index].retries += 1;
                    warn!(
                        "📮 Outbox row {} not delivered (attempt {}): {e}",
                        rows[index].id, rows[index].retries
                    );
                }
            }
        }

        session.update_outbox(&rows).await?;
        session.commit().await?;
        Ok(())
    }
}
