//! Transaction scope: the explicit unit-of-work object that ties queued
//! produces to the host transaction's commit.
//!
//! Publishing never talks to the broker directly. `publish` queues a
//! command; `save_changes` stages every command's transactional side
//! effects (outbox rows, inbox rows), commits the host session, and only
//! then lets anything reach the broker. Command order is preserved so
//! per-aggregate ordering survives.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::broker::{BrokerProducer, OutgoingRecord};
use crate::errors::KewError;
use crate::message::Message;
use crate::outbox::OutboxEngine;
use crate::registry::TypeRegistry;
use crate::store::{InboxInsert, InboxRow, OutboxRow, Store, StoreSession};

/// Everything a scope needs from the client.
pub(crate) struct ScopeServices {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) registry: Arc<TypeRegistry>,
    pub(crate) producer: Arc<dyn BrokerProducer>,
    pub(crate) engine: Arc<OutboxEngine>,
}

/// A produce deferred until after the host transaction commits.
pub(crate) struct ProduceJob {
    pub(crate) record: OutgoingRecord,
    pub(crate) follow_up: FollowUp,
}

pub(crate) enum FollowUp {
    /// Await delivery; broker errors surface to the caller.
    Direct,
    /// Immediate-with-fallback outbox publish: mark the row on success,
    /// leave it for the poll engine on failure.
    MarkRow(OutboxRow),
    /// Await up to the timeout, swallowing errors.
    AwaitForget(Duration),
    /// Launch concurrently, never await.
    FireForget,
}

/// Shared transactional sink the pipeline stages write through.
pub(crate) struct TxSink {
    session: tokio::sync::Mutex<Box<dyn StoreSession>>,
    post_commit: Mutex<Vec<ProduceJob>>,
}

impl TxSink {
    fn new(session: Box<dyn StoreSession>) -> Self {
        Self {
            session: tokio::sync::Mutex::new(session),
            post_commit: Mutex::new(Vec::new()),
        }
    }

    /// Assign the next sequence number and stage the row; returns the row
    /// as staged.
    pub(crate) async fn stage_outbox(&self, mut row: OutboxRow) -> Result<OutboxRow, KewError> {
        let mut session = self.session.lock().await;
        row.sequence_number = session.next_outbox_sequence().await?;
        session.stage_outbox(row.clone());
        Ok(row)
    }

    pub(crate) async fn insert_inbox(&self, row: InboxRow) -> Result<InboxInsert, KewError> {
        let mut session = self.session.lock().await;
        Ok(session.insert_inbox(row).await?)
    }

    pub(crate) fn queue_job(&self, job: ProduceJob) {
        self.post_commit.lock().push(job);
    }
}

/// A queued publish awaiting `save_changes`.
#[async_trait]
pub(crate) trait ScopeCommand: Send {
    async fn stage(self: Box<Self>, sink: &Arc<TxSink>) -> Result<(), KewError>;

    /// Whether this command's type is configured fire-and-forget, the only
    /// strategy `save_changes_detached` accepts.
    fn is_fire_forget(&self) -> bool;
}

/// Unit of work for one request or one consumed record.
pub struct Scope {
    services: Arc<ScopeServices>,
    sink: tokio::sync::Mutex<Option<Arc<TxSink>>>,
    commands: Mutex<Vec<Box<dyn ScopeCommand>>>,
}

impl Scope {
    pub(crate) fn attach(services: Arc<ScopeServices>) -> Arc<Self> {
        Arc::new(Self {
            services,
            sink: tokio::sync::Mutex::new(None),
            commands: Mutex::new(Vec::new()),
        })
    }

    /// Queue a message for publication when this scope saves.
    pub fn publish<M: Message>(&self, message: M) -> Result<(), KewError> {
        let runtime = self.services.registry.producer_runtime::<M>()?;
        self.commands.lock().push(runtime.command(message));
        Ok(())
    }

    /// Number of queued, not yet saved, publishes.
    pub fn pending_publishes(&self) -> usize {
        self.commands.lock().len()
    }

    /// The transactional sink, opening the host session on first use.
    pub(crate) async fn sink(&self) -> Result<Arc<TxSink>, KewError> {
        let mut slot = self.sink.lock().await;
        if let Some(sink) = slot.as_ref() {
            return Ok(sink.clone());
        }
        let session = self.services.store.begin().await?;
        let sink = Arc::new(TxSink::new(session));
        *slot = Some(sink.clone());
        Ok(sink)
    }

    /// Commit the host transaction and deliver the queued publishes.
    pub async fn save_changes(&self) -> Result<(), KewError> {
        self.save_inner(false).await
    }

    /// Commit, then fire every produce without awaiting delivery.
    ///
    /// Only valid when every queued message type uses the `FireForget`
    /// strategy; anything else fails fast before touching the store.
    pub async fn save_changes_detached(&self) -> Result<(), KewError> {
        self.save_inner(true).await
    }

    async fn save_inner(&self, detached: bool) -> Result<(), KewError> {
        let commands: Vec<Box<dyn ScopeCommand>> =
            self.commands.lock().drain(..).collect();

        if detached && commands.iter().any(|c| !c.is_fire_forget()) {
            return Err(KewError::Config(
                "save_changes_detached requires every queued message type to use FireForget"
                    .to_string(),
            ));
        }

        let sink = {
            let mut slot = self.sink.lock().await;
            match slot.take() {
                Some(sink) => sink,
                None if commands.is_empty() => return Ok(()),
                None => {
                    let session = self.services.store.begin().await?;
                    Arc::new(TxSink::new(session))
                }
            }
        };

        for command in commands {
            command.stage(&sink).await?;
        }

        let sink = Arc::try_unwrap(sink).map_err(|_| {
            KewError::Pipeline("transaction sink still referenced at commit time".to_string())
        })?;
        let session = sink.session.into_inner();
        session.commit().await?;

        let jobs = sink.post_commit.into_inner();
        debug!("💾 Scope committed with {} post-commit publish(es)", jobs.len());
        for job in jobs {
            self.run_job(job).await?;
        }

        if self.services.registry.has_outbox_types() {
            self.services.engine.clone().ensure_started();
        }
        Ok(())
    }

    async fn run_job(&self, job: ProduceJob) -> Result<(), KewError> {
        let producer = self.services.producer.clone();
        match job.follow_up {
            FollowUp::Direct => {
                let handle = producer.send(job.record).await?;
                handle.wait().await?;
                Ok(())
            }
            FollowUp::MarkRow(mut row) => {
                let handle = producer.send(job.record).await?;
                match handle.wait().await {
                    Ok(_) => {
                        row.is_success = true;
                        row.processed_at = Some(Utc::now());
                        let mut session = self.services.store.begin().await?;
                        session.update_outbox(std::slice::from_ref(&row)).await?;
                        session.commit().await?;
                        Ok(())
                    }
                    Err(e) => {
                        warn!(
                            "📮 Immediate publish to {} failed ({e}); row {} stays for the poll engine",
                            row.topic, row.id
                        );
                        Ok(())
                    }
                }
            }
            FollowUp::AwaitForget(limit) => {
                let topic = job.record.topic.clone();
                let attempt = async move {
                    match producer.send(job.record).await {
                        Ok(handle) => {
                            if let Err(e) = handle.wait().await {
                                debug!("🙈 Awaited-forget publish to {topic} failed: {e}");
                            }
                        }
                        Err(e) => debug!("🙈 Awaited-forget publish to {topic} failed: {e}"),
                    }
                };
                if tokio::time::timeout(limit, attempt).await.is_err() {
                    debug!("🙈 Awaited-forget publish timed out after {limit:?}");
                }
                Ok(())
            }
            FollowUp::FireForget => {
                let topic = job.record.topic.clone();
                let record = job.record;
                tokio::spawn(async move {
                    match producer.send(record).await {
                        Ok(handle) => {
                            if let Err(e) = handle.wait().await {
                                debug!("🙈 Fire-and-forget publish to {topic} failed: {e}");
                            }
                        }
                        Err(e) => {
                            error!("❌ Fire-and-forget publish to {topic} failed to enqueue: {e}")
                        }
                    }
                });
                Ok(())
            }
        }
    }
}
