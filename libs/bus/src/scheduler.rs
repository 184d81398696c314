//! Delayed delivery: in-process timers or a durable polled store.
//!
//! [`InProcessScheduler`] is timer-based and loses pending work on restart;
//! [`PersistedScheduler`] writes every scheduled message to a store first and
//! drains due records on a fixed poll interval, so it survives restarts. An
//! unroutable due record is skipped and retried on the next poll rather than
//! crashing the loop.

use crate::BusError;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use envelope::{names, BusMessage, Envelope, MessageSerializer};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use transport::HostRegistry;
use url::Url;
use uuid::Uuid;

/// One persisted scheduled message.
#[derive(Debug, Clone)]
pub struct ScheduledRecord {
    pub token_id: Uuid,
    pub body: Bytes,
    pub content_type: String,
    pub message_type: String,
    /// `Some` for a scheduled send, `None` for a scheduled publish.
    pub destination_address: Option<Url>,
    pub scheduled_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub dispatched_at: Option<DateTime<Utc>>,
}

impl ScheduledRecord {
    pub fn to_envelope(&self, source_address: &Url) -> Envelope {
        Envelope::builder(self.message_type.clone())
            .body(self.body.clone())
            .content_type(self.content_type.clone())
            .header(names::SOURCE_ADDRESS, source_address.as_str())
            .build()
    }

    pub fn is_dispatched(&self) -> bool {
        self.dispatched_at.is_some()
    }
}

/// Storage port for scheduled messages.
#[async_trait]
pub trait ScheduledMessageStore: Send + Sync {
    async fn add(&self, record: ScheduledRecord) -> Result<(), BusError>;

    /// Records with `scheduled_at <= now` and no dispatch time, oldest first.
    async fn get_due(
        &self,
        now: DateTime<Utc>,
        max_count: usize,
    ) -> Result<Vec<ScheduledRecord>, BusError>;

    async fn mark_dispatched(&self, token_id: Uuid, at: DateTime<Utc>) -> Result<(), BusError>;

    /// Remove a not-yet-fired record; `false` if it was already gone or
    /// already dispatched.
    async fn cancel(&self, token_id: Uuid) -> Result<bool, BusError>;

    async fn get(&self, token_id: Uuid) -> Result<Option<ScheduledRecord>, BusError>;
}

/// Vec-backed store for tests and single-process deployments.
#[derive(Default)]
pub struct InMemoryScheduledStore {
    records: Mutex<Vec<ScheduledRecord>>,
}

impl InMemoryScheduledStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ScheduledMessageStore for InMemoryScheduledStore {
    async fn add(&self, record: ScheduledRecord) -> Result<(), BusError> {
        self.records.lock().push(record);
        Ok(())
    }

    async fn get_due(
        &self,
        now: DateTime<Utc>,
        max_count: usize,
    ) -> Result<Vec<ScheduledRecord>, BusError> {
        let records = self.records.lock();
        let mut due: Vec<ScheduledRecord> = records
            .iter()
            .filter(|r| r.dispatched_at.is_none() && r.scheduled_at <= now)
            .cloned()
            .collect();
        due.sort_by_key(|r| r.scheduled_at);
        due.truncate(max_count);
        Ok(due)
    }

    async fn mark_dispatched(&self, token_id: Uuid, at: DateTime<Utc>) -> Result<(), BusError> {
        let mut records = self.records.lock();
        match records.iter_mut().find(|r| r.token_id == token_id) {
            Some(record) => {
                record.dispatched_at = Some(at);
                Ok(())
            }
            None => Err(BusError::store(format!(
                "scheduled message {token_id} not found"
            ))),
        }
    }

    async fn cancel(&self, token_id: Uuid) -> Result<bool, BusError> {
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|r| r.token_id != token_id || r.dispatched_at.is_some());
        Ok(records.len() < before)
    }

    async fn get(&self, token_id: Uuid) -> Result<Option<ScheduledRecord>, BusError> {
        Ok(self
            .records
            .lock()
            .iter()
            .find(|r| r.token_id == token_id)
            .cloned())
    }
}

/// Timer-based scheduler: one delay task per message, nothing persisted.
pub struct InProcessScheduler {
    hosts: Arc<HostRegistry>,
    bus_address: Url,
    serializer: Arc<dyn MessageSerializer>,
    /// Per-message cancellation handles for pending timers.
    timers: Arc<DashMap<Uuid, CancellationToken>>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl InProcessScheduler {
    pub fn new(
        hosts: Arc<HostRegistry>,
        bus_address: Url,
        serializer: Arc<dyn MessageSerializer>,
    ) -> Self {
        Self {
            hosts,
            bus_address,
            serializer,
            timers: Arc::new(DashMap::new()),
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn schedule_send<T: BusMessage>(
        &self,
        destination: Url,
        scheduled_at: DateTime<Utc>,
        message: &T,
    ) -> Result<Uuid, BusError> {
        self.schedule(Some(destination), scheduled_at, message)
    }

    pub fn schedule_publish<T: BusMessage>(
        &self,
        scheduled_at: DateTime<Utc>,
        message: &T,
    ) -> Result<Uuid, BusError> {
        self.schedule(None, scheduled_at, message)
    }

    fn schedule<T: BusMessage>(
        &self,
        destination: Option<Url>,
        scheduled_at: DateTime<Utc>,
        message: &T,
    ) -> Result<Uuid, BusError> {
        let token_id = Uuid::new_v4();
        let body = self.serializer.encode(message)?;
        let envelope = Envelope::builder(T::message_type())
            .body(body)
            .content_type(self.serializer.content_type())
            .header(names::SOURCE_ADDRESS, self.bus_address.as_str())
            .build();

        let timer = self.cancel.child_token();
        self.timers.insert(token_id, timer.clone());

        let hosts = self.hosts.clone();
        let bus_address = self.bus_address.clone();
        let message_type = T::message_type().to_string();
        let timers = self.timers.clone();
        let delay = delay_until(scheduled_at);
        self.tracker.spawn(async move {
            tokio::select! {
                _ = timer.cancelled() => {
                    debug!(%token_id, "scheduled message cancelled");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
            timers.remove(&token_id);
            if let Err(err) =
                dispatch(&hosts, &bus_address, destination.as_ref(), &message_type, envelope).await
            {
                // A delay task aborts cleanly without retrying.
                warn!(%token_id, error = %err, "scheduled dispatch failed");
            }
        });
        Ok(token_id)
    }

    /// Cancel a pending timer; `false` if it already fired or was cancelled.
    pub fn cancel_scheduled(&self, token_id: Uuid) -> bool {
        match self.timers.remove(&token_id) {
            Some((_, timer)) => {
                timer.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        self.timers.clear();
    }
}

#[derive(Debug, Clone)]
pub struct PersistedSchedulerConfig {
    pub poll_interval: Duration,
    pub batch_size: usize,
}

impl Default for PersistedSchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_size: 100,
        }
    }
}

/// Durable scheduler: persist first, then poll for due records.
pub struct PersistedScheduler {
    store: Arc<dyn ScheduledMessageStore>,
    hosts: Arc<HostRegistry>,
    bus_address: Url,
    serializer: Arc<dyn MessageSerializer>,
    config: PersistedSchedulerConfig,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PersistedScheduler {
    pub fn new(
        store: Arc<dyn ScheduledMessageStore>,
        hosts: Arc<HostRegistry>,
        bus_address: Url,
        serializer: Arc<dyn MessageSerializer>,
        config: PersistedSchedulerConfig,
    ) -> Self {
        Self {
            store,
            hosts,
            bus_address,
            serializer,
            config,
            cancel: CancellationToken::new(),
            handle: Mutex::new(None),
        }
    }

    pub async fn schedule_send<T: BusMessage>(
        &self,
        destination: Url,
        scheduled_at: DateTime<Utc>,
        message: &T,
    ) -> Result<Uuid, BusError> {
        self.schedule(Some(destination), scheduled_at, message).await
    }

    pub async fn schedule_publish<T: BusMessage>(
        &self,
        scheduled_at: DateTime<Utc>,
        message: &T,
    ) -> Result<Uuid, BusError> {
        self.schedule(None, scheduled_at, message).await
    }

    async fn schedule<T: BusMessage>(
        &self,
        destination: Option<Url>,
        scheduled_at: DateTime<Utc>,
        message: &T,
    ) -> Result<Uuid, BusError> {
        let record = ScheduledRecord {
            token_id: Uuid::new_v4(),
            body: self.serializer.encode(message)?,
            content_type: self.serializer.content_type().to_string(),
            message_type: T::message_type().to_string(),
            destination_address: destination,
            scheduled_at,
            created_at: Utc::now(),
            dispatched_at: None,
        };
        let token_id = record.token_id;
        self.store.add(record).await?;
        Ok(token_id)
    }

    pub async fn cancel_scheduled(&self, token_id: Uuid) -> Result<bool, BusError> {
        self.store.cancel(token_id).await
    }

    /// Start the polling loop. Idempotent.
    pub fn start(self: &Arc<Self>) {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return;
        }
        let scheduler = self.clone();
        *handle = Some(tokio::spawn(async move {
            scheduler.poll_loop().await;
        }));
        info!("persisted scheduler started");
    }

    async fn poll_loop(&self) {
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = interval.tick() => {}
            }
            if let Err(err) = self.drain_due().await {
                warn!(error = %err, "scheduler poll cycle failed");
            }
        }
    }

    async fn drain_due(&self) -> Result<(), BusError> {
        let due = self
            .store
            .get_due(Utc::now(), self.config.batch_size)
            .await?;
        for record in due {
            let envelope = record.to_envelope(&self.bus_address);
            match dispatch(
                &self.hosts,
                &self.bus_address,
                record.destination_address.as_ref(),
                &record.message_type,
                envelope,
            )
            .await
            {
                Ok(()) => {
                    self.store
                        .mark_dispatched(record.token_id, Utc::now())
                        .await?;
                    debug!(token_id = %record.token_id, "scheduled message dispatched");
                }
                Err(err) => {
                    // Left due; the next poll retries it.
                    warn!(
                        token_id = %record.token_id,
                        error = %err,
                        "scheduled message undeliverable, will retry next poll"
                    );
                }
            }
        }
        Ok(())
    }

    /// Stop the polling loop and wait for it. Idempotent.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

/// Send to the destination, or publish through the bus's own host.
async fn dispatch(
    hosts: &HostRegistry,
    bus_address: &Url,
    destination: Option<&Url>,
    message_type: &str,
    envelope: Envelope,
) -> Result<(), BusError> {
    match destination {
        Some(destination) => {
            let host = hosts.resolve(destination)?;
            let transport = host.send_transport(destination).await?;
            transport.send(envelope).await?;
        }
        None => {
            let host = hosts.resolve(bus_address)?;
            let transport = host.publish_transport(message_type).await?;
            transport.publish(envelope).await?;
        }
    }
    Ok(())
}

fn delay_until(scheduled_at: DateTime<Utc>) -> Duration {
    (scheduled_at - Utc::now()).to_std().unwrap_or(Duration::ZERO)
}
