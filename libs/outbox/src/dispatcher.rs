//! The outbox delivery pump.
//!
//! Two cooperating loops over one store:
//!
//! - the dispatch loop drains a bounded in-process channel (the fast path fed
//!   by `enqueue`) and starts one delivery task per ready destination;
//! - the poll loop re-reads unsent records on a fixed interval, which is what
//!   provides crash recovery and catches anything the fast path missed.
//!
//! Per message: `Enqueued` (persisted) → `Inflight` (claimed) → `Sent`
//! (persisted success), with a fixed-delay infinite retry on failure. A
//! message is never dropped silently.

use crate::{OutboxError, OutboxRecord, OutboxStore};
use chrono::Utc;
use dashmap::DashSet;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use transport::HostRegistry;
use url::Url;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct OutboxDispatcherConfig {
    /// Interval of the crash-recovery polling loop.
    pub poll_interval: Duration,
    /// Fixed delay between delivery attempts for one message.
    pub retry_delay: Duration,
    /// Max records read per poll cycle.
    pub batch_size: usize,
    /// Capacity of the in-process fast-path channel.
    pub channel_capacity: usize,
    /// Global cap on simultaneous destination deliveries.
    pub max_concurrent_destinations: usize,
    /// Soft deadline for loops and delivery tasks on shutdown.
    pub shutdown_grace: Duration,
}

impl Default for OutboxDispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            retry_delay: Duration::from_secs(1),
            batch_size: 100,
            channel_capacity: 1024,
            max_concurrent_destinations: 16,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

struct Inner {
    store: Arc<dyn OutboxStore>,
    hosts: Arc<HostRegistry>,
    /// Publishes are routed through the bus's own host.
    bus_address: Url,
    /// Messages currently queued or being delivered (de-dup guard).
    in_flight: DashSet<Uuid>,
    /// Destination keys with a delivery in progress.
    active_destinations: DashSet<String>,
    semaphore: Arc<Semaphore>,
    tracker: TaskTracker,
    cancel: CancellationToken,
    config: OutboxDispatcherConfig,
}

impl Inner {
    /// One delivery attempt: resolve the host and send or publish.
    async fn attempt(&self, record: &OutboxRecord) -> Result<(), OutboxError> {
        let envelope = record.to_envelope();
        match &record.destination_address {
            Some(destination) => {
                let host = self.hosts.resolve(destination)?;
                let transport = host.send_transport(destination).await?;
                transport.send(envelope).await?;
            }
            None => {
                let host = self.hosts.resolve(&self.bus_address)?;
                let transport = host.publish_transport(&record.message_type).await?;
                transport.publish(envelope).await?;
            }
        }
        Ok(())
    }

    /// Retry the same message until delivered or cancelled.
    async fn deliver_until_sent(&self, record: OutboxRecord) {
        loop {
            if self.cancel.is_cancelled() {
                return;
            }
            match self.attempt(&record).await {
                Ok(()) => {
                    if let Err(err) = self.store.mark_sent(record.message_id, Utc::now()).await {
                        // Delivery happened; a redelivery after restart is
                        // covered by at-least-once semantics.
                        warn!(
                            message_id = %record.message_id,
                            error = %err,
                            "delivered but failed to mark sent"
                        );
                    }
                    debug!(message_id = %record.message_id, "outbox message delivered");
                    return;
                }
                Err(err) => {
                    debug!(
                        message_id = %record.message_id,
                        destination = %record.destination_key(),
                        error = %err,
                        "delivery attempt failed, will retry"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return,
                        _ = tokio::time::sleep(self.config.retry_delay) => {}
                    }
                }
            }
        }
    }
}

/// At-least-once delivery pump over an [`OutboxStore`].
pub struct OutboxDispatcher {
    inner: Arc<Inner>,
    tx: mpsc::Sender<OutboxRecord>,
    rx: Mutex<Option<mpsc::Receiver<OutboxRecord>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl OutboxDispatcher {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        hosts: Arc<HostRegistry>,
        bus_address: Url,
        config: OutboxDispatcherConfig,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.channel_capacity);
        Self {
            inner: Arc::new(Inner {
                store,
                hosts,
                bus_address,
                in_flight: DashSet::new(),
                active_destinations: DashSet::new(),
                semaphore: Arc::new(Semaphore::new(config.max_concurrent_destinations)),
                tracker: TaskTracker::new(),
                cancel: CancellationToken::new(),
                config,
            }),
            tx,
            rx: Mutex::new(Some(rx)),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Persist a message and hand it to the fast path.
    ///
    /// The store write is the durability point: a crash after this call still
    /// delivers on restart. The channel hand-off is best effort only — a full
    /// channel just defers the message to the next poll cycle.
    pub async fn enqueue(&self, record: OutboxRecord) -> Result<(), OutboxError> {
        self.inner.store.add(record.clone()).await?;
        let message_id = record.message_id;
        if self.inner.in_flight.insert(message_id) && self.tx.try_send(record).is_err() {
            self.inner.in_flight.remove(&message_id);
        }
        Ok(())
    }

    /// Start the dispatch and poll loops. Idempotent.
    pub fn start(&self) {
        let Some(rx) = self.rx.lock().take() else {
            return;
        };
        info!("outbox dispatcher starting");
        let dispatch = tokio::spawn(dispatch_loop(self.inner.clone(), rx));
        let poll = tokio::spawn(poll_loop(self.inner.clone(), self.tx.clone()));
        self.handles.lock().extend([dispatch, poll]);
    }

    /// Cooperative shutdown: cancel both loops and in-progress deliveries,
    /// then wait up to the configured grace period. Never fails for normal
    /// cancellation.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.inner.tracker.close();

        let grace = self.inner.config.shutdown_grace;
        let handles: Vec<JoinHandle<()>> = self.handles.lock().drain(..).collect();
        for handle in handles {
            if tokio::time::timeout(grace, handle).await.is_err() {
                warn!("outbox loop did not stop within the grace period");
            }
        }
        if tokio::time::timeout(grace, self.inner.tracker.wait())
            .await
            .is_err()
        {
            warn!("outbox deliveries did not stop within the grace period");
        }

        self.inner.in_flight.clear();
        self.inner.active_destinations.clear();
        info!("outbox dispatcher stopped");
    }
}

async fn dispatch_loop(inner: Arc<Inner>, mut rx: mpsc::Receiver<OutboxRecord>) {
    loop {
        let record = tokio::select! {
            _ = inner.cancel.cancelled() => break,
            received = rx.recv() => match received {
                Some(record) => record,
                None => break,
            },
        };

        let key = record.destination_key();
        if !inner.active_destinations.insert(key.clone()) {
            // Destination busy: skip this pass, the next poll re-discovers it.
            inner.in_flight.remove(&record.message_id);
            debug!(destination = %key, "destination busy, deferring message");
            continue;
        }

        let task_inner = inner.clone();
        inner.tracker.spawn(async move {
            let message_id = record.message_id;
            match task_inner.semaphore.clone().acquire_owned().await {
                Ok(_permit) => task_inner.deliver_until_sent(record).await,
                Err(_closed) => {}
            }
            task_inner.active_destinations.remove(&key);
            task_inner.in_flight.remove(&message_id);
        });
    }
}

async fn poll_loop(inner: Arc<Inner>, tx: mpsc::Sender<OutboxRecord>) {
    let mut ticker = tokio::time::interval(inner.config.poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        match inner.store.get_pending(inner.config.batch_size).await {
            Ok(records) => {
                for record in records {
                    let message_id = record.message_id;
                    if inner.in_flight.insert(message_id) && tx.try_send(record).is_err() {
                        // Channel full or closed: release the claim so the
                        // next cycle can try again.
                        inner.in_flight.remove(&message_id);
                    }
                }
            }
            Err(err) => warn!(error = %err, "outbox poll failed"),
        }
    }
}
