//! Agent runtime orchestration.

use crate::config::{AgentConfig, PublishedNodesEntry};
use crate::discovery::DiscoveryService;
use crate::mqtt::MqttMessageSink;
use crate::persistence::SqliteStateStore;
use crate::simulation::{SimulatedTransport, SimulationConfig};
use anyhow::{Context, Result};
use opcpub_core::{
    CoreError, CoreResult, DataSetWriter, DataSetWriterConfig, DeviceTransport,
    EndpointDescriptor, EventBroker, Session, SessionPool, StateReporter, SubscriptionClient,
    SubscriptionHandle, SubscriptionSpec, TaskScheduler, WriterState,
};
use opcpub_proto::{DiscoveryRequest, TopicKind, TopicScheme};
use opcpub_sink::{MessageSink, WriterGroup, WriterGroupStats};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct Attachment {
    session: Arc<Session>,
    subscription: SubscriptionHandle,
}

/// Sessions, subscriptions, writers and the writer group of one agent.
pub struct Pipeline {
    pool: SessionPool,
    group: WriterGroup,
    writers: Vec<Arc<DataSetWriter>>,
    attachments: Arc<tokio::sync::Mutex<Vec<Attachment>>>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl Pipeline {
    /// Build the pipeline and start attaching every configured writer.
    ///
    /// Writers attach in the background; unreachable endpoints are retried
    /// with backoff until [`Pipeline::shutdown`].
    ///
    /// # Errors
    ///
    /// Returns error for invalid configuration.
    pub fn start(
        config: &AgentConfig,
        transport: Arc<dyn DeviceTransport>,
        sink: Arc<dyn MessageSink>,
        reporter: Arc<dyn StateReporter>,
    ) -> Result<Self> {
        let mut names = HashSet::new();
        for entry in &config.published_nodes {
            if !names.insert(entry.writer_name.as_str()) {
                anyhow::bail!("Duplicate writer name '{}'", entry.writer_name);
            }
        }

        let pool = SessionPool::new(
            config.session_pool.clone(),
            Arc::clone(&transport),
            Arc::clone(&reporter),
        )
        .context("Invalid session pool configuration")?;
        let group = WriterGroup::new(config.writer_group.clone(), sink)
            .context("Invalid writer group configuration")?;
        let client = SubscriptionClient::new(config.subscriptions.clone(), transport);

        pool.start();
        let queue = group.start();

        let cancel = CancellationToken::new();
        let attachments = Arc::new(tokio::sync::Mutex::new(Vec::new()));
        let mut writers = Vec::with_capacity(config.published_nodes.len());
        let mut tasks = Vec::with_capacity(config.published_nodes.len());

        for (index, entry) in config.published_nodes.iter().enumerate() {
            let writer_id = match entry.writer_id {
                Some(id) => id,
                None => u16::try_from(index + 1).context("Too many writers in one group")?,
            };
            let writer = Arc::new(DataSetWriter::new(
                DataSetWriterConfig {
                    writer_id,
                    name: entry.writer_name.clone(),
                    dataset_name: entry
                        .dataset_name
                        .clone()
                        .unwrap_or_else(|| entry.writer_name.clone()),
                    sequence_origin: 0,
                    application_uri: entry.endpoint.application_uri.clone(),
                },
                Arc::new(queue.clone()),
                Arc::clone(&reporter),
            ));
            writers.push(Arc::clone(&writer));

            let attach = Attach {
                pool: pool.clone(),
                client: client.clone(),
                writer,
                endpoint: entry.endpoint.clone(),
                spec: subscription_spec(entry),
                initial_backoff: config.session_pool.initial_backoff,
                max_backoff: config.session_pool.max_backoff,
                attachments: Arc::clone(&attachments),
                cancel: cancel.child_token(),
            };
            tasks.push(tokio::spawn(attach.run()));
        }

        tracing::info!(
            writers = writers.len(),
            group_id = %config.writer_group.group_id,
            "Pipeline started"
        );

        Ok(Self {
            pool,
            group,
            writers,
            attachments,
            tasks: parking_lot::Mutex::new(tasks),
            cancel,
        })
    }

    /// Writer group counters.
    #[must_use]
    pub fn stats(&self) -> WriterGroupStats {
        self.group.stats()
    }

    /// Current state of every writer, in configuration order.
    #[must_use]
    pub fn writer_states(&self) -> Vec<(String, WriterState)> {
        self.writers
            .iter()
            .map(|writer| (writer.name().to_string(), writer.state()))
            .collect()
    }

    /// Number of writers whose subscription is created.
    pub async fn attached(&self) -> usize {
        self.attachments.lock().await.len()
    }

    /// Session pool.
    #[must_use]
    pub fn pool(&self) -> &SessionPool {
        &self.pool
    }

    /// Close subscriptions, flush the writer group and close all sessions.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(err) = task.await {
                tracing::warn!(error = %err, "Attach task terminated abnormally");
            }
        }

        let attachments: Vec<Attachment> = std::mem::take(&mut *self.attachments.lock().await);
        for attachment in &attachments {
            if let Err(err) = attachment.subscription.close().await {
                tracing::debug!(
                    subscription = %attachment.subscription.name(),
                    error = %err,
                    "Subscription close failed"
                );
            }
        }

        self.group.shutdown().await;
        for writer in &self.writers {
            writer.stop();
        }

        for attachment in &attachments {
            self.pool.release(&attachment.session).await;
        }
        self.pool.shutdown().await;
        tracing::info!("Pipeline stopped");
    }
}

fn subscription_spec(entry: &PublishedNodesEntry) -> SubscriptionSpec {
    SubscriptionSpec {
        name: entry.writer_name.clone(),
        publishing_interval: entry.publishing_interval.map(Duration::from_millis),
        items: entry.nodes.clone(),
    }
}

struct Attach {
    pool: SessionPool,
    client: SubscriptionClient,
    writer: Arc<DataSetWriter>,
    endpoint: EndpointDescriptor,
    spec: SubscriptionSpec,
    initial_backoff: Duration,
    max_backoff: Duration,
    attachments: Arc<tokio::sync::Mutex<Vec<Attachment>>>,
    cancel: CancellationToken,
}

impl Attach {
    /// Keep the writer attached until shutdown.
    ///
    /// A subscription that closes underneath the pipeline (its session was
    /// swept or detached) is released and attached again.
    async fn run(self) {
        loop {
            let Some(subscription) = self.attach_with_retry().await else {
                return;
            };
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return,
                () = subscription.closed() => {}
            }

            let detached = {
                let mut attachments = self.attachments.lock().await;
                attachments
                    .iter()
                    .position(|attachment| attachment.subscription.name() == subscription.name())
                    .map(|index| attachments.swap_remove(index))
            };
            if let Some(attachment) = detached.filter(|a| !a.session.is_closed()) {
                self.pool.release(&attachment.session).await;
            }
            tracing::warn!(
                writer = %self.writer.name(),
                endpoint = %self.endpoint.url,
                "Subscription closed unexpectedly, reattaching"
            );
        }
    }

    async fn attach_with_retry(&self) -> Option<SubscriptionHandle> {
        let mut delay = self.initial_backoff;
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.attach_once().await {
                Ok(attachment) => {
                    tracing::info!(
                        writer = %self.writer.name(),
                        endpoint = %self.endpoint.url,
                        attempt,
                        "Writer attached"
                    );
                    let subscription = attachment.subscription.clone();
                    self.attachments.lock().await.push(attachment);
                    return Some(subscription);
                }
                Err(err) if self.cancel.is_cancelled() => {
                    tracing::debug!(writer = %self.writer.name(), error = %err, "Attach cancelled");
                    return None;
                }
                Err(err) if err.is_retryable() || matches!(err, CoreError::SessionClosed(_)) => {
                    tracing::warn!(
                        writer = %self.writer.name(),
                        endpoint = %self.endpoint.url,
                        attempt,
                        retry_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "Writer attach failed, retrying"
                    );
                    tokio::select! {
                        () = self.cancel.cancelled() => return None,
                        () = tokio::time::sleep(delay) => {}
                    }
                    delay = (delay * 2).min(self.max_backoff);
                }
                Err(err) => {
                    tracing::error!(
                        writer = %self.writer.name(),
                        endpoint = %self.endpoint.url,
                        kind = ?err.kind(),
                        error = %err,
                        "Writer cannot attach"
                    );
                    return None;
                }
            }
        }
    }

    async fn attach_once(&self) -> CoreResult<Attachment> {
        let session = self.pool.acquire(&self.endpoint, &self.cancel).await?;
        let listener = Arc::clone(&self.writer);
        match self
            .client
            .create_subscription(&session, self.spec.clone(), listener)
            .await
        {
            Ok(subscription) => Ok(Attachment {
                session,
                subscription,
            }),
            Err(err) => {
                self.pool.release(&session).await;
                Err(err)
            }
        }
    }
}

/// The main agent runtime.
pub struct Agent {
    config: AgentConfig,
    store: SqliteStateStore,
}

impl Agent {
    /// Create a new agent.
    ///
    /// # Errors
    ///
    /// Returns error if initialization fails.
    pub fn new(config: AgentConfig) -> Result<Self> {
        let store = match config.persistence.store_type.as_str() {
            "sqlite" => SqliteStateStore::open(&config.persistence.db_path)
                .context("Failed to open SQLite database")?,
            "memory" => {
                SqliteStateStore::in_memory().context("Failed to create in-memory store")?
            }
            other => anyhow::bail!("Unsupported store type '{other}'"),
        };

        Ok(Self { config, store })
    }

    fn transport(&self) -> Result<Arc<dyn DeviceTransport>> {
        match self.config.transport.transport_type.as_str() {
            "simulated" => Ok(Arc::new(SimulatedTransport::new(SimulationConfig {
                min_publishing_interval: self.config.transport.min_publishing_interval,
                event_every: self.config.transport.event_every,
            }))),
            other => anyhow::bail!("Unsupported transport '{other}'"),
        }
    }

    /// Run the agent's main loop.
    ///
    /// # Errors
    ///
    /// Returns error if any component fails.
    pub async fn run(self) -> Result<()> {
        tracing::info!(publisher_id = %self.config.publisher_id, "Starting agent runtime");

        let transport = self.transport()?;
        let broker = EventBroker::new(self.config.broker.clone());
        let topics = TopicScheme::new(&self.config.publisher_id);

        let (mqtt, mut eventloop) = MqttMessageSink::connect(
            &self.config.mqtt.broker,
            &self.config.client_id(),
            topics.clone(),
        )
        .context("Failed to create MQTT client")?;

        let events = self
            .config
            .mqtt
            .publish_events
            .then(|| broker.register_all(mqtt.event_forwarder()));

        mqtt.subscribe_discovery().await?;

        let scheduler = Arc::new(
            TaskScheduler::new(self.config.scheduler.clone())
                .context("Invalid task scheduler configuration")?,
        );
        scheduler.start();
        let discovery = DiscoveryService::new(
            Arc::clone(&transport),
            Arc::clone(&scheduler),
            broker.clone(),
        );

        let reporter: Arc<dyn StateReporter> = Arc::new(self.store.with_broker(broker.clone()));
        let pipeline = Pipeline::start(
            &self.config,
            transport,
            Arc::new(mqtt.clone()),
            reporter,
        )?;

        tracing::info!("Agent running, press Ctrl+C to stop");

        // Main event loop
        loop {
            tokio::select! {
                // Handle MQTT events
                event = eventloop.poll() => {
                    match event {
                        Ok(rumqttc::Event::Incoming(rumqttc::Packet::Publish(publish))) => {
                            tracing::debug!(
                                topic = %publish.topic,
                                payload_len = publish.payload.len(),
                                "Received control message"
                            );
                            if topics.parse(&publish.topic) != Some(TopicKind::DiscoveryRequest) {
                                continue;
                            }
                            match DiscoveryRequest::decode(&publish.payload) {
                                Ok(request) => {
                                    let request_id = request.request_id.clone();
                                    if !discovery.submit(request) {
                                        tracing::warn!(request_id, "Discovery request rejected");
                                    }
                                }
                                Err(err) => {
                                    tracing::warn!(error = %err, "Failed to decode discovery request");
                                }
                            }
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::error!(error = %e, "MQTT error");
                            tokio::time::sleep(Duration::from_secs(5)).await;
                        }
                    }
                }

                // Handle shutdown
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Shutdown signal received");
                    break;
                }
            }
        }

        // Keep MQTT flowing while the writer group flushes.
        let draining = CancellationToken::new();
        let mqtt_task = tokio::spawn(drain_eventloop(eventloop, draining.clone()));

        scheduler.shutdown().await;
        pipeline.shutdown().await;
        if let Some(events) = events {
            events.unregister();
        }
        mqtt.disconnect().await;
        draining.cancel();
        if let Err(err) = mqtt_task.await {
            tracing::warn!(error = %err, "MQTT drain task terminated abnormally");
        }

        tracing::info!("Agent stopped");
        Ok(())
    }
}

async fn drain_eventloop(mut eventloop: rumqttc::EventLoop, cancel: CancellationToken) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            event = eventloop.poll() => {
                if event.is_err() {
                    break;
                }
            }
        }
    }
}
