//! Discovery request handling.
//!
//! Requests arrive over MQTT and run on the task scheduler. Progress is
//! reported through the event broker as `DiscoveryProgress` events; servers
//! found with a known application URI are announced as registered.

use opcpub_core::{
    DeviceTransport, DiscoveryStage, EndpointDescriptor, Event, EventBroker, EventEnvelope,
    TaskScheduler,
};
use opcpub_proto::DiscoveryRequest;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Schedules discovery requests and reports their progress.
#[derive(Clone)]
pub struct DiscoveryService {
    transport: Arc<dyn DeviceTransport>,
    scheduler: Arc<TaskScheduler>,
    broker: EventBroker,
}

impl DiscoveryService {
    /// Create a service; `scheduler` must be started by the caller.
    pub fn new(
        transport: Arc<dyn DeviceTransport>,
        scheduler: Arc<TaskScheduler>,
        broker: EventBroker,
    ) -> Self {
        Self {
            transport,
            scheduler,
            broker,
        }
    }

    /// Queue `request`.
    ///
    /// Returns `false` if the scheduler rejected it; a `Rejected` progress
    /// event is published in that case.
    pub fn submit(&self, request: DiscoveryRequest) -> bool {
        let request_id = request.request_id.clone();
        let first_url = request.discovery_urls.first().cloned().unwrap_or_default();
        let broker = self.broker.clone();

        let work = run_discovery(Arc::clone(&self.transport), self.broker.clone(), request);
        let accepted = self.scheduler.try_schedule(work, move || {
            tokio::spawn(async move {
                broker
                    .notify_all(progress(
                        &request_id,
                        &first_url,
                        DiscoveryStage::Rejected,
                        0,
                        Some("discovery queue full".to_string()),
                    ))
                    .await;
            });
        });
        if accepted {
            tracing::debug!(queued = self.scheduler.queued(), "Discovery request queued");
        }
        accepted
    }
}

fn progress(
    request_id: &str,
    discovery_url: &str,
    stage: DiscoveryStage,
    found: usize,
    message: Option<String>,
) -> EventEnvelope {
    EventEnvelope::new(Event::DiscoveryProgress {
        request_id: request_id.to_string(),
        discovery_url: discovery_url.to_string(),
        stage,
        found,
        message,
    })
}

async fn run_discovery(
    transport: Arc<dyn DeviceTransport>,
    broker: EventBroker,
    request: DiscoveryRequest,
) {
    let id = request.request_id.as_str();
    tracing::info!(request_id = id, urls = request.discovery_urls.len(), "Discovery started");

    let mut found: Vec<EndpointDescriptor> = Vec::new();
    let mut failures = 0usize;
    for url in &request.discovery_urls {
        broker
            .notify_all(progress(id, url, DiscoveryStage::Started, found.len(), None))
            .await;
        match transport.find_endpoints(url).await {
            Ok(endpoints) => {
                found.extend(endpoints);
                broker
                    .notify_all(progress(
                        id,
                        url,
                        DiscoveryStage::EndpointsFound,
                        found.len(),
                        None,
                    ))
                    .await;
            }
            Err(err) => {
                failures += 1;
                tracing::warn!(request_id = id, url = %url, error = %err, "Discovery failed");
                broker
                    .notify_all(progress(
                        id,
                        url,
                        DiscoveryStage::Failed,
                        found.len(),
                        Some(err.to_string()),
                    ))
                    .await;
            }
        }
    }

    if request.register {
        let mut applications: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for endpoint in &found {
            if let Some(uri) = &endpoint.application_uri {
                let urls = applications.entry(uri.clone()).or_default();
                if !urls.contains(&endpoint.url) {
                    urls.push(endpoint.url.clone());
                }
            }
        }
        for (application_uri, endpoints) in applications {
            tracing::info!(request_id = id, %application_uri, "Application registered");
            broker
                .notify_all(EventEnvelope::new(Event::ApplicationRegistered {
                    application_uri,
                    endpoints,
                }))
                .await;
        }
    }

    let (stage, message) = if failures == request.discovery_urls.len() && failures > 0 {
        (DiscoveryStage::Failed, Some("no discovery URL answered".to_string()))
    } else {
        (DiscoveryStage::Finished, None)
    };
    broker
        .notify_all(progress(
            id,
            &request.discovery_urls.join(","),
            stage,
            found.len(),
            message,
        ))
        .await;
    tracing::info!(request_id = id, found = found.len(), failures, "Discovery finished");
}
