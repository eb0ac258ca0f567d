//! Twin reconciler
//!
//! Owns the admitted devices and one task per (device, property).
//!
//! ## Architecture
//!
//! ```text
//!                 admit(device)
//!                      │
//!                      ▼
//!             ┌──────────────────┐      ┌────────────────┐
//!             │ VisitorResolver  │─────▶│ ModelRegistry  │
//!             └──────────────────┘      └────────────────┘
//!                      │ one task per property
//!                      ▼
//!   ┌───────────────────────────────────────────┐
//!   │ PropertyWorker                             │
//!   │  collect tick ─▶ read ─▶ decode ─▶ twin    │──── TwinEvent ───▶ status stream
//!   │  mismatch ─────▶ encode ─▶ write           │
//!   │  inbox ◀─── run_with_shutdown (reports)    │
//!   └───────────────────────────────────────────┘
//!   ┌───────────────────────────────────────────┐
//!   │ SnapshotReporter (sibling task)            │
//!   │  report tick ──▶ snapshot                  │──── TwinEvent::ReportPushed
//!   └───────────────────────────────────────────┘
//!                      │
//!                      ▼
//!                 Transport
//! ```
//!
//! ## Failure policy
//!
//! - `Config`: the property is degraded and its task stops
//! - `Decode`/`Encode`/`Codec`: retried with exponential backoff up to
//!   `collectRetryTimes`, then degraded until the next successful cycle
//! - `Transport`: not counted; the task pauses until the link is back
//! - anything else: the property is degraded and its task stops
//!
//! The report cycle runs in its own task and is never delayed by any of
//! the above.
//!
//! Nothing a property does affects any other property.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};

use super::{PropertyStatus, PropertyTwin, TwinEvent, TwinProperty, TwinState};
use crate::config::ReconcilerConfig;
use crate::device::{Device, ResolvedProperty, VisitorResolver};
use crate::error::{Error, Result};
use crate::model::{ModelRegistry, PropertyValue};
use crate::registry::PluginRegistry;
use crate::traits::{InboundReport, Transport};

/// Unsolicited reports buffered per property before new ones are dropped
const INBOX_CAPACITY: usize = 16;

/// Drives twin reconciliation for every admitted device
pub struct TwinReconciler {
    models: Arc<ModelRegistry>,
    plugins: Arc<PluginRegistry>,
    transport: Arc<dyn Transport>,
    config: ReconcilerConfig,
    devices: RwLock<HashMap<String, DeviceHandle>>,
    events: EventSink,
}

struct DeviceHandle {
    model: String,
    cancel: watch::Sender<bool>,
    properties: HashMap<String, PropertyHandle>,
}

struct PropertyHandle {
    twin: Arc<Mutex<PropertyTwin>>,
    inbox: mpsc::Sender<Vec<u8>>,
    task: JoinHandle<()>,
}

impl DeviceHandle {
    /// Cancel every property task and wait for them to finish
    async fn shutdown(self, device_id: &str) {
        self.cancel.send_replace(true);
        for (name, property) in self.properties {
            if let Err(e) = property.task.await {
                error!("Task for {}/{} ended abnormally: {}", device_id, name, e);
            }
        }
    }
}

impl TwinReconciler {
    /// Create a new reconciler
    ///
    /// # Returns
    ///
    /// A tuple of (reconciler, status_receiver) where status_receiver yields
    /// twin events for every admitted device
    pub fn new(
        models: Arc<ModelRegistry>,
        plugins: Arc<PluginRegistry>,
        transport: Arc<dyn Transport>,
        config: ReconcilerConfig,
    ) -> Result<(Self, mpsc::Receiver<TwinEvent>)> {
        config.validate()?;

        let (tx, rx) = mpsc::channel(config.status_channel_capacity);

        let reconciler = Self {
            models,
            plugins,
            transport,
            config,
            devices: RwLock::new(HashMap::new()),
            events: EventSink { tx },
        };

        Ok((reconciler, rx))
    }

    /// Admit a device and start its property tasks
    ///
    /// Every visitor is resolved before anything starts; a `Config` error
    /// leaves no trace. Admitting an ID that is already running replaces
    /// the previous device after its tasks have stopped.
    pub async fn admit(&self, device: Device) -> Result<()> {
        let resolved = VisitorResolver::new(&self.models, &self.plugins).resolve(&device)?;
        self.models.bind(&device.model, &device.id)?;

        let previous = self.devices.write().await.remove(&device.id);
        if let Some(previous) = previous {
            info!("Replacing device {}", device.id);
            let previous_model = previous.model.clone();
            previous.shutdown(&device.id).await;
            if previous_model != device.model {
                self.models.unbind(&previous_model, &device.id);
            }
        }

        let (cancel, cancel_rx) = watch::channel(false);
        let mut properties = HashMap::with_capacity(resolved.properties.len());

        for property in resolved.properties {
            let name = property.definition.name.clone();
            let twin = Arc::new(Mutex::new(PropertyTwin::new(property.definition.clone())));
            let (inbox, inbox_rx) = mpsc::channel(INBOX_CAPACITY);

            let worker = PropertyWorker {
                device_id: device.id.clone(),
                retry_times: self.config.retry_times(&property.visitor),
                collect_cycle: self.config.collect_cycle(&property.visitor),
                report_cycle: self.config.report_cycle(&property.visitor),
                property,
                twin: twin.clone(),
                transport: self.transport.clone(),
                events: self.events.clone(),
                cancel: cancel_rx.clone(),
                config: self.config.clone(),
            };
            let task = tokio::spawn(worker.run(inbox_rx));

            properties.insert(name, PropertyHandle { twin, inbox, task });
        }

        info!(
            "Admitted device {} ({} properties, model {})",
            device.id,
            properties.len(),
            device.model
        );

        let handle = DeviceHandle {
            model: device.model.clone(),
            cancel,
            properties,
        };
        // A concurrent admit of the same ID may have slipped in meanwhile
        let raced = self.devices.write().await.insert(device.id.clone(), handle);
        if let Some(raced) = raced {
            let raced_model = raced.model.clone();
            raced.shutdown(&device.id).await;
            if raced_model != device.model {
                self.models.unbind(&raced_model, &device.id);
            }
        }
        Ok(())
    }

    /// Stop all property tasks of a device and release its model
    ///
    /// In-flight reads, writes and retry sleeps are abandoned; when this
    /// returns no task of the device touches the transport again.
    pub async fn remove_device(&self, device_id: &str) -> Result<()> {
        let handle = self
            .devices
            .write()
            .await
            .remove(device_id)
            .ok_or_else(|| Error::not_found(format!("device '{}'", device_id)))?;

        let model = handle.model.clone();
        handle.shutdown(device_id).await;
        self.models.unbind(&model, device_id);
        info!("Removed device {}", device_id);
        Ok(())
    }

    /// Set the desired value of a property
    ///
    /// # Returns
    ///
    /// - `Ok(())`: Accepted; the property task converges towards it
    /// - `Err(Error::Config)`: Read-only property or invalid value
    /// - `Err(Error::NotFound)`: Unknown device or property
    pub async fn set_desired(&self, device_id: &str, property_name: &str, value: &str) -> Result<()> {
        let twin = self.twin_handle(device_id, property_name).await?;
        let mut twin = twin.lock().await;
        match twin.set_desired(value) {
            Ok(canonical) => {
                debug!("Desired {}/{} = {}", device_id, property_name, canonical);
                self.events.emit(TwinEvent::DesiredAccepted {
                    device_id: device_id.to_string(),
                    property_name: property_name.to_string(),
                    value: canonical,
                });
                Ok(())
            }
            Err(e) => {
                warn!("Rejected desired value for {}/{}: {}", device_id, property_name, e);
                Err(e)
            }
        }
    }

    /// Snapshot of a property's twin
    pub async fn twin(&self, device_id: &str, property_name: &str) -> Option<TwinProperty> {
        let twin = self.twin_handle(device_id, property_name).await.ok()?;
        let twin = twin.lock().await;
        Some(twin.twin().clone())
    }

    /// Health of a property
    pub async fn health(&self, device_id: &str, property_name: &str) -> Option<PropertyStatus> {
        let twin = self.twin_handle(device_id, property_name).await.ok()?;
        let twin = twin.lock().await;
        Some(twin.status())
    }

    /// IDs of admitted devices
    pub async fn devices(&self) -> Vec<String> {
        self.devices.read().await.keys().cloned().collect()
    }

    async fn twin_handle(
        &self,
        device_id: &str,
        property_name: &str,
    ) -> Result<Arc<Mutex<PropertyTwin>>> {
        let devices = self.devices.read().await;
        let device = devices
            .get(device_id)
            .ok_or_else(|| Error::not_found(format!("device '{}'", device_id)))?;
        let property = device.properties.get(property_name).ok_or_else(|| {
            Error::not_found(format!("property '{}' of device '{}'", property_name, device_id))
        })?;
        Ok(property.twin.clone())
    }

    /// Route inbound reports until Ctrl-C, then stop every device
    pub async fn run(&self) -> Result<()> {
        self.run_internal(None).await
    }

    /// Route inbound reports until `shutdown_rx` fires, then stop every device
    pub async fn run_with_shutdown(&self, shutdown_rx: Option<oneshot::Receiver<()>>) -> Result<()> {
        self.run_internal(shutdown_rx).await
    }

    async fn run_internal(&self, shutdown_rx: Option<oneshot::Receiver<()>>) -> Result<()> {
        let mut reports = self.transport.reports();
        let shutdown = async {
            match shutdown_rx {
                Some(rx) => {
                    let _ = rx.await;
                }
                None => {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        error!("Failed to listen for Ctrl-C: {}", e);
                    }
                }
            }
        };
        tokio::pin!(shutdown);

        let mut stream_open = true;
        loop {
            tokio::select! {
                report = reports.next(), if stream_open => match report {
                    Some(report) => self.route(report).await,
                    None => {
                        debug!("Inbound report stream ended");
                        stream_open = false;
                    }
                },

                _ = &mut shutdown => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        self.shutdown_all().await;
        Ok(())
    }

    async fn route(&self, report: InboundReport) {
        let devices = self.devices.read().await;
        let Some(property) = devices
            .get(&report.device_id)
            .and_then(|device| device.properties.get(&report.property_name))
        else {
            debug!(
                "Dropping report for unknown {}/{}",
                report.device_id, report.property_name
            );
            return;
        };
        if property.inbox.try_send(report.payload).is_err() {
            warn!(
                "Inbox full for {}/{}, dropping report",
                report.device_id, report.property_name
            );
        }
    }

    async fn shutdown_all(&self) {
        let devices: Vec<(String, DeviceHandle)> = self.devices.write().await.drain().collect();
        for (device_id, handle) in devices {
            let model = handle.model.clone();
            handle.shutdown(&device_id).await;
            self.models.unbind(&model, &device_id);
        }
        info!("All device tasks stopped");
    }
}

#[derive(Clone)]
struct EventSink {
    tx: mpsc::Sender<TwinEvent>,
}

impl EventSink {
    fn emit(&self, event: TwinEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Status channel full, dropping event. Consider increasing status_channel_capacity.");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

/// Outcome of a retried operation
enum Attempt<T> {
    Done(T),
    /// Retry budget spent; carries the last error
    Exhausted(Error),
    /// Not retryable
    Fatal(Error),
    Cancelled,
}

/// Whether the worker loop keeps going
enum Flow {
    Continue,
    Stop,
}

/// Resolves once cancellation was requested (or the handle is gone)
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    let _ = cancel.wait_for(|stop| *stop).await;
}

/// `true` once the link is up, `false` if the transport dropped its signal
async fn link_up(liveness: &mut watch::Receiver<bool>) -> bool {
    liveness.wait_for(|alive| *alive).await.is_ok()
}

/// Pushes twin snapshots on the report cycle
///
/// Runs beside its `PropertyWorker` so retries, backoff and link waits on
/// the collect side never hold up reporting.
struct SnapshotReporter {
    device_id: String,
    property_name: String,
    twin: Arc<Mutex<PropertyTwin>>,
    events: EventSink,
    cancel: watch::Receiver<bool>,
    report_cycle: Duration,
}

impl SnapshotReporter {
    async fn run(self) {
        let mut cancel = self.cancel.clone();
        let mut report =
            tokio::time::interval_at(Instant::now() + self.report_cycle, self.report_cycle);
        report.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancelled(&mut cancel) => break,
                _ = report.tick() => self.push_report().await,
            }
        }
    }

    async fn push_report(&self) {
        let twin = self.twin.lock().await.twin().clone();
        if twin.reported.is_none() {
            return;
        }
        self.events.emit(TwinEvent::ReportPushed {
            device_id: self.device_id.clone(),
            property_name: self.property_name.clone(),
            twin,
        });
    }
}

struct PropertyWorker {
    device_id: String,
    property: ResolvedProperty,
    twin: Arc<Mutex<PropertyTwin>>,
    transport: Arc<dyn Transport>,
    events: EventSink,
    cancel: watch::Receiver<bool>,
    config: ReconcilerConfig,
    retry_times: u32,
    collect_cycle: Duration,
    report_cycle: Duration,
}

impl PropertyWorker {
    fn name(&self) -> &str {
        &self.property.definition.name
    }

    async fn run(self, mut inbox: mpsc::Receiver<Vec<u8>>) {
        debug!(
            "Starting {}/{} (collect every {:?}, report every {:?}, {} retries)",
            self.device_id,
            self.name(),
            self.collect_cycle,
            self.report_cycle,
            self.retry_times
        );

        let reporter = tokio::spawn(
            SnapshotReporter {
                device_id: self.device_id.clone(),
                property_name: self.name().to_string(),
                twin: self.twin.clone(),
                events: self.events.clone(),
                cancel: self.cancel.clone(),
                report_cycle: self.report_cycle,
            }
            .run(),
        );

        let mut cancel = self.cancel.clone();
        let mut collect = tokio::time::interval(self.collect_cycle);
        collect.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let flow = tokio::select! {
                biased;

                _ = cancelled(&mut cancel) => Flow::Stop,

                Some(payload) = inbox.recv() => self.receive(payload).await,

                _ = collect.tick() => self.collect().await,
            };
            if let Flow::Stop = flow {
                break;
            }
        }

        // Snapshots of a stopped property keep flowing until the device goes
        if let Err(e) = reporter.await {
            error!("Report task for {}/{} failed: {}", self.device_id, self.name(), e);
        }
        debug!("Stopped {}/{}", self.device_id, self.name());
    }

    /// One collection cycle, followed by a write if the twin needs one
    async fn collect(&self) -> Flow {
        let transport = &self.transport;
        let device_id = self.device_id.as_str();
        let property = &self.property;

        let attempt = self
            .with_retry("collect", || async move {
                let raw = transport.read(device_id, &property.visitor).await?;
                property.codec.decode(&property.definition, &raw)
            })
            .await;

        match attempt {
            Attempt::Done(value) => {
                self.apply_reported(value).await;
                self.converge().await
            }
            Attempt::Exhausted(e) => {
                self.degrade(format!("collection failed: {}", e)).await;
                Flow::Continue
            }
            Attempt::Fatal(e) => {
                self.degrade(format!("collection failed: {}", e)).await;
                Flow::Stop
            }
            Attempt::Cancelled => Flow::Stop,
        }
    }

    /// An unsolicited report: decoded once, never retried
    async fn receive(&self, payload: Vec<u8>) -> Flow {
        match self.property.codec.decode(&self.property.definition, &payload) {
            Ok(value) => {
                self.apply_reported(value).await;
                self.converge().await
            }
            Err(e) => {
                warn!("Discarding report for {}/{}: {}", self.device_id, self.name(), e);
                Flow::Continue
            }
        }
    }

    async fn apply_reported(&self, value: PropertyValue) {
        let canonical = value.to_string();
        let mut twin = self.twin.lock().await;
        let before = twin.state();
        let after = twin.record_reported(canonical.clone());
        drop(twin);

        self.events.emit(TwinEvent::Reported {
            device_id: self.device_id.clone(),
            property_name: self.name().to_string(),
            value: canonical.clone(),
        });
        if after == TwinState::Synced && before != TwinState::Synced {
            info!("{}/{} synced at {}", self.device_id, self.name(), canonical);
            self.events.emit(TwinEvent::Synced {
                device_id: self.device_id.clone(),
                property_name: self.name().to_string(),
                value: canonical,
            });
        }
    }

    /// Write the desired value if reported differs from it
    async fn converge(&self) -> Flow {
        let Some(desired) = self.twin.lock().await.pending_desired() else {
            return Flow::Continue;
        };

        let definition = &self.property.definition;
        let value = match PropertyValue::parse(definition.semantic_type, &desired) {
            Ok(value) => value,
            Err(e) => {
                self.degrade(format!("desired value is unusable: {}", e)).await;
                return Flow::Continue;
            }
        };

        let transport = &self.transport;
        let device_id = self.device_id.as_str();
        let property = &self.property;
        let value_ref = &value;

        let attempt = self
            .with_retry("write", || async move {
                let raw = property.codec.encode(&property.definition, value_ref)?;
                transport.write(device_id, &property.visitor, &raw).await
            })
            .await;

        match attempt {
            Attempt::Done(()) => {
                self.twin.lock().await.write_succeeded();
                debug!("Wrote {}/{} = {}", self.device_id, self.name(), desired);
                self.events.emit(TwinEvent::WriteIssued {
                    device_id: self.device_id.clone(),
                    property_name: self.name().to_string(),
                    value: desired,
                });
                Flow::Continue
            }
            Attempt::Exhausted(e) => {
                self.degrade(format!("write of '{}' failed: {}", desired, e)).await;
                Flow::Continue
            }
            Attempt::Fatal(e) => {
                self.degrade(format!("write of '{}' failed: {}", desired, e)).await;
                Flow::Stop
            }
            Attempt::Cancelled => Flow::Stop,
        }
    }

    async fn degrade(&self, cause: String) {
        error!("{}/{} degraded: {}", self.device_id, self.name(), cause);
        self.twin.lock().await.degrade(cause.clone());
        self.events.emit(TwinEvent::Degraded {
            device_id: self.device_id.clone(),
            property_name: self.name().to_string(),
            cause,
        });
    }

    /// Run `op` under the failure policy
    ///
    /// Retryable errors are attempted `retry_times + 1` times in total with
    /// exponential backoff. Transport errors wait for the link and are not
    /// counted. Every wait races cancellation.
    async fn with_retry<T, F, Fut>(&self, what: &str, mut op: F) -> Attempt<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut failures = 0u32;
        loop {
            if *self.cancel.borrow() {
                return Attempt::Cancelled;
            }

            let mut cancel = self.cancel.clone();
            let result = tokio::select! {
                biased;
                _ = cancelled(&mut cancel) => return Attempt::Cancelled,
                result = op() => result,
            };

            match result {
                Ok(value) => return Attempt::Done(value),
                Err(e) if e.is_config() => return Attempt::Fatal(e),
                Err(e) if e.is_transport() => {
                    warn!("{} {}/{}: {}", what, self.device_id, self.name(), e);
                    if !self.wait_for_link().await {
                        return Attempt::Cancelled;
                    }
                }
                Err(e) if !e.is_retryable() => return Attempt::Fatal(e),
                Err(e) => {
                    if failures >= self.retry_times {
                        return Attempt::Exhausted(e);
                    }
                    let delay = self.config.backoff(failures);
                    failures += 1;
                    warn!(
                        "{} attempt {} failed for {}/{}: {} (retrying in {:?})",
                        what,
                        failures,
                        self.device_id,
                        self.name(),
                        e,
                        delay
                    );
                    if !self.sleep(delay).await {
                        return Attempt::Cancelled;
                    }
                }
            }
        }
    }

    /// Sleep unless cancelled first; `false` on cancellation
    async fn sleep(&self, delay: Duration) -> bool {
        let mut cancel = self.cancel.clone();
        tokio::select! {
            biased;
            _ = cancelled(&mut cancel) => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// Pause until the transport reports the link is up
    ///
    /// Returns `false` when cancelled or when the transport dropped its
    /// liveness signal.
    async fn wait_for_link(&self) -> bool {
        let mut liveness = self.transport.liveness();
        if *liveness.borrow_and_update() {
            // The link claims to be up; back off so a flapping link cannot spin
            return self.sleep(self.config.backoff(0)).await;
        }

        info!("{}/{} paused until transport reconnects", self.device_id, self.name());
        self.events.emit(TwinEvent::Paused {
            device_id: self.device_id.clone(),
            property_name: self.name().to_string(),
        });

        let mut cancel = self.cancel.clone();
        let up = match self.config.reconnect_timeout() {
            Some(timeout) => {
                let early = tokio::select! {
                    biased;
                    _ = cancelled(&mut cancel) => return false,
                    up = link_up(&mut liveness) => Some(up),
                    _ = tokio::time::sleep(timeout) => None,
                };
                match early {
                    Some(up) => up,
                    None => {
                        self.degrade(format!(
                            "transport unavailable for more than {:?}",
                            timeout
                        ))
                        .await;
                        tokio::select! {
                            biased;
                            _ = cancelled(&mut cancel) => return false,
                            up = link_up(&mut liveness) => up,
                        }
                    }
                }
            }
            None => tokio::select! {
                biased;
                _ = cancelled(&mut cancel) => return false,
                up = link_up(&mut liveness) => up,
            },
        };

        if !up {
            error!("Transport liveness signal closed; stopping {}/{}", self.device_id, self.name());
            return false;
        }

        info!("{}/{} resumed", self.device_id, self.name());
        self.events.emit(TwinEvent::Resumed {
            device_id: self.device_id.clone(),
            property_name: self.name().to_string(),
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_event_sink_drops_when_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let sink = EventSink { tx };
        let event = |n: &str| TwinEvent::Paused {
            device_id: "d".to_string(),
            property_name: n.to_string(),
        };

        sink.emit(event("a"));
        sink.emit(event("b"));

        assert_eq!(rx.recv().await.unwrap().property_name(), "a");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cancelled_resolves_when_sender_dropped() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        tokio::time::timeout(Duration::from_millis(100), cancelled(&mut rx))
            .await
            .unwrap();
    }
}
