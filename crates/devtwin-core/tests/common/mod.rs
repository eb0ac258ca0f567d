//! Test doubles and common utilities for contract tests
//!
//! The doubles are deliberately dumb: a transport that stores bytes per
//! (device, property) and counts every call, and an object source backed
//! by a vector.

#![allow(dead_code)]

use devtwin_core::config::ReconcilerConfig;
use devtwin_core::device::{
    OpcuaProtocol, OpcuaVisitor, PropertyVisitor, ProtocolConfig, VisitorConfig,
};
use devtwin_core::error::{Error, Result};
use devtwin_core::model::{AccessMode, DeviceModel, ModelRegistry, PropertyDefinition, SemanticType};
use devtwin_core::registry::PluginRegistry;
use devtwin_core::traits::{InboundReport, InboundStream, LiveObject, ObjectSource, Transport};
use devtwin_core::twin::{TwinEvent, TwinReconciler};
use devtwin_core::{Device, ObjectSyncTracker};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// Transport double: a register file per (device, property)
pub struct SimulatedTransport {
    values: Mutex<HashMap<(String, String), Vec<u8>>>,
    read_count: AtomicUsize,
    write_count: AtomicUsize,
    send_count: AtomicUsize,
    fail_writes: AtomicBool,
    fail_sends: AtomicBool,
    unknown_devices: AtomicBool,
    read_delay_ms: AtomicU64,
    liveness: watch::Sender<bool>,
    reports_tx: mpsc::UnboundedSender<InboundReport>,
    reports_rx: Mutex<Option<mpsc::UnboundedReceiver<InboundReport>>>,
    sent: Mutex<Vec<(String, Vec<u8>)>>,
}

impl SimulatedTransport {
    pub fn new() -> Self {
        let (liveness, _) = watch::channel(true);
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();
        Self {
            values: Mutex::new(HashMap::new()),
            read_count: AtomicUsize::new(0),
            write_count: AtomicUsize::new(0),
            send_count: AtomicUsize::new(0),
            fail_writes: AtomicBool::new(false),
            fail_sends: AtomicBool::new(false),
            unknown_devices: AtomicBool::new(false),
            read_delay_ms: AtomicU64::new(0),
            liveness,
            reports_tx,
            reports_rx: Mutex::new(Some(reports_rx)),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Set the bytes a device returns for a property
    pub fn set_value(&self, device_id: &str, property: &str, raw: &[u8]) {
        self.values
            .lock()
            .unwrap()
            .insert((device_id.to_string(), property.to_string()), raw.to_vec());
    }

    pub fn value(&self, device_id: &str, property: &str) -> Option<Vec<u8>> {
        self.values
            .lock()
            .unwrap()
            .get(&(device_id.to_string(), property.to_string()))
            .cloned()
    }

    pub fn read_count(&self) -> usize {
        self.read_count.load(Ordering::SeqCst)
    }

    pub fn write_count(&self) -> usize {
        self.write_count.load(Ordering::SeqCst)
    }

    pub fn send_count(&self) -> usize {
        self.send_count.load(Ordering::SeqCst)
    }

    /// Make the device reject every write
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make every send fail with a transport error
    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Answer every read as if the device was never provisioned
    pub fn unknown_devices(&self, unknown: bool) {
        self.unknown_devices.store(unknown, Ordering::SeqCst);
    }

    pub fn set_read_delay(&self, delay: Duration) {
        self.read_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Flip the link state
    pub fn set_link(&self, up: bool) {
        self.liveness.send_replace(up);
    }

    fn link_up(&self) -> bool {
        *self.liveness.borrow()
    }

    /// Push an unsolicited device report
    pub fn push_report(&self, device_id: &str, property: &str, payload: &[u8]) {
        let _ = self
            .reports_tx
            .send(InboundReport::new(device_id, property, payload.to_vec()));
    }

    /// Payloads delivered through `send`, in order
    pub fn sent(&self) -> Vec<(String, Vec<u8>)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Transport for SimulatedTransport {
    async fn send(&self, target_id: &str, payload: &[u8]) -> Result<()> {
        self.send_count.fetch_add(1, Ordering::SeqCst);
        if !self.link_up() || self.fail_sends.load(Ordering::SeqCst) {
            return Err(Error::transport(format!("cannot reach {}", target_id)));
        }
        self.sent
            .lock()
            .unwrap()
            .push((target_id.to_string(), payload.to_vec()));
        Ok(())
    }

    async fn read(&self, device_id: &str, visitor: &PropertyVisitor) -> Result<Vec<u8>> {
        self.read_count.fetch_add(1, Ordering::SeqCst);
        let delay = self.read_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if !self.link_up() {
            return Err(Error::transport("link down"));
        }
        if self.unknown_devices.load(Ordering::SeqCst) {
            return Err(Error::not_found(format!("device {}", device_id)));
        }
        self.value(device_id, &visitor.property_name)
            .ok_or_else(|| Error::decode(format!("{} has no value for {}", device_id, visitor.property_name)))
    }

    async fn write(&self, device_id: &str, visitor: &PropertyVisitor, payload: &[u8]) -> Result<()> {
        self.write_count.fetch_add(1, Ordering::SeqCst);
        if !self.link_up() {
            return Err(Error::transport("link down"));
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::encode("device rejected write"));
        }
        self.set_value(device_id, &visitor.property_name, payload);
        Ok(())
    }

    fn reports(&self) -> InboundStream {
        match self.reports_rx.lock().unwrap().take() {
            Some(rx) => Box::pin(tokio_stream::wrappers::UnboundedReceiverStream::new(rx)),
            None => Box::pin(tokio_stream::empty()),
        }
    }

    fn liveness(&self) -> watch::Receiver<bool> {
        self.liveness.subscribe()
    }
}

/// Object source backed by a vector
#[derive(Default)]
pub struct StaticObjectSource {
    objects: Mutex<Vec<LiveObject>>,
}

impl StaticObjectSource {
    pub fn new(objects: Vec<LiveObject>) -> Self {
        Self {
            objects: Mutex::new(objects),
        }
    }

    pub fn remove(&self, name: &str) {
        self.objects
            .lock()
            .unwrap()
            .retain(|object| object.key.object_name != name);
    }
}

#[async_trait::async_trait]
impl ObjectSource for StaticObjectSource {
    async fn list_for_target(&self, target: &str) -> Result<Vec<LiveObject>> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .iter()
            .filter(|object| object.key.target == target)
            .cloned()
            .collect())
    }
}

/// Model with one writable and one read-only property
pub fn plc_model() -> DeviceModel {
    DeviceModel::new("plc")
        .with_property(
            PropertyDefinition::new("setpoint", SemanticType::Int)
                .with_range(Some(0.0), Some(1000.0)),
        )
        .with_property(
            PropertyDefinition::new("temperature", SemanticType::Double)
                .with_access_mode(AccessMode::ReadOnly)
                .with_unit("celsius"),
        )
}

pub fn opcua_visitor(property: &str, node: &str) -> PropertyVisitor {
    PropertyVisitor::new(
        property,
        VisitorConfig::Opcua(OpcuaVisitor {
            node_id: Some(node.to_string()),
            browse_name: None,
        }),
    )
}

/// OPC-UA device on the `plc` model with short cycles and two retries
pub fn plc_device(id: &str, collect: Duration) -> Device {
    Device::new(
        id,
        "plc",
        ProtocolConfig::Opcua(OpcuaProtocol {
            url: Some("opc.tcp://10.0.0.7:4840".to_string()),
            ..Default::default()
        }),
    )
    .with_visitor(
        opcua_visitor("setpoint", "ns=2;s=Setpoint")
            .with_collect_cycle(collect)
            .with_report_cycle(Duration::from_millis(100))
            .with_retry_times(2),
    )
    .with_visitor(
        opcua_visitor("temperature", "ns=2;s=Temperature")
            .with_collect_cycle(collect)
            .with_report_cycle(Duration::from_millis(100))
            .with_retry_times(2),
    )
}

pub fn fast_config() -> ReconcilerConfig {
    ReconcilerConfig {
        retry_backoff_ms: 5,
        max_backoff_ms: 20,
        default_collect_cycle_ms: 20,
        default_report_cycle_ms: 100,
        ..Default::default()
    }
}

pub struct Harness {
    pub reconciler: Arc<TwinReconciler>,
    pub events: mpsc::Receiver<TwinEvent>,
    pub transport: Arc<SimulatedTransport>,
    pub models: Arc<ModelRegistry>,
}

/// Reconciler over a fresh transport with the `plc` model registered
pub fn harness(config: ReconcilerConfig) -> Harness {
    let models = Arc::new(ModelRegistry::new());
    models.register(plc_model()).unwrap();
    let transport = Arc::new(SimulatedTransport::new());
    let (reconciler, events) = TwinReconciler::new(
        models.clone(),
        Arc::new(PluginRegistry::new()),
        transport.clone(),
        config,
    )
    .unwrap();
    Harness {
        reconciler: Arc::new(reconciler),
        events,
        transport,
        models,
    }
}

/// Receive events until one matches, returning everything seen (match last)
pub async fn events_until<F>(
    events: &mut mpsc::Receiver<TwinEvent>,
    timeout: Duration,
    mut matches: F,
) -> Option<Vec<TwinEvent>>
where
    F: FnMut(&TwinEvent) -> bool,
{
    let mut seen = Vec::new();
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let event = tokio::time::timeout_at(deadline, events.recv()).await.ok()??;
        let done = matches(&event);
        seen.push(event);
        if done {
            return Some(seen);
        }
    }
}

pub fn tracker() -> ObjectSyncTracker {
    ObjectSyncTracker::new(Box::new(devtwin_core::MemorySyncStore::new()))
}
