//! Minimal embedding example for devtwin-core
//!
//! This example drives one device through a custom transport and a custom
//! protocol codec, then brings an edge target up to date with the object
//! sync tracker. The reconciler lifecycle is fully managed by the
//! application.

use devtwin_core::device::{CustomizedProtocol, CustomizedVisitor};
use devtwin_core::model::AccessMode;
use devtwin_core::sync::{SyncAck, SyncMessage};
use devtwin_core::traits::{InboundStream, LiveObject, ObjectKey};
use devtwin_core::{
    CodecFactory, Device, DeviceModel, Error, ModelRegistry, ObjectSource, ObjectSyncTracker,
    PluginRegistry, PropertyDefinition, PropertyValue, PropertyVisitor, ProtocolCodec,
    ProtocolConfig, ReconcilerConfig, Result, SemanticType, SyncStoreConfig, Transport,
    TwinReconciler, VisitorConfig,
};
use std::collections::HashMap;
use std::env;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Gateway that speaks plain ASCII numbers, scaled by `configData.scale`
struct AsciiCodec {
    scale: f64,
}

impl ProtocolCodec for AsciiCodec {
    fn protocol(&self) -> &str {
        "ascii-gateway"
    }

    fn decode(&self, property: &PropertyDefinition, raw: &[u8]) -> Result<PropertyValue> {
        let text = std::str::from_utf8(raw).map_err(anyhow::Error::from)?;
        let number: f64 = text
            .trim()
            .parse()
            .map_err(|e| Error::codec("ascii-gateway", format!("'{}': {}", text, e)))?;
        PropertyValue::from_number(property.semantic_type, number / self.scale)
    }

    fn encode(&self, _property: &PropertyDefinition, value: &PropertyValue) -> Result<Vec<u8>> {
        let number = value
            .as_f64()
            .ok_or_else(|| Error::encode(format!("'{}' is not numeric", value)))?;
        Ok(format!("{}", (number * self.scale).round()).into_bytes())
    }
}

struct AsciiCodecFactory;

impl CodecFactory for AsciiCodecFactory {
    fn create(
        &self,
        protocol: &CustomizedProtocol,
        _visitor: &CustomizedVisitor,
    ) -> Result<Box<dyn ProtocolCodec>> {
        let scale = protocol
            .config_data
            .get("scale")
            .and_then(|v| v.as_f64())
            .unwrap_or(1.0);
        if scale == 0.0 {
            return Err(Error::config("scale cannot be zero"));
        }
        Ok(Box::new(AsciiCodec { scale }))
    }
}

/// Custom transport: an in-process register file
struct EmbeddedTransport {
    registers: Mutex<HashMap<String, Vec<u8>>>,
    liveness: watch::Sender<bool>,
}

impl EmbeddedTransport {
    fn new() -> Self {
        let (liveness, _) = watch::channel(true);
        Self {
            registers: Mutex::new(HashMap::new()),
            liveness,
        }
    }

    fn set(&self, property: &str, raw: &[u8]) {
        self.registers
            .lock()
            .unwrap()
            .insert(property.to_string(), raw.to_vec());
    }
}

#[async_trait::async_trait]
impl Transport for EmbeddedTransport {
    async fn send(&self, target_id: &str, payload: &[u8]) -> Result<()> {
        let message = SyncMessage::from_bytes(payload)?;
        println!("[Embedded] -> {}: {:?}", target_id, message);
        Ok(())
    }

    async fn read(&self, _device_id: &str, visitor: &PropertyVisitor) -> Result<Vec<u8>> {
        self.registers
            .lock()
            .unwrap()
            .get(&visitor.property_name)
            .cloned()
            .ok_or_else(|| Error::decode(format!("nothing at {}", visitor.property_name)))
    }

    async fn write(&self, _device_id: &str, visitor: &PropertyVisitor, payload: &[u8]) -> Result<()> {
        println!(
            "[Embedded] write {} = {}",
            visitor.property_name,
            String::from_utf8_lossy(payload)
        );
        self.set(&visitor.property_name, payload);
        Ok(())
    }

    fn reports(&self) -> InboundStream {
        Box::pin(tokio_stream::empty())
    }

    fn liveness(&self) -> watch::Receiver<bool> {
        self.liveness.subscribe()
    }
}

/// Custom object source: two config maps for one edge
struct EmbeddedObjects;

#[async_trait::async_trait]
impl ObjectSource for EmbeddedObjects {
    async fn list_for_target(&self, target: &str) -> Result<Vec<LiveObject>> {
        Ok(["pump-settings", "alarm-thresholds"]
            .iter()
            .enumerate()
            .map(|(i, name)| {
                LiveObject::new(
                    ObjectKey::namespaced(target, "plant", "configmap", *name),
                    10 + i as u64,
                    serde_json::json!({ "name": name }),
                )
            })
            .collect())
    }
}

fn init_tracing() {
    let level = match env::var("DEVTWIN_LOG_LEVEL")
        .unwrap_or_else(|_| "info".to_string())
        .to_lowercase()
        .as_str()
    {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    println!("=== Embedded devtwin-core Example ===\n");

    println!("1. Registering model and codec...");
    let models = Arc::new(ModelRegistry::new());
    models.register(
        DeviceModel::new("pump")
            .with_property(
                PropertyDefinition::new("speed", SemanticType::Double)
                    .with_range(Some(0.0), Some(3000.0))
                    .with_unit("rpm"),
            )
            .with_property(
                PropertyDefinition::new("pressure", SemanticType::Double)
                    .with_access_mode(AccessMode::ReadOnly)
                    .with_unit("bar"),
            ),
    )?;

    let plugins = Arc::new(PluginRegistry::with_builtin_stores());
    plugins.register_codec("ascii-gateway", Arc::new(AsciiCodecFactory));

    let transport = Arc::new(EmbeddedTransport::new());
    transport.set("speed", b"12000");
    transport.set("pressure", b"415");

    println!("2. Creating reconciler...");
    let config = ReconcilerConfig {
        default_collect_cycle_ms: 100,
        default_report_cycle_ms: 500,
        ..Default::default()
    };
    let (reconciler, mut events) =
        TwinReconciler::new(models.clone(), plugins.clone(), transport.clone(), config)?;
    let reconciler = Arc::new(reconciler);

    let event_listener = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            println!("[Event] {:?}", event);
        }
    });

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let runner = {
        let reconciler = reconciler.clone();
        tokio::spawn(async move { reconciler.run_with_shutdown(Some(shutdown_rx)).await })
    };

    println!("3. Admitting pump-1...");
    let visitor = |property: &str| {
        PropertyVisitor::new(property, VisitorConfig::Customized(CustomizedVisitor::default()))
    };
    let device = Device::new(
        "pump-1",
        "pump",
        ProtocolConfig::Customized(CustomizedProtocol {
            protocol_name: "ascii-gateway".to_string(),
            config_data: serde_json::json!({ "scale": 10.0 }),
        }),
    )
    .with_visitor(visitor("speed"))
    .with_visitor(visitor("pressure"));
    reconciler.admit(device).await?;

    tokio::time::sleep(Duration::from_millis(150)).await;

    println!("\n4. Setting desired speed to 1450 rpm...");
    reconciler.set_desired("pump-1", "speed", "1450").await?;
    if let Err(e) = reconciler.set_desired("pump-1", "pressure", "5").await {
        println!("   pressure is read-only: {}", e);
    }

    tokio::time::sleep(Duration::from_millis(400)).await;
    if let Some(twin) = reconciler.twin("pump-1", "speed").await {
        println!("   speed twin: {}", serde_json::to_string(&twin)?);
    }

    println!("\n5. Reconciling edge-a...");
    let store = plugins.create_sync_store(&SyncStoreConfig::Memory).await?;
    let tracker = ObjectSyncTracker::new(store);
    let report = tracker
        .reconcile_edge("edge-a", &EmbeddedObjects, transport.as_ref())
        .await?;
    println!("   {:?}", report);

    // The edge acknowledges what it applied
    for object in EmbeddedObjects.list_for_target("edge-a").await? {
        tracker
            .acknowledge(&SyncAck::Applied {
                key: object.key,
                resource_version: object.resource_version,
            })
            .await?;
    }
    let report = tracker
        .reconcile_edge("edge-a", &EmbeddedObjects, transport.as_ref())
        .await?;
    println!("   after acks: {:?}", report);

    println!("\n6. Shutting down...");
    let _ = shutdown_tx.send(());
    runner.await??;
    drop(reconciler);
    let _ = tokio::time::timeout(Duration::from_millis(100), event_listener).await;

    println!("\n=== Embedding Successful ===");
    Ok(())
}
