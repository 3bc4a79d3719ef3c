//! Binary entry point: wires the broker-agnostic `dispatch-core` crate to a
//! real NATS JetStream stream, consumer, and KV bucket.

use std::path::PathBuf;
use std::sync::Arc;

use async_nats::jetstream::{self, consumer::pull, kv};
use async_trait::async_trait;
use clap::Parser;
use futures::StreamExt;
use tracing::{error, info, warn};

use dispatch_core::kv::KvEvent;
use dispatch_core::{
    BatchConsumer, Bus, ContextAssembler, ContextKv, DispatchConfig, DispatchScheduler,
    ModelRegistry, PhaseOrchestrator, Resolution, ResultPublisher,
};

#[derive(Parser, Debug)]
#[command(about = "Task dispatch and execution core, NATS JetStream edition")]
struct Args {
    /// NATS server URL.
    #[arg(long, env = "NATS_URL", default_value = "nats://127.0.0.1:4222")]
    nats_url: String,

    /// Repository root containing `.semspec/changes/<slug>/tasks.json`.
    #[arg(long, env = "DISPATCH_REPO_ROOT", default_value = ".")]
    repo_root: PathBuf,
}

struct NatsBus {
    client: async_nats::Client,
}

#[async_trait]
impl Bus for NatsBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), String> {
        self.client
            .publish(subject.to_string(), payload.into())
            .await
            .map_err(|e| e.to_string())?;
        self.client.flush().await.map_err(|e| e.to_string())
    }
}

struct NatsContextKv {
    store: kv::Store,
}

#[async_trait]
impl ContextKv for NatsContextKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, String> {
        self.store
            .get(key)
            .await
            .map(|opt| opt.map(|bytes| bytes.to_vec()))
            .map_err(|e| e.to_string())
    }

    async fn watch(&self, key: &str) -> Result<tokio::sync::mpsc::Receiver<KvEvent>, String> {
        let mut watcher = self.store.watch(key).await.map_err(|e| e.to_string())?;
        let (tx, rx) = tokio::sync::mpsc::channel(8);
        let _ = tx.send(KvEvent::Ready).await;
        tokio::spawn(async move {
            while let Some(entry) = watcher.next().await {
                let event = match entry {
                    Ok(entry) if entry.operation == kv::Operation::Delete => KvEvent::Deleted,
                    Ok(entry) => KvEvent::Value(entry.value.to_vec()),
                    Err(_) => break,
                };
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), String> {
        self.store
            .put(key, value.into())
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}

struct NatsResultPublisher {
    bus: Arc<NatsBus>,
}

#[async_trait]
impl ResultPublisher for NatsResultPublisher {
    async fn publish_result(
        &self,
        result: &dispatch_core::BatchResult,
    ) -> Result<(), String> {
        let subject = format!("workflow.result.task-dispatcher.{}", result.slug);
        let bytes = serde_json::to_vec(result).map_err(|e| e.to_string())?;
        self.bus.publish(&subject, bytes).await
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let config = DispatchConfig::from_env();

    info!(nats_url = %args.nats_url, "connecting to NATS");
    let client = async_nats::connect(&args.nats_url).await?;
    let js = jetstream::new(client.clone());

    let bus = Arc::new(NatsBus { client: client.clone() });

    let kv_store = match js.get_key_value(&config.context_response_bucket).await {
        Ok(store) => store,
        Err(_) => {
            js.create_key_value(kv::Config {
                bucket: config.context_response_bucket.clone(),
                ..Default::default()
            })
            .await?
        }
    };
    let kv = Arc::new(NatsContextKv { store: kv_store });

    let stream = js
        .get_or_create_stream(jetstream::stream::Config {
            name: config.stream_name.clone(),
            subjects: vec!["workflow.trigger.>".to_string()],
            ..Default::default()
        })
        .await?;

    let consumer = stream
        .get_or_create_consumer(
            &config.consumer_name,
            pull::Config {
                durable_name: Some(config.consumer_name.clone()),
                filter_subject: config.trigger_subject.clone(),
                ack_wait: config.ack_wait(),
                ..Default::default()
            },
        )
        .await?;

    let registry = Arc::new(ModelRegistry::new("default-model"));
    let assembler = Arc::new(ContextAssembler::new(
        bus.clone(),
        kv.clone(),
        registry,
        config.clone(),
    ));
    let scheduler = Arc::new(DispatchScheduler::new(bus.clone(), config.clone()));
    let orchestrator = Arc::new(PhaseOrchestrator::new(scheduler, assembler));
    let result_publisher = Arc::new(NatsResultPublisher { bus: bus.clone() });
    let batch_consumer = Arc::new(BatchConsumer::new(
        config.clone(),
        args.repo_root.clone(),
        orchestrator,
        result_publisher,
    ));

    if !batch_consumer.start() {
        anyhow::bail!("consumer failed to start from an unexpected initial state");
    }
    info!(
        stream = %config.stream_name,
        consumer = %config.consumer_name,
        repo_root = ?args.repo_root,
        "batch consumer running"
    );

    let mut messages = consumer.messages().await?;
    loop {
        tokio::select! {
            next = messages.next() => {
                let Some(message) = next else {
                    warn!("message stream ended, shutting down");
                    break;
                };
                let message = match message {
                    Ok(m) => m,
                    Err(e) => {
                        error!(error = %e, "failed to pull next message");
                        continue;
                    }
                };

                let resolution = batch_consumer.handle_message(&message.payload).await;
                let ack_result = match resolution {
                    Resolution::Ack => message.ack().await,
                    Resolution::Nak => message.ack_with(jetstream::AckKind::Nak(None)).await,
                    Resolution::Term => message.ack_with(jetstream::AckKind::Term).await,
                };
                if let Err(e) = ack_result {
                    error!(error = %e, ?resolution, "failed to resolve message");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                break;
            }
        }
    }

    batch_consumer.stop();
    Ok(())
}
