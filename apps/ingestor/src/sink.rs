use anyhow::{Result, anyhow};
use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use schema::{IngestionError, SwapRecord};
use std::time::Duration;

/// Downstream notification of ingestion results. Best-effort: callers log
/// failures and carry on.
#[async_trait]
pub trait SwapSink: Send + Sync {
    async fn swap_ingested(&self, swap: &SwapRecord) -> Result<()>;
    async fn record_failed(&self, error: &IngestionError) -> Result<()>;
}

pub struct NoopSink;

#[async_trait]
impl SwapSink for NoopSink {
    async fn swap_ingested(&self, _swap: &SwapRecord) -> Result<()> {
        Ok(())
    }

    async fn record_failed(&self, _error: &IngestionError) -> Result<()> {
        Ok(())
    }
}

pub fn create_producer(broker: &str) -> Result<FutureProducer> {
    let producer: FutureProducer = ClientConfig::new()
        .set("bootstrap.servers", broker)
        .set("acks", "all")
        .set("enable.idempotence", "true")
        .set("linger.ms", "10")
        .set("message.timeout.ms", "60000")
        .create()?;
    Ok(producer)
}

pub struct KafkaSink {
    producer: FutureProducer,
    swaps_topic: String,
    dlq_topic: String,
}

impl KafkaSink {
    pub fn new(producer: FutureProducer, swaps_topic: String, dlq_topic: String) -> Self {
        Self {
            producer,
            swaps_topic,
            dlq_topic,
        }
    }

    async fn send_json(&self, topic: &str, key: &str, json: &str) -> Result<()> {
        let rec = FutureRecord::<str, str>::to(topic).key(key).payload(json);
        match self.producer.send(rec, Duration::from_secs(5)).await {
            Ok(_) => Ok(()),
            Err((e, _)) => Err(anyhow!("kafka delivery error: {e:?}")),
        }
    }
}

#[async_trait]
impl SwapSink for KafkaSink {
    async fn swap_ingested(&self, swap: &SwapRecord) -> Result<()> {
        let payload = serde_json::to_string(swap)?;
        self.send_json(&self.swaps_topic, &swap.tx_hash, &payload).await
    }

    async fn record_failed(&self, error: &IngestionError) -> Result<()> {
        let payload = serde_json::to_string(error)?;
        self.send_json(&self.dlq_topic, &error.tx_hash, &payload).await
    }
}
