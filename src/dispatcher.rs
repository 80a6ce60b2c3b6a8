use crate::types::{NativeTxEvent, NftTxEvent, NATIVE_TX_KAFKA_TOPIC, NFT_TX_KAFKA_TOPIC};
use eyre::{eyre, Result};
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use std::time::Duration;
use tokio::sync::mpsc;

const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Bridges the internal event channels to Kafka. Purely a serializing
/// forwarder; delivery is at-least-once and consumers are idempotent.
pub struct TxDispatcher {
    producer: FutureProducer,
    native_notify: mpsc::Receiver<NativeTxEvent>,
    nft_notify: mpsc::Receiver<NftTxEvent>,
}

impl TxDispatcher {
    pub fn new(
        kafka_address: &str,
        native_notify: mpsc::Receiver<NativeTxEvent>,
        nft_notify: mpsc::Receiver<NftTxEvent>,
    ) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", kafka_address)
            .set("message.timeout.ms", "5000")
            .create()
            .map_err(|e| eyre!("kafka producer init err: {e}"))?;
        Ok(Self {
            producer,
            native_notify,
            nft_notify,
        })
    }

    pub async fn run(mut self) {
        loop {
            tokio::select! {
                Some(event) = self.native_notify.recv() => {
                    self.publish(NATIVE_TX_KAFKA_TOPIC, &event.tx_hash, &event).await;
                }
                Some(event) = self.nft_notify.recv() => {
                    self.publish(NFT_TX_KAFKA_TOPIC, &event.tx_hash, &event).await;
                }
                else => break,
            }
        }
    }

    async fn publish<T: serde::Serialize>(&self, topic: &str, key: &str, event: &T) {
        let payload = match serde_json::to_string(event) {
            Ok(p) => p,
            Err(err) => {
                tracing::error!(topic, error = %err, "event serialize err");
                return;
            }
        };
        match self
            .producer
            .send(FutureRecord::to(topic).key(key).payload(&payload), SEND_TIMEOUT)
            .await
        {
            Ok((partition, offset)) => {
                tracing::info!(topic, key, partition, offset, "event published");
            }
            Err((err, _)) => {
                // dropped after the producer's own retries; the range will be
                // re-driven only if a listener error also fired, so log loudly
                tracing::error!(topic, key, error = %err, "kafka publish err");
            }
        }
    }
}
