use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt::{Debug, Display};
use std::hash::Hash;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::infrastructure::codec::Encoding;
use crate::infrastructure::error::DecodeError;
use crate::infrastructure::message::InboundMessage;
use crate::infrastructure::metrics::PipelineMetrics;

/// Per-stream rules for turning inbound messages into storage deltas.
pub trait DeltaMapping: Send + Sync + 'static {
    type Event: DeserializeOwned + Send;
    type Key: Eq + Hash + Clone + Debug + Display + Send + Sync + 'static;
    type Delta: Debug + Send + Sync + 'static;

    fn name(&self) -> &str;

    fn encoding(&self) -> Encoding {
        Encoding::Json
    }

    fn decode(&self, message: &InboundMessage) -> Result<Self::Event, DecodeError> {
        self.encoding().decode(&message.payload)
    }

    /// Events rejected here are acknowledged without any storage effect.
    fn accepts(&self, _event: &Self::Event) -> bool {
        true
    }

    fn key(&self, event: &Self::Event) -> Self::Key;

    /// Merges `event` into the delta accumulated so far for its key. Events
    /// arrive in batch order, so "set to" fields should take the newer value.
    fn fold(&self, current: Option<Self::Delta>, event: Self::Event) -> Self::Delta;
}

/// One storage mutation and the messages it settles.
#[derive(Debug)]
pub struct DeltaGroup<D> {
    pub delta: D,
    pub messages: Vec<InboundMessage>,
}

#[derive(Debug)]
pub struct MappedBatch<K, D> {
    pub deltas: HashMap<K, DeltaGroup<D>>,
    /// Messages needing no write: undecodable or filtered out.
    pub resolved: Vec<InboundMessage>,
}

impl<K, D> MappedBatch<K, D> {
    pub fn message_count(&self) -> usize {
        self.resolved.len()
            + self
                .deltas
                .values()
                .map(|group| group.messages.len())
                .sum::<usize>()
    }
}

pub struct BatchMapper<M> {
    mapping: Arc<M>,
    metrics: Arc<PipelineMetrics>,
}

impl<M: DeltaMapping> BatchMapper<M> {
    pub fn new(mapping: Arc<M>, metrics: Arc<PipelineMetrics>) -> Self {
        Self { mapping, metrics }
    }

    pub fn mapping(&self) -> &Arc<M> {
        &self.mapping
    }

    pub fn map(&self, batch: Vec<InboundMessage>) -> MappedBatch<M::Key, M::Delta> {
        let mut deltas: HashMap<M::Key, DeltaGroup<M::Delta>> = HashMap::new();
        let mut resolved = Vec::new();

        for message in batch {
            let event = match self.mapping.decode(&message) {
                Ok(event) => event,
                Err(e) => {
                    PipelineMetrics::incr(&self.metrics.decode_failures, 1);
                    warn!(
                        stream = self.mapping.name(),
                        topic = %message.topic,
                        partition = message.partition,
                        offset = message.offset,
                        "Failed to decode message, acknowledging without processing: {}",
                        e
                    );
                    resolved.push(message);
                    continue;
                }
            };

            if !self.mapping.accepts(&event) {
                PipelineMetrics::incr(&self.metrics.messages_filtered, 1);
                resolved.push(message);
                continue;
            }

            let key = self.mapping.key(&event);
            let (current, mut messages) = match deltas.remove(&key) {
                Some(group) => (Some(group.delta), group.messages),
                None => (None, Vec::new()),
            };
            messages.push(message);
            let delta = self.mapping.fold(current, event);
            deltas.insert(key, DeltaGroup { delta, messages });
        }

        debug!(
            stream = self.mapping.name(),
            deltas = deltas.len(),
            resolved = resolved.len(),
            "Batch mapped"
        );

        MappedBatch { deltas, resolved }
    }
}
