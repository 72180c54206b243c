pub mod adapters;
pub mod consumer;
pub mod producer;
pub mod queue;
mod types;

pub use consumer::Consumer;
pub use mqbridge_config::{BackendKind, QueueConfig};
pub use mqbridge_models::core::{Envelope, Message, MessageStatus};
pub use mqbridge_models::errors::QueueError;
pub use producer::Producer;
pub use queue::{DeliveryCallback, Queue};
pub use types::RawDelivery;

use async_trait::async_trait;

/// Adapter between the queue facade and one concrete backing store.
///
/// Drivers are built already bound to a single physical queue.
#[async_trait]
pub trait Driver: Send + Sync + 'static {
    fn kind(&self) -> BackendKind;

    /// Declare or verify the physical queue. Safe to call more than once.
    async fn init(&self) -> Result<(), QueueError>;

    /// Hand an encoded envelope to the backend, returning its delivery tag if it assigns one.
    async fn enqueue(&self, envelope: &Envelope, body: Vec<u8>)
        -> Result<Option<String>, QueueError>;

    /// Try to take one message without waiting longer than the driver's poll period.
    ///
    /// `acknowledge` is the consumer's mode; drivers that can settle on receipt
    /// report it through [`RawDelivery::settled`].
    async fn dequeue(&self, acknowledge: bool) -> Result<Option<RawDelivery>, QueueError>;

    /// Mark a delivery as complete.
    async fn ack(&self, delivery_tag: &str) -> Result<(), QueueError>;

    async fn close(&self) -> Result<(), QueueError>;
}
