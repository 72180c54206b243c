use std::sync::Arc;

use mqbridge_models::{core::Message, errors::QueueError};
use serde_json::Value;

use crate::queue::{DeliveryCallback, Queue};

/// A queue bound to an optional default delivery callback.
#[derive(Clone)]
pub struct Producer {
    queue: Arc<Queue>,
    default_callback: Option<DeliveryCallback>,
}

impl Producer {
    pub fn new(queue: Arc<Queue>) -> Self {
        Self {
            queue,
            default_callback: None,
        }
    }

    pub fn with_callback(mut self, callback: DeliveryCallback) -> Self {
        self.default_callback = Some(callback);
        self
    }

    pub fn queue(&self) -> &Arc<Queue> {
        &self.queue
    }

    /// Produce through the queue; `callback` overrides the default one for this call.
    pub async fn produce(
        &self,
        payload: Value,
        user_id: Option<&str>,
        callback: Option<DeliveryCallback>,
    ) -> Result<Message, QueueError> {
        let callback = callback.as_ref().or(self.default_callback.as_ref());
        self.queue.produce(payload, user_id, callback).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::tests::scripted_queue;
    use parking_lot::Mutex;
    use serde_json::json;

    fn recorder(label: &'static str, log: &Arc<Mutex<Vec<&'static str>>>) -> DeliveryCallback {
        let log = Arc::clone(log);
        Arc::new(move |_: &Queue, _: Option<&QueueError>, _: Option<&Message>| {
            log.lock().push(label)
        })
    }

    #[tokio::test]
    async fn default_callback_fires_when_no_override() {
        let (queue, _) = scripted_queue("t");
        let log = Arc::new(Mutex::new(Vec::new()));
        let producer = Producer::new(Arc::new(queue)).with_callback(recorder("default", &log));

        producer.produce(json!("a"), None, None).await.unwrap();
        producer
            .produce(json!("b"), None, Some(recorder("override", &log)))
            .await
            .unwrap();

        assert_eq!(*log.lock(), vec!["default", "override"]);
    }

    #[tokio::test]
    async fn clones_share_the_queue() {
        let (queue, driver) = scripted_queue("t");
        let producer = Producer::new(Arc::new(queue));
        let other = producer.clone();

        let (a, b) = tokio::join!(
            producer.produce(json!(1), Some("u1"), None),
            other.produce(json!(2), Some("u2"), None)
        );
        assert_ne!(a.unwrap().message_id, b.unwrap().message_id);
        assert_eq!(driver.state.lock().queue.len(), 2);
        assert!(Arc::ptr_eq(producer.queue(), other.queue()));
    }

    #[tokio::test]
    async fn callback_receives_the_producing_queue() {
        let (queue, _) = scripted_queue("t");
        let producer = Producer::new(Arc::new(queue));
        let expected = Arc::as_ptr(producer.queue()) as usize;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback: DeliveryCallback = Arc::new(
            move |queue: &Queue, _: Option<&QueueError>, message: Option<&Message>| {
                let address = queue as *const Queue as usize;
                sink.lock().push((address, queue.topic().to_string(), message.is_some()));
            },
        );

        producer.produce(json!("a"), None, Some(callback)).await.unwrap();

        assert_eq!(*seen.lock(), vec![(expected, "t".to_string(), true)]);
    }
}
