use std::{sync::Arc, time::Duration};

use futures_util::{stream, Stream, StreamExt};
use log::{debug, error, info, warn};
use mqbridge_models::{core::Message, errors::QueueError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::queue::Queue;

pub type MessageHandler = Arc<dyn Fn(Message) + Send + Sync>;

/// Fan-in over one or more queues, possibly on different backends.
///
/// Each pass drains every queue in the order given before moving on; the
/// consumer sleeps for `poll_interval` only after a pass that found nothing.
pub struct Consumer {
    queues: Vec<Queue>,
    acknowledge: bool,
    poll_interval: Duration,
    cancel: CancellationToken,
    handler: Option<MessageHandler>,
}

struct Cursor {
    index: usize,
    produced: bool,
}

impl Consumer {
    pub fn new(
        queues: Vec<Queue>,
        acknowledge: bool,
        poll_interval: Duration,
    ) -> Result<Self, QueueError> {
        if queues.is_empty() {
            return Err(QueueError::invalid("consumer needs at least one queue"));
        }
        Ok(Self {
            queues,
            acknowledge,
            poll_interval,
            cancel: CancellationToken::new(),
            handler: None,
        })
    }

    pub fn with_handler(mut self, handler: impl Fn(Message) + Send + Sync + 'static) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn queues(&self) -> &[Queue] {
        &self.queues
    }

    pub fn acknowledge(&self) -> bool {
        self.acknowledge
    }

    /// Endless round-robin stream; ends only when cancelled.
    pub fn messages(&self) -> impl Stream<Item = Message> + Send + '_ {
        let cursor = Cursor {
            index: 0,
            produced: false,
        };
        stream::unfold(cursor, move |mut cursor| async move {
            loop {
                if self.cancel.is_cancelled() {
                    return None;
                }

                let queue = &self.queues[cursor.index];
                match queue.consume_one(self.acknowledge).await {
                    Ok(Some(message)) => {
                        cursor.produced = true;
                        return Some((message, cursor));
                    }
                    Ok(None) => {}
                    Err(err) => error!("Consume from {} failed: {}", queue.physical_name(), err),
                }

                cursor.index += 1;
                if cursor.index == self.queues.len() {
                    cursor.index = 0;
                    if !cursor.produced && !self.idle().await {
                        return None;
                    }
                    cursor.produced = false;
                }
            }
        })
    }

    /// Run `iterations` passes (forever when `None`), handing each message to
    /// the handler. Returns how many messages were processed.
    pub async fn run(&self, iterations: Option<usize>) -> usize {
        let mut processed = 0;
        let mut passes = 0;

        while iterations.map_or(true, |limit| passes < limit) {
            if self.cancel.is_cancelled() {
                break;
            }
            let found = self.pass().await;
            processed += found;
            passes += 1;

            let more = iterations.map_or(true, |limit| passes < limit);
            if found == 0 && more && !self.idle().await {
                break;
            }
        }

        debug!("Consumer stopped after {} pass(es), {} message(s)", passes, processed);
        processed
    }

    /// Run the loop on a background task, closing the queues when it ends.
    pub fn spawn(self, iterations: Option<usize>) -> JoinHandle<usize> {
        tokio::spawn(async move {
            let processed = self.run(iterations).await;
            self.close().await;
            processed
        })
    }

    pub async fn close(self) {
        for queue in self.queues {
            let name = queue.physical_name().to_string();
            if let Err(err) = queue.close().await {
                warn!("Error closing queue {}: {}", name, err);
            }
        }
    }

    async fn pass(&self) -> usize {
        let mut found = 0;
        for queue in &self.queues {
            if self.cancel.is_cancelled() {
                break;
            }
            let messages = queue.consume(self.acknowledge);
            tokio::pin!(messages);
            while let Some(message) = messages.next().await {
                found += 1;
                self.dispatch(queue, message);
            }
        }
        found
    }

    fn dispatch(&self, queue: &Queue, message: Message) {
        match &self.handler {
            Some(handler) => handler(message),
            None => info!(
                "{}: message {} ({:?})",
                queue.physical_name(),
                message.message_id,
                message.status
            ),
        }
    }

    /// Sleep for the poll interval; `false` when cancelled meanwhile.
    async fn idle(&self) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(self.poll_interval) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::tests::scripted_queue;
    use mqbridge_models::core::MessageStatus;
    use parking_lot::Mutex;
    use serde_json::json;

    #[test]
    fn rejects_empty_queue_set() {
        assert!(matches!(
            Consumer::new(Vec::new(), true, Duration::from_millis(10)),
            Err(QueueError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn drains_each_queue_before_moving_on() {
        let (q1, _) = scripted_queue("q1");
        let (q2, _) = scripted_queue("q2");
        for payload in ["a1", "a2"] {
            q1.produce(json!(payload), None, None).await.unwrap();
        }
        q2.produce(json!("b1"), None, None).await.unwrap();

        let consumer = Consumer::new(vec![q1, q2], true, Duration::from_secs(5)).unwrap();
        let payloads: Vec<_> = consumer
            .messages()
            .take(3)
            .map(|message| message.payload)
            .collect()
            .await;
        assert_eq!(payloads, vec![json!("a1"), json!("a2"), json!("b1")]);
    }

    #[tokio::test]
    async fn goes_idle_after_an_empty_pass() {
        let (q1, _) = scripted_queue("q1");
        let (q2, _) = scripted_queue("q2");
        q1.produce(json!(1), None, None).await.unwrap();
        q2.produce(json!(2), None, None).await.unwrap();

        let consumer = Consumer::new(vec![q1, q2], false, Duration::from_secs(5)).unwrap();
        let messages = consumer.messages();
        tokio::pin!(messages);

        assert_eq!(messages.next().await.unwrap().status, MessageStatus::InFlight);
        assert!(messages.next().await.is_some());
        let idle = tokio::time::timeout(Duration::from_millis(200), messages.next()).await;
        assert!(idle.is_err());
    }

    #[tokio::test]
    async fn cancellation_ends_the_stream() {
        let (q1, _) = scripted_queue("q1");
        let consumer = Consumer::new(vec![q1], true, Duration::from_secs(30)).unwrap();
        let token = consumer.cancellation_token();

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel();
        });

        let started = std::time::Instant::now();
        assert_eq!(consumer.messages().count().await, 0);
        assert!(started.elapsed() < Duration::from_secs(5));
        canceller.await.unwrap();
    }

    #[tokio::test]
    async fn run_counts_bounded_passes() {
        let (q1, _) = scripted_queue("q1");
        let (q2, _) = scripted_queue("q2");
        for n in 0..3 {
            q1.produce(json!(n), None, None).await.unwrap();
        }
        q2.produce(json!("x"), None, None).await.unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let consumer = Consumer::new(vec![q1, q2], true, Duration::from_millis(10))
            .unwrap()
            .with_handler(move |message| sink.lock().push(message.payload));

        assert_eq!(consumer.run(Some(2)).await, 4);
        assert_eq!(
            *seen.lock(),
            vec![json!(0), json!(1), json!(2), json!("x")]
        );
    }

    #[tokio::test]
    async fn spawned_consumer_stops_on_cancel_and_closes_queues() {
        let (q1, driver) = scripted_queue("q1");
        q1.produce(json!("bg"), None, None).await.unwrap();

        let consumer = Consumer::new(vec![q1], true, Duration::from_millis(20)).unwrap();
        let token = consumer.cancellation_token();
        let handle = consumer.spawn(None);

        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();
        assert_eq!(handle.await.unwrap(), 1);
        assert!(driver.state.lock().closed);
    }
}
