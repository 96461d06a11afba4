//! Forwards decoded facts to the message bus.

use crate::register::{self, DecodedFact};
use crate::shutdown::Shutdown;
use log::*;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::Duration;

/// Default pause between two publications.
pub const DEFAULT_PACING: Duration = Duration::from_millis(200);

/// How often a waiting publisher looks at the shutdown token.
const QUEUE_POLL: Duration = Duration::from_millis(100);

/// Destination of published facts, e.g. an MQTT client.
pub trait Sink {
    type Error: std::fmt::Display;

    fn publish(&mut self, topic: &str, payload: &str) -> Result<(), Self::Error>;
}

/// Drains the fact queue and publishes every fact that has a topic.
pub struct Publisher<S> {
    sink: S,
    ems_id: String,
    pacing: Duration,
    shutdown: Shutdown,
}

impl<S: Sink> Publisher<S> {
    pub fn new(sink: S, ems_id: impl Into<String>, shutdown: Shutdown) -> Self {
        Self {
            sink,
            ems_id: ems_id.into(),
            pacing: DEFAULT_PACING,
            shutdown,
        }
    }

    /// Minimum delay between two publications.
    pub fn with_pacing(mut self, pacing: Duration) -> Self {
        self.pacing = pacing;
        self
    }

    /// Publishes until shutdown is raised or the producer side is gone.
    pub fn run(mut self, facts: Receiver<DecodedFact>) -> S {
        info!("Publisher started");
        while !self.shutdown.is_triggered() {
            match facts.recv_timeout(QUEUE_POLL) {
                Ok(fact) => {
                    if self.publish(&fact) {
                        self.shutdown.sleep(self.pacing);
                    }
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    debug!("Fact queue closed");
                    break;
                }
            }
        }
        info!("Publisher stopped");
        self.sink
    }

    /// Publishes a single fact. Returns whether anything was sent.
    pub fn publish(&mut self, fact: &DecodedFact) -> bool {
        let Some(topic) = register::topic(&self.ems_id, fact.address) else {
            trace!("No topic for register {:#06x}, dropping", fact.address);
            return false;
        };
        let payload = fact.value.to_string();
        match self.sink.publish(&topic, &payload) {
            Ok(()) => {
                debug!("Published to {topic}: {payload}");
                true
            }
            Err(error) => {
                warn!("Cannot publish to {topic}: {error}");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::register::Value;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Instant;

    #[derive(Default)]
    struct RecordingSink {
        published: Vec<(String, String)>,
        fail: bool,
    }

    impl Sink for RecordingSink {
        type Error = &'static str;

        fn publish(&mut self, topic: &str, payload: &str) -> Result<(), Self::Error> {
            if self.fail {
                return Err("not connected");
            }
            self.published.push((topic.to_string(), payload.to_string()));
            Ok(())
        }
    }

    fn fact(address: u16, value: Value) -> DecodedFact {
        DecodedFact { address, value }
    }

    #[test]
    fn publishes_in_queue_order_and_drops_unknown_registers() {
        let (tx, rx) = mpsc::channel();
        tx.send(fact(0x4002, Value::Number(23.5))).unwrap();
        tx.send(fact(0x400F, Value::Raw(3))).unwrap();
        tx.send(fact(0x303B, Value::Label("on"))).unwrap();
        drop(tx);

        let publisher = Publisher::new(RecordingSink::default(), "0001", Shutdown::new())
            .with_pacing(Duration::ZERO);
        let sink = publisher.run(rx);
        assert_eq!(
            sink.published,
            [
                (
                    "solar/ems/0001/MPPT1_Voltage".to_string(),
                    "23.5".to_string()
                ),
                ("solar/ems/0001/EMS_EM".to_string(), "on".to_string()),
            ]
        );
    }

    #[test]
    fn failed_publish_is_skipped() {
        let sink = RecordingSink {
            fail: true,
            ..Default::default()
        };
        let mut publisher = Publisher::new(sink, "0001", Shutdown::new());
        assert!(!publisher.publish(&fact(0x4002, Value::Number(1.0))));
    }

    #[test]
    fn shutdown_ends_idle_publisher() {
        let shutdown = Shutdown::new();
        let (_tx, rx) = mpsc::channel::<DecodedFact>();
        let publisher = Publisher::new(RecordingSink::default(), "0001", shutdown.clone());
        let started = Instant::now();
        let handle = thread::spawn(move || publisher.run(rx));
        thread::sleep(Duration::from_millis(20));
        shutdown.trigger();
        assert!(handle.join().unwrap().published.is_empty());
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
