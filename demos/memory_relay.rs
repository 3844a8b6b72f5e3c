//! In-memory relay
//!
//! An acceptor hands one generated client to a feeder, which publishes
//! metric events to the engine. An output endpoint with a flaky connection
//! receives them through its failover; a backup endpoint takes over while it
//! reconnects.
//!
//! Run with: `RUST_LOG=debug cargo run --example memory_relay`

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use cbmux::config::{Applier, EndpointFactory};
use cbmux::{
    BrokerConfig, Deadline, Endpoint, EndpointConfig, Engine, Event, EventType, ReadOutcome,
    Stream, StreamError,
};
use parking_lot::Mutex;
use tracing_subscriber::EnvFilter;

const METRIC: EventType = EventType::new(3, 1);

/// Client producing a fixed number of metrics, then closing
struct Generator {
    events: VecDeque<Event>,
}

impl Stream for Generator {
    fn read(&mut self, _deadline: Deadline) -> Result<ReadOutcome, StreamError> {
        match self.events.pop_front() {
            Some(event) => Ok(ReadOutcome::Event(event)),
            None => Err(StreamError::Shutdown),
        }
    }

    fn write(&mut self, _event: &Event) -> Result<usize, StreamError> {
        Ok(1)
    }
}

/// Listening endpoint accepting a single generator
struct GeneratorListener {
    accepted: AtomicBool,
    count: u32,
}

impl Endpoint for GeneratorListener {
    fn open(&self) -> Result<Option<Box<dyn Stream>>, StreamError> {
        if self.accepted.swap(true, Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(100));
            return Ok(None);
        }
        let events = (0..self.count)
            .map(|i| Event::new(METRIC, Bytes::from(format!("cpu.load {}", i))).with_source(1))
            .collect();
        Ok(Some(Box::new(Generator { events })))
    }

    fn is_acceptor(&self) -> bool {
        true
    }
}

/// Output stream that drops its connection after a number of writes
struct Printer {
    name: String,
    received: Arc<AtomicUsize>,
    fail_after: Option<usize>,
    written: usize,
}

impl Stream for Printer {
    fn read(&mut self, _deadline: Deadline) -> Result<ReadOutcome, StreamError> {
        Ok(ReadOutcome::TimedOut)
    }

    fn write(&mut self, event: &Event) -> Result<usize, StreamError> {
        if self.fail_after == Some(self.written) {
            return Err(StreamError::ConnectionClosed);
        }
        self.written += 1;
        self.received.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(output = %self.name, event = %event, "Event received");
        Ok(1)
    }
}

struct PrinterEndpoint {
    name: String,
    received: Arc<AtomicUsize>,
    connections: AtomicUsize,
    flaky: bool,
}

impl Endpoint for PrinterEndpoint {
    fn open(&self) -> Result<Option<Box<dyn Stream>>, StreamError> {
        let n = self.connections.fetch_add(1, Ordering::SeqCst);
        Ok(Some(Box::new(Printer {
            name: self.name.clone(),
            received: Arc::clone(&self.received),
            // Only the first connection of a flaky endpoint breaks
            fail_after: (self.flaky && n == 0).then_some(10),
            written: 0,
        })))
    }
}

#[derive(Default)]
struct Factory {
    outputs: Mutex<Vec<(String, Arc<AtomicUsize>)>>,
}

impl EndpointFactory for Factory {
    fn create(&self, config: &EndpointConfig) -> cbmux::Result<Arc<dyn Endpoint>> {
        match config.params.get("kind").and_then(|v| v.as_str()) {
            Some("generator") => Ok(Arc::new(GeneratorListener {
                accepted: AtomicBool::new(false),
                count: 50,
            })),
            Some("printer") => {
                let received = Arc::new(AtomicUsize::new(0));
                self.outputs
                    .lock()
                    .push((config.name.clone(), Arc::clone(&received)));
                Ok(Arc::new(PrinterEndpoint {
                    name: config.name.clone(),
                    received,
                    connections: AtomicUsize::new(0),
                    flaky: config.params.get("flaky").and_then(|v| v.as_bool()) == Some(true),
                }))
            }
            _ => Err(cbmux::Error::UnknownEndpoint(config.name.clone())),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("cbmux=info".parse()?))
        .init();

    let dir = tempfile::tempdir()?;
    let json = format!(
        r#"{{
            "cache_prefix": "{}",
            "event_queue_max_size": 20,
            "endpoints": [
                {{"name": "input", "params": {{"kind": "generator"}}, "write_filters": []}},
                {{"name": "graphs", "failovers": ["graphs-backup"], "retry_interval": 1,
                  "write_filters": ["3:*"], "params": {{"kind": "printer", "flaky": true}}}},
                {{"name": "graphs-backup", "params": {{"kind": "printer"}}}}
            ]
        }}"#,
        dir.path().join("relay").display()
    );
    let config = BrokerConfig::from_json(&json)?;

    let engine = Engine::new(config.engine_config());
    let factory = Factory::default();
    let runtime = tokio::runtime::Handle::current();

    let (applier, factory) = tokio::task::spawn_blocking({
        let engine = Arc::clone(&engine);
        move || -> cbmux::Result<(Applier, Factory)> {
            let mut applier = Applier::new(&engine, runtime);
            applier.apply(&config, &factory)?;
            engine.start();
            Ok((applier, factory))
        }
    })
    .await??;

    tokio::time::sleep(Duration::from_secs(4)).await;

    for (name, received) in factory.outputs.lock().iter() {
        tracing::info!(output = %name, received = received.load(Ordering::SeqCst), "Output summary");
    }

    let mut tree = serde_json::Map::new();
    applier.statistics(&mut tree);
    engine.statistics(&mut tree);
    println!("{}", serde_json::to_string_pretty(&tree)?);

    tokio::task::spawn_blocking(move || {
        drop(applier);
        engine.stop();
    })
    .await?;
    Ok(())
}
