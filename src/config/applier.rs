//! Turns a [`BrokerConfig`] into running muxers, failovers and acceptors

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::runtime::Handle;

use super::{BrokerConfig, EndpointConfig};
use crate::error::{Error, Result};
use crate::io::Endpoint;
use crate::multiplexing::{Engine, Muxer};
use crate::processing::{Acceptor, Failover};

/// Builds backend endpoints from their configuration
///
/// Transports and backends live outside this crate; the embedding
/// application registers them through this trait.
pub trait EndpointFactory {
    fn create(&self, config: &EndpointConfig) -> Result<Arc<dyn Endpoint>>;
}

/// Owner of the components built from a configuration
pub struct Applier {
    engine: Arc<Engine>,
    runtime: Handle,
    failovers: HashMap<String, Arc<Failover>>,
    acceptors: HashMap<String, Acceptor>,
}

impl Applier {
    pub fn new(engine: &Arc<Engine>, runtime: Handle) -> Self {
        Self {
            engine: Arc::clone(engine),
            runtime,
            failovers: HashMap::new(),
            acceptors: HashMap::new(),
        }
    }

    /// Stop what runs and start every top-level endpoint of `config`
    ///
    /// Endpoints only referenced as failovers or secondaries are built as
    /// part of the chain that references them.
    pub fn apply(&mut self, config: &BrokerConfig, factory: &dyn EndpointFactory) -> Result<()> {
        config.validate()?;
        self.exit();

        let failover_names = config.failover_names();
        for cfg in config
            .endpoints
            .iter()
            .filter(|e| !failover_names.contains(e.name.as_str()))
        {
            let endpoint = factory.create(cfg)?;
            let read_filter = cfg.read_filter()?;
            let mut write_filter = cfg.write_filter()?;

            if endpoint.is_acceptor() {
                tracing::info!(endpoint = %cfg.name, "Creating acceptor");
                let acceptor = Acceptor::new(
                    cfg.name.clone(),
                    endpoint,
                    &self.engine,
                    read_filter,
                    write_filter,
                    self.runtime.clone(),
                );
                acceptor.set_retry_interval(cfg.retry_interval());
                acceptor.start();
                self.acceptors.insert(cfg.name.clone(), acceptor);
                continue;
            }

            write_filter |= &endpoint.stream_mandatory_filter();
            write_filter -= &endpoint.stream_forbidden_filter();
            let muxer = Muxer::create(
                &self.engine,
                cfg.name.clone(),
                read_filter,
                write_filter,
                cfg.cache_enabled,
            )?;

            let mut chain = vec![cfg.name.clone()];
            let failover = create_failover(config, cfg, endpoint, &muxer, factory, &mut chain)?;
            failover.start();
            self.failovers.insert(cfg.name.clone(), failover);
        }

        tracing::info!(
            failovers = self.failovers.len(),
            acceptors = self.acceptors.len(),
            "Configuration applied"
        );
        Ok(())
    }

    pub fn failover(&self, name: &str) -> Option<&Arc<Failover>> {
        self.failovers.get(name)
    }

    pub fn acceptor(&self, name: &str) -> Option<&Acceptor> {
        self.acceptors.get(name)
    }

    /// Ask every stream to reload its configuration
    pub fn update(&self) {
        for failover in self.failovers.values() {
            failover.update();
        }
    }

    /// Stop every component
    pub fn exit(&mut self) {
        for (name, acceptor) in self.acceptors.drain() {
            tracing::debug!(endpoint = %name, "Stopping acceptor");
            acceptor.exit();
        }
        for (name, failover) in self.failovers.drain() {
            tracing::debug!(endpoint = %name, "Stopping failover");
            failover.exit();
        }
    }

    /// Statistics of every endpoint, keyed by name
    pub fn statistics(&self, tree: &mut Map<String, Value>) {
        for (name, failover) in &self.failovers {
            let mut sub = Map::new();
            failover.statistics(&mut sub);
            tree.insert(name.clone(), Value::Object(sub));
        }
        for (name, acceptor) in &self.acceptors {
            let mut sub = Map::new();
            acceptor.statistics(&mut sub);
            tree.insert(name.clone(), Value::Object(sub));
        }
    }
}

impl Drop for Applier {
    fn drop(&mut self) {
        self.exit();
    }
}

/// Build the failover of `cfg` and, recursively, its nested failover chain
fn create_failover(
    config: &BrokerConfig,
    cfg: &EndpointConfig,
    endpoint: Arc<dyn Endpoint>,
    muxer: &Arc<Muxer>,
    factory: &dyn EndpointFactory,
    chain: &mut Vec<String>,
) -> Result<Arc<Failover>> {
    tracing::info!(endpoint = %cfg.name, "Creating failover");
    let failover = Failover::new(cfg.name.clone(), endpoint, Arc::clone(muxer));
    failover.set_retry_interval(cfg.retry_interval());
    failover.set_buffering_timeout(cfg.buffering_timeout());

    if let Some((first, secondaries)) = cfg.failovers.split_first() {
        let nested_cfg = config
            .endpoint(first)
            .ok_or_else(|| Error::UnknownEndpoint(first.clone()))?;
        if chain.contains(&nested_cfg.name) {
            return Err(Error::Config(format!(
                "failover loop: {} -> {}",
                chain.join(" -> "),
                nested_cfg.name
            )));
        }

        let nested_endpoint = factory.create(nested_cfg)?;
        if nested_endpoint.is_acceptor() {
            return Err(Error::Config(format!(
                "cannot use acceptor '{}' as failover of '{}'",
                nested_cfg.name, cfg.name
            )));
        }

        chain.push(nested_cfg.name.clone());
        let nested = create_failover(config, nested_cfg, nested_endpoint, muxer, factory, chain)?;
        chain.pop();

        for name in secondaries {
            let secondary_cfg = config
                .endpoint(name)
                .ok_or_else(|| Error::UnknownEndpoint(name.clone()))?;
            let secondary = factory.create(secondary_cfg)?;
            if secondary.is_acceptor() {
                tracing::error!(
                    endpoint = %cfg.name,
                    secondary = %name,
                    "Secondary failover is an acceptor, ignoring it"
                );
                continue;
            }
            nested.add_secondary_endpoint(secondary);
        }

        failover.set_failover(nested);
    }

    Ok(Arc::new(failover))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::io::{Deadline, Event, ReadOutcome, Stream, StreamError};
    use crate::multiplexing::{EngineConfig, MuxerFilter};

    struct NullStream;

    impl Stream for NullStream {
        fn read(&mut self, _deadline: Deadline) -> std::result::Result<ReadOutcome, StreamError> {
            Ok(ReadOutcome::TimedOut)
        }

        fn write(&mut self, _event: &Event) -> std::result::Result<usize, StreamError> {
            Ok(1)
        }
    }

    struct TestEndpoint {
        reachable: bool,
        acceptor: bool,
    }

    impl Endpoint for TestEndpoint {
        fn open(&self) -> std::result::Result<Option<Box<dyn Stream>>, StreamError> {
            if self.reachable && !self.acceptor {
                Ok(Some(Box::new(NullStream)))
            } else {
                std::thread::sleep(std::time::Duration::from_millis(10));
                Ok(None)
            }
        }

        fn is_acceptor(&self) -> bool {
            self.acceptor
        }

        fn stream_forbidden_filter(&self) -> MuxerFilter {
            MuxerFilter::none().with_category(2)
        }
    }

    #[derive(Default)]
    struct Factory {
        calls: AtomicUsize,
    }

    impl EndpointFactory for Factory {
        fn create(&self, config: &EndpointConfig) -> Result<Arc<dyn Endpoint>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(TestEndpoint {
                reachable: config.params.get("reachable").and_then(Value::as_bool) != Some(false),
                acceptor: config.params.get("listen").and_then(Value::as_bool) == Some(true),
            }))
        }
    }

    fn engine(dir: &tempfile::TempDir) -> Arc<Engine> {
        Engine::new(EngineConfig::with_cache_prefix(dir.path().join("central")))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_apply_builds_failover_chain() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(&dir);
        let config = BrokerConfig::from_json(
            r#"{"endpoints": [
                {"name": "sql", "failovers": ["retention", "mirror"], "params": {"reachable": false}},
                {"name": "retention"},
                {"name": "mirror"},
                {"name": "input", "params": {"listen": true}}
            ]}"#,
        )
        .unwrap();

        let factory = Factory::default();
        let mut applier = Applier::new(&engine, Handle::current());
        let (applier, factory) = tokio::task::spawn_blocking(move || {
            applier.apply(&config, &factory).unwrap();
            (applier, factory)
        })
        .await
        .unwrap();

        assert!(applier.failover("sql").is_some());
        assert!(applier.failover("retention").is_none());
        assert!(applier.acceptor("input").is_some());
        assert_eq!(factory.calls.load(Ordering::SeqCst), 4);

        // Forbidden category removed from the output muxer
        let muxer = engine.muxer("sql").unwrap();
        assert!(!muxer.write_filter().allows(0x20001));
        assert!(muxer.write_filter().allows(0x10001));

        let mut tree = Map::new();
        applier.statistics(&mut tree);
        assert!(tree["sql"].is_object());
        assert!(tree["input"].is_object());

        tokio::task::spawn_blocking(move || drop(applier))
            .await
            .unwrap();
    }

    #[test]
    fn test_failover_loop_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(&dir);
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let config = BrokerConfig::from_json(
            r#"{"endpoints": [
                {"name": "a", "failovers": ["b"]},
                {"name": "b", "failovers": ["c"]},
                {"name": "c", "failovers": ["b"]}
            ]}"#,
        )
        .unwrap();

        // Every endpoint is somebody's failover except "a"
        let mut applier = Applier::new(&engine, runtime.handle().clone());
        let err = applier.apply(&config, &Factory::default()).unwrap_err();
        assert!(matches!(err, Error::Config(msg) if msg.contains("failover loop")));
    }

    #[test]
    fn test_acceptor_as_failover_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(&dir);
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let config = BrokerConfig::from_json(
            r#"{"endpoints": [
                {"name": "a", "failovers": ["in"]},
                {"name": "in", "params": {"listen": true}}
            ]}"#,
        )
        .unwrap();

        let mut applier = Applier::new(&engine, runtime.handle().clone());
        assert!(matches!(
            applier.apply(&config, &Factory::default()),
            Err(Error::Config(_))
        ));
    }
}
