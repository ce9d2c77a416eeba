//! Shared producer/consumer machinery for providers
//!
//! Each variant only implements [`Discover`]: connect, then push entries into
//! an [`EntrySender`]. [`StreamingProvider`] owns the lifecycle: it runs
//! `connect` inline during `init` (so connection failures surface to the
//! stage), then moves the discoverer into a producer task that feeds a
//! bounded queue drained by `next`.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

use super::{
    Entry, EntryFilter, EntryProvider, ProviderContext, ProviderError, ProviderState,
};

/// One provider variant's discovery logic
#[async_trait]
pub trait Discover: Send + 'static {
    /// Variant tag, e.g. `remote_fs`
    fn kind(&self) -> &'static str;

    /// Physical endpoint identity; combined with `kind` into the provider id
    fn endpoint_id(&self) -> String;

    /// Establish the session. Failures are fatal to the stage.
    async fn connect(&mut self) -> Result<(), ProviderError>;

    /// Push entries until done or until `out` reports the consumer is gone.
    ///
    /// Per-entry failures go through [`EntrySender::skip`]; an `Err` return
    /// ends discovery early and is recorded on the provider.
    async fn discover(&mut self, out: &EntrySender) -> Result<(), ProviderError>;

    /// Release the session once discovery ends
    async fn disconnect(&mut self) {}
}

/// Producer half handed to [`Discover::discover`]
#[derive(Clone)]
pub struct EntrySender {
    tx: mpsc::Sender<Entry>,
    filter: Arc<EntryFilter>,
    errors: Arc<Mutex<Vec<String>>>,
    artifacts: Arc<Mutex<Vec<PathBuf>>>,
}

impl EntrySender {
    /// Queue `entry` if its name passes the filter.
    ///
    /// Returns `false` once the consumer has closed the provider; discovery
    /// should stop at that point.
    pub async fn offer(&self, entry: Entry) -> bool {
        if !self.filter.accepts(entry.name()) {
            trace!(path = %entry.path(), "Entry filtered out");
            return !self.tx.is_closed();
        }
        self.tx.send(entry).await.is_ok()
    }

    /// Whether walkers should descend into sub-directories / links
    pub fn recursive(&self) -> bool {
        self.filter.recursive()
    }

    /// Whether a name would pass the allow-list. Lets walkers skip
    /// expensive per-entry work for entries that will be dropped anyway.
    pub fn accepts(&self, name: &str) -> bool {
        self.filter.accepts(name)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Log and record a per-entry failure; discovery continues
    pub fn skip(&self, path: &str, err: ProviderError) {
        warn!(path = %path, error = %err, "Skipping entry");
        self.push_error(format!("{}: {}", path, err));
    }

    /// Register an artifact file produced during discovery
    pub fn attach(&self, path: PathBuf) {
        if let Ok(mut artifacts) = self.artifacts.lock() {
            artifacts.push(path);
        }
    }

    fn push_error(&self, message: String) {
        if let Ok(mut errors) = self.errors.lock() {
            errors.push(message);
        }
    }
}

/// [`EntryProvider`] implementation shared by every variant
pub struct StreamingProvider<D: Discover> {
    id: String,
    name: String,
    state: ProviderState,
    discoverer: Option<D>,
    filter: Arc<EntryFilter>,
    queue_depth: usize,
    close_timeout: Duration,
    rx: Option<mpsc::Receiver<Entry>>,
    producer: Option<JoinHandle<()>>,
    errors: Arc<Mutex<Vec<String>>>,
    artifacts: Arc<Mutex<Vec<PathBuf>>>,
}

impl<D: Discover> StreamingProvider<D> {
    pub fn new(discoverer: D, filter: EntryFilter, ctx: &ProviderContext) -> Self {
        Self {
            id: format!("{}:{}", discoverer.kind(), discoverer.endpoint_id()),
            name: ctx.instance_name.clone(),
            state: ProviderState::NotStarted,
            discoverer: Some(discoverer),
            filter: Arc::new(filter),
            queue_depth: ctx.settings.provider_queue_depth.max(1),
            close_timeout: ctx.settings.close_timeout(),
            rx: None,
            producer: None,
            errors: Arc::new(Mutex::new(Vec::new())),
            artifacts: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

#[async_trait]
impl<D: Discover> EntryProvider for StreamingProvider<D> {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> ProviderState {
        self.state
    }

    async fn init(&mut self) -> Result<(), ProviderError> {
        let mut discoverer = match (self.state, self.discoverer.take()) {
            (ProviderState::NotStarted, Some(discoverer)) => discoverer,
            _ => return Err(ProviderError::AlreadyInitialized(self.name.clone())),
        };

        info!(provider = %self.name, id = %self.id, "Connecting provider");
        if let Err(e) = discoverer.connect().await {
            self.state = ProviderState::Exhausted;
            return Err(e);
        }

        let (tx, rx) = mpsc::channel(self.queue_depth);
        let sender = EntrySender {
            tx,
            filter: self.filter.clone(),
            errors: self.errors.clone(),
            artifacts: self.artifacts.clone(),
        };

        let span = info_span!("provider", name = %self.name);
        let handle = tokio::spawn(
            async move {
                match discoverer.discover(&sender).await {
                    Ok(()) => debug!("Discovery finished"),
                    Err(e) => {
                        error!(error = %e, "Discovery aborted");
                        sender.push_error(format!("discovery aborted: {}", e));
                    },
                }
                discoverer.disconnect().await;
            }
            .instrument(span),
        );

        self.rx = Some(rx);
        self.producer = Some(handle);
        self.state = ProviderState::Streaming;
        Ok(())
    }

    async fn next(&mut self) -> Option<Entry> {
        if self.state != ProviderState::Streaming {
            if self.state == ProviderState::NotStarted {
                warn!(provider = %self.name, "next() called before init()");
            }
            return None;
        }

        let received = match self.rx.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        };

        if received.is_none() {
            debug!(provider = %self.name, "Provider exhausted");
            self.state = ProviderState::Exhausted;
            self.rx = None;
        }
        received
    }

    async fn close(&mut self) {
        if self.state == ProviderState::Closed {
            return;
        }

        // Dropping the receiver makes the producer's next send fail
        self.rx = None;
        self.discoverer = None;

        if let Some(mut handle) = self.producer.take() {
            match tokio::time::timeout(self.close_timeout, &mut handle).await {
                Ok(Ok(())) => {},
                Ok(Err(e)) if e.is_panic() => {
                    error!(provider = %self.name, "Producer task panicked");
                    if let Ok(mut errors) = self.errors.lock() {
                        errors.push("producer task panicked".to_string());
                    }
                },
                Ok(Err(_)) => {},
                Err(_) => {
                    warn!(
                        provider = %self.name,
                        timeout_secs = self.close_timeout.as_secs(),
                        "Producer did not stop in time, aborting"
                    );
                    handle.abort();
                },
            }
        }

        self.state = ProviderState::Closed;
        debug!(provider = %self.name, "Provider closed");
    }

    fn errors(&self) -> Vec<String> {
        self.errors.lock().map(|e| e.clone()).unwrap_or_default()
    }

    fn output_paths(&self) -> Vec<PathBuf> {
        self.artifacts.lock().map(|a| a.clone()).unwrap_or_default()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::{EndpointRegistry, EngineSettings};

    /// Emits `count` in-memory entries named `item-<n>.txt`
    struct Counter {
        count: usize,
        fail_connect: bool,
    }

    #[async_trait]
    impl Discover for Counter {
        fn kind(&self) -> &'static str {
            "counter"
        }

        fn endpoint_id(&self) -> String {
            "memory".to_string()
        }

        async fn connect(&mut self) -> Result<(), ProviderError> {
            if self.fail_connect {
                Err(ProviderError::Ftp("connection refused".to_string()))
            } else {
                Ok(())
            }
        }

        async fn discover(&mut self, out: &EntrySender) -> Result<(), ProviderError> {
            for n in 0..self.count {
                let name = format!("item-{}.txt", n);
                if n == 1 {
                    out.skip(&name, ProviderError::Archive("corrupt".to_string()));
                    continue;
                }
                if !out.offer(Entry::from_bytes(name.clone(), name, vec![])).await {
                    break;
                }
            }
            Ok(())
        }
    }

    fn ctx() -> ProviderContext {
        ProviderContext {
            endpoints: EndpointRegistry::new(),
            settings: EngineSettings {
                provider_queue_depth: 2,
                close_timeout_secs: 1,
                ..Default::default()
            },
            artifact_dir: std::env::temp_dir(),
            instance_name: "test/0-counter".to_string(),
        }
    }

    fn provider(count: usize, fail_connect: bool) -> StreamingProvider<Counter> {
        StreamingProvider::new(
            Counter {
                count,
                fail_connect,
            },
            EntryFilter::all(),
            &ctx(),
        )
    }

    #[tokio::test]
    async fn test_single_pass_terminal_signal_is_sticky() {
        let mut p = provider(4, false);
        assert_eq!(p.id(), "counter:memory");
        p.init().await.unwrap();

        let mut names = Vec::new();
        while let Some(entry) = p.next().await {
            names.push(entry.name().to_string());
        }
        assert_eq!(names, vec!["item-0.txt", "item-2.txt", "item-3.txt"]);
        assert_eq!(p.state(), ProviderState::Exhausted);

        for _ in 0..3 {
            assert!(p.next().await.is_none());
        }
        assert_eq!(p.errors().len(), 1);
        p.close().await;
    }

    #[tokio::test]
    async fn test_init_twice_is_rejected() {
        let mut p = provider(0, false);
        p.init().await.unwrap();
        assert!(matches!(
            p.init().await,
            Err(ProviderError::AlreadyInitialized(_))
        ));
        p.close().await;
    }

    #[tokio::test]
    async fn test_connect_failure_leaves_provider_exhausted() {
        let mut p = provider(3, true);
        assert!(p.init().await.is_err());
        assert!(p.next().await.is_none());
        p.close().await;
        p.close().await;
        assert_eq!(p.state(), ProviderState::Closed);
    }

    #[tokio::test]
    async fn test_close_mid_stream_stops_producer() {
        // queue depth 2 with 1000 entries keeps the producer blocked on send
        let mut p = provider(1000, false);
        p.init().await.unwrap();
        assert!(p.next().await.is_some());

        p.close().await;
        assert_eq!(p.state(), ProviderState::Closed);
        assert!(p.next().await.is_none());
    }

    #[tokio::test]
    async fn test_filter_applies_before_queueing() {
        let mut p = StreamingProvider::new(
            Counter {
                count: 4,
                fail_connect: false,
            },
            EntryFilter::new(Some("item-[03].txt"), true).unwrap(),
            &ctx(),
        );
        p.init().await.unwrap();
        let mut names = Vec::new();
        while let Some(entry) = p.next().await {
            names.push(entry.name().to_string());
        }
        assert_eq!(names, vec!["item-0.txt", "item-3.txt"]);
        p.close().await;
    }
}
