//! Mock capability-negotiation library.
//!
//! Pipes raise their connect intent lazily on the first produce or consume,
//! the way a real library does, so tests exercise the client's intent
//! wiring end to end. Everything the mock creates is recorded in a shared
//! [`NegotiatorLog`] that outlives the session.
//!
//! # Example
//!
//! ```rust,ignore
//! use sfu_test_utils::MockNegotiatorFactory;
//!
//! let negotiators = Arc::new(
//!     MockNegotiatorFactory::builder()
//!         .fail_produce(MediaKind::Audio)
//!         .build(),
//! );
//! let log = negotiators.log();
//! // ... join and close ...
//! assert_eq!(log.open_pipes(), 0);
//! ```

use async_trait::async_trait;
use common::types::{ConsumerId, Direction, MediaKind, ProducerId, TransportId};
use parking_lot::Mutex;
use serde_json::json;
use sfu_client::errors::NegotiatorError;
use sfu_client::media::{LocalTrack, RemoteTrack};
use sfu_client::negotiator::{
    CapabilityNegotiator, Consumer, ConsumerOptions, DtlsParameters, NegotiatorFactory, Pipe,
    PipeListener, PipeState, Producer, RecvPipe, RtpCapabilities, RtpParameters, SendPipe,
    TransportOptions,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// What a pipe looked like when the test inspected it.
#[derive(Debug)]
pub struct PipeRecord {
    pub id: TransportId,
    pub direction: Direction,
    closed: AtomicBool,
    connected: AtomicBool,
}

impl PipeRecord {
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Everything the mock negotiators created, across sessions.
#[derive(Debug, Default)]
pub struct NegotiatorLog {
    negotiators: AtomicUsize,
    loads: AtomicUsize,
    pipes: Mutex<Vec<Arc<PipeRecord>>>,
    produced: AtomicUsize,
    consumers: AtomicUsize,
    resumed: AtomicUsize,
    events: Mutex<Vec<String>>,
}

impl NegotiatorLog {
    /// Negotiator instances handed out by the factory.
    #[must_use]
    pub fn negotiators_created(&self) -> usize {
        self.negotiators.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn pipes_created(&self) -> usize {
        self.pipes.lock().len()
    }

    /// Pipes created and not yet closed.
    #[must_use]
    pub fn open_pipes(&self) -> usize {
        self.pipes.lock().iter().filter(|p| !p.is_closed()).count()
    }

    /// Every pipe created so far, in creation order.
    #[must_use]
    pub fn pipes(&self) -> Vec<Arc<PipeRecord>> {
        self.pipes.lock().clone()
    }

    #[must_use]
    pub fn produced(&self) -> usize {
        self.produced.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn consumers_created(&self) -> usize {
        self.consumers.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn resumed(&self) -> usize {
        self.resumed.load(Ordering::SeqCst)
    }

    /// Library-side milestones in the order they happened: `connected send`,
    /// `connected recv`, `produced <kind>`, `consumed <producer id>`.
    #[must_use]
    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    fn record_event(&self, event: String) {
        self.events.lock().push(event);
    }

    fn record_pipe(&self, id: TransportId, direction: Direction) -> Arc<PipeRecord> {
        let record = Arc::new(PipeRecord {
            id,
            direction,
            closed: AtomicBool::new(false),
            connected: AtomicBool::new(false),
        });
        self.pipes.lock().push(Arc::clone(&record));
        record
    }
}

#[derive(Debug, Clone, Default)]
struct MockOptions {
    fail_load: Option<String>,
    fail_produce: Vec<MediaKind>,
    cannot_produce: Vec<MediaKind>,
}

/// Mock negotiator. One per session, built by [`MockNegotiatorFactory`].
pub struct MockNegotiator {
    options: MockOptions,
    log: Arc<NegotiatorLog>,
    loaded: AtomicBool,
}

impl MockNegotiator {
    fn ensure_loaded(&self) -> Result<(), NegotiatorError> {
        if self.loaded.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(NegotiatorError::NotLoaded)
        }
    }
}

#[async_trait]
impl CapabilityNegotiator for MockNegotiator {
    async fn load(&self, _router_capabilities: RtpCapabilities) -> Result<(), NegotiatorError> {
        self.log.loads.fetch_add(1, Ordering::SeqCst);
        if let Some(reason) = &self.options.fail_load {
            return Err(NegotiatorError::Load(reason.clone()));
        }
        self.loaded.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }

    fn rtp_capabilities(&self) -> Result<RtpCapabilities, NegotiatorError> {
        self.ensure_loaded()?;
        Ok(RtpCapabilities(json!({
            "codecs": [
                { "mimeType": "audio/opus", "kind": "audio" },
                { "mimeType": "video/VP8", "kind": "video" }
            ]
        })))
    }

    fn can_produce(&self, kind: MediaKind) -> bool {
        self.is_loaded() && !self.options.cannot_produce.contains(&kind)
    }

    async fn create_send_pipe(
        &self,
        options: TransportOptions,
        listener: Arc<dyn PipeListener>,
    ) -> Result<Arc<dyn SendPipe>, NegotiatorError> {
        self.ensure_loaded()?;
        let record = self.log.record_pipe(options.id.clone(), Direction::Send);
        Ok(Arc::new(MockPipe::new(
            options.id,
            Direction::Send,
            listener,
            record,
            Arc::clone(&self.log),
            self.options.fail_produce.clone(),
        )))
    }

    async fn create_recv_pipe(
        &self,
        options: TransportOptions,
        listener: Arc<dyn PipeListener>,
    ) -> Result<Arc<dyn RecvPipe>, NegotiatorError> {
        self.ensure_loaded()?;
        let record = self.log.record_pipe(options.id.clone(), Direction::Recv);
        Ok(Arc::new(MockPipe::new(
            options.id,
            Direction::Recv,
            listener,
            record,
            Arc::clone(&self.log),
            Vec::new(),
        )))
    }
}

/// Mock pipe. Implements both directions; the client only sees the one it
/// asked for.
struct MockPipe {
    id: TransportId,
    direction: Direction,
    listener: Arc<dyn PipeListener>,
    record: Arc<PipeRecord>,
    log: Arc<NegotiatorLog>,
    fail_produce: Vec<MediaKind>,
    state: Mutex<PipeState>,
    connect_gate: tokio::sync::Mutex<()>,
}

impl MockPipe {
    fn new(
        id: TransportId,
        direction: Direction,
        listener: Arc<dyn PipeListener>,
        record: Arc<PipeRecord>,
        log: Arc<NegotiatorLog>,
        fail_produce: Vec<MediaKind>,
    ) -> Self {
        Self {
            id,
            direction,
            listener,
            record,
            log,
            fail_produce,
            state: Mutex::new(PipeState::New),
            connect_gate: tokio::sync::Mutex::new(()),
        }
    }

    /// Raise the connect intent once, on first use.
    async fn ensure_connected(&self) -> Result<(), NegotiatorError> {
        let _gate = self.connect_gate.lock().await;
        let current = *self.state.lock();
        match current {
            PipeState::Connected => return Ok(()),
            PipeState::Closed => return Err(NegotiatorError::PipeClosed),
            PipeState::New | PipeState::Connecting => {}
        }

        *self.state.lock() = PipeState::Connecting;
        let result = self
            .listener
            .on_connect(DtlsParameters(json!({ "role": "client", "fingerprints": [] })))
            .await;

        let mut state = self.state.lock();
        if *state == PipeState::Closed {
            return Err(NegotiatorError::PipeClosed);
        }
        match result {
            Ok(()) => {
                *state = PipeState::Connected;
                self.record.connected.store(true, Ordering::SeqCst);
                drop(state);
                self.log.record_event(format!("connected {}", self.direction));
                Ok(())
            }
            Err(e) => {
                *state = PipeState::New;
                Err(e)
            }
        }
    }
}

impl Pipe for MockPipe {
    fn id(&self) -> &TransportId {
        &self.id
    }

    fn direction(&self) -> Direction {
        self.direction
    }

    fn connection_state(&self) -> PipeState {
        *self.state.lock()
    }

    fn close(&self) {
        *self.state.lock() = PipeState::Closed;
        self.record.closed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl SendPipe for MockPipe {
    async fn produce(
        &self,
        track: Arc<dyn LocalTrack>,
    ) -> Result<Box<dyn Producer>, NegotiatorError> {
        self.ensure_connected().await?;

        let kind = track.kind();
        if self.fail_produce.contains(&kind) {
            return Err(NegotiatorError::Failed(format!("{kind} encoder unavailable")));
        }

        let id = self
            .listener
            .on_produce(kind, RtpParameters(json!({ "mid": track.id(), "kind": kind })))
            .await?;
        if self.is_closed() {
            return Err(NegotiatorError::PipeClosed);
        }

        self.log.produced.fetch_add(1, Ordering::SeqCst);
        self.log.record_event(format!("produced {kind}"));
        Ok(Box::new(MockProducer {
            id,
            kind,
            closed: AtomicBool::new(false),
        }))
    }
}

#[async_trait]
impl RecvPipe for MockPipe {
    async fn consume(
        &self,
        options: ConsumerOptions,
    ) -> Result<Box<dyn Consumer>, NegotiatorError> {
        self.ensure_connected().await?;

        self.log.consumers.fetch_add(1, Ordering::SeqCst);
        self.log
            .record_event(format!("consumed {}", options.producer_id));
        Ok(Box::new(MockConsumer {
            id: options.id,
            producer_id: options.producer_id,
            kind: options.kind,
            log: Arc::clone(&self.log),
            closed: AtomicBool::new(false),
        }))
    }
}

struct MockProducer {
    id: ProducerId,
    kind: MediaKind,
    closed: AtomicBool,
}

impl Producer for MockProducer {
    fn id(&self) -> &ProducerId {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct MockConsumer {
    id: ConsumerId,
    producer_id: ProducerId,
    kind: MediaKind,
    log: Arc<NegotiatorLog>,
    closed: AtomicBool,
}

#[async_trait]
impl Consumer for MockConsumer {
    fn id(&self) -> &ConsumerId {
        &self.id
    }

    fn producer_id(&self) -> &ProducerId {
        &self.producer_id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn track(&self) -> RemoteTrack {
        RemoteTrack {
            id: format!("track-{}", self.producer_id),
            kind: self.kind,
            producer_id: self.producer_id.clone(),
            consumer_id: self.id.clone(),
        }
    }

    async fn resume(&self) -> Result<(), NegotiatorError> {
        if self.is_closed() {
            return Err(NegotiatorError::PipeClosed);
        }
        self.log.resumed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Builds a fresh [`MockNegotiator`] per session, sharing one log.
pub struct MockNegotiatorFactory {
    options: MockOptions,
    log: Arc<NegotiatorLog>,
}

impl Default for MockNegotiatorFactory {
    fn default() -> Self {
        MockNegotiatorFactory::builder().build()
    }
}

impl MockNegotiatorFactory {
    /// Create a new MockNegotiatorFactory builder.
    #[must_use]
    pub fn builder() -> MockNegotiatorFactoryBuilder {
        MockNegotiatorFactoryBuilder::default()
    }

    #[must_use]
    pub fn log(&self) -> Arc<NegotiatorLog> {
        Arc::clone(&self.log)
    }
}

impl NegotiatorFactory for MockNegotiatorFactory {
    fn create(&self) -> Arc<dyn CapabilityNegotiator> {
        self.log.negotiators.fetch_add(1, Ordering::SeqCst);
        Arc::new(MockNegotiator {
            options: self.options.clone(),
            log: Arc::clone(&self.log),
            loaded: AtomicBool::new(false),
        })
    }
}

/// Builder for MockNegotiatorFactory configuration.
#[derive(Debug, Default)]
pub struct MockNegotiatorFactoryBuilder {
    options: MockOptions,
}

impl MockNegotiatorFactoryBuilder {
    /// Make `load` fail with `reason`.
    #[must_use]
    pub fn fail_load(mut self, reason: &str) -> Self {
        self.options.fail_load = Some(reason.to_string());
        self
    }

    /// Make producing tracks of `kind` fail inside the library.
    #[must_use]
    pub fn fail_produce(mut self, kind: MediaKind) -> Self {
        self.options.fail_produce.push(kind);
        self
    }

    /// Report that the router cannot receive `kind`.
    #[must_use]
    pub fn cannot_produce(mut self, kind: MediaKind) -> Self {
        self.options.cannot_produce.push(kind);
        self
    }

    #[must_use]
    pub fn build(self) -> MockNegotiatorFactory {
        MockNegotiatorFactory {
            options: self.options,
            log: Arc::new(NegotiatorLog::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct CountingListener {
        connects: AtomicUsize,
    }

    #[async_trait]
    impl PipeListener for CountingListener {
        async fn on_connect(&self, _dtls: DtlsParameters) -> Result<(), NegotiatorError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn on_produce(
            &self,
            _kind: MediaKind,
            _rtp: RtpParameters,
        ) -> Result<ProducerId, NegotiatorError> {
            Ok(ProducerId::new("server-id"))
        }
    }

    fn options(id: &str) -> TransportOptions {
        serde_json::from_value(json!({ "id": id })).unwrap()
    }

    #[tokio::test]
    async fn test_pipes_require_loaded_capabilities() {
        let factory = MockNegotiatorFactory::default();
        let negotiator = factory.create();
        let listener = Arc::new(CountingListener::default());

        assert!(negotiator
            .create_send_pipe(options("s1"), listener.clone())
            .await
            .is_err());

        negotiator.load(RtpCapabilities::default()).await.unwrap();
        assert!(negotiator
            .create_send_pipe(options("s1"), listener)
            .await
            .is_ok());
        assert_eq!(factory.log().pipes_created(), 1);
    }

    #[tokio::test]
    async fn test_connect_raised_once_before_first_consume() {
        let factory = MockNegotiatorFactory::default();
        let negotiator = factory.create();
        negotiator.load(RtpCapabilities::default()).await.unwrap();
        let listener = Arc::new(CountingListener::default());

        let pipe = negotiator
            .create_recv_pipe(options("r1"), listener.clone())
            .await
            .unwrap();
        assert_eq!(pipe.connection_state(), PipeState::New);

        for producer in ["p1", "p2"] {
            let consumer = pipe
                .consume(ConsumerOptions {
                    id: ConsumerId::new(format!("c-{producer}")),
                    producer_id: ProducerId::new(producer),
                    kind: MediaKind::Video,
                    rtp_parameters: RtpParameters::default(),
                })
                .await
                .unwrap();
            assert_eq!(consumer.track().producer_id.as_str(), producer);
        }

        assert_eq!(listener.connects.load(Ordering::SeqCst), 1);
        assert_eq!(pipe.connection_state(), PipeState::Connected);
    }

    #[tokio::test]
    async fn test_close_marks_record() {
        let factory = MockNegotiatorFactory::default();
        let negotiator = factory.create();
        negotiator.load(RtpCapabilities::default()).await.unwrap();

        let pipe = negotiator
            .create_send_pipe(options("s1"), Arc::new(CountingListener::default()))
            .await
            .unwrap();
        assert_eq!(factory.log().open_pipes(), 1);

        pipe.close();
        assert_eq!(factory.log().open_pipes(), 0);
        assert!(pipe.is_closed());
    }

    #[tokio::test]
    async fn test_fail_load() {
        let factory = MockNegotiatorFactory::builder().fail_load("bad caps").build();
        let negotiator = factory.create();

        let err = negotiator.load(RtpCapabilities::default()).await.unwrap_err();
        assert_eq!(err, NegotiatorError::Load("bad caps".to_string()));
        assert!(!negotiator.is_loaded());
    }
}
