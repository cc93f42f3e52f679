//! ADS session: one TCP connection, one background IO driver, responses
//! correlated to callers by invoke id.
//!
//! The driver task exclusively owns the framed socket, the inflight table and
//! the timeout wheel. Callers hand it fully built frames through a bounded
//! request channel and suspend on a oneshot until their slot resolves.
//! Arbitrarily many requests may be outstanding; notification frames bypass
//! the table and flow to the notification engine channel.

mod state;
pub use state::{SessionConfig, SessionEvent, SessionLifecycleState};

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use futures::{pin_mut, SinkExt, Stream, StreamExt};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::select;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::sleep;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::codec::AmsTcpCodec;
use super::command::CommandId;
use super::error::{Error, Result};
use super::frame::{AmsFrame, AmsHeader};
use super::types::AmsAddr;

/// Request message handed to the IO driver.
#[derive(Debug)]
pub struct SessionRequest {
    /// Fully built frame; the invoke id is already in the header.
    pub frame: AmsFrame,
    /// Per-request deadline.
    pub timeout: Duration,
    /// Response channel resolved by the driver.
    pub response_tx: oneshot::Sender<Result<AmsFrame>>,
    /// Concurrency permit held for the lifetime of this request.
    pub permit: OwnedSemaphorePermit,
}

/// Entry stored for each inflight request.
///
/// Holding this struct implies one concurrency slot is taken from the
/// session semaphore; dropping it (on response, timeout, send failure or
/// teardown) releases the slot via RAII.
#[derive(Debug)]
struct InflightEntry {
    tx: oneshot::Sender<Result<AmsFrame>>,
    _permit: OwnedSemaphorePermit,
}

/// ADS session runtime state and request entry point.
#[derive(Debug)]
pub struct Session {
    /// Session configuration.
    config: Arc<SessionConfig>,
    /// Request channel towards the IO driver; `None` while not connected.
    request_tx: Arc<ArcSwapOption<mpsc::Sender<SessionRequest>>>,
    /// Cancellation token for cooperative shutdown.
    cancel: CancellationToken,
    /// Events broadcaster.
    events_tx: broadcast::Sender<SessionEvent>,
    /// Lifecycle watch channel (tx side).
    lifecycle_tx: watch::Sender<SessionLifecycleState>,
    /// Lifecycle watch channel (rx side).
    lifecycle_rx: watch::Receiver<SessionLifecycleState>,
    /// Back-pressure gate for concurrent requests.
    request_semaphore: Arc<Semaphore>,
    /// Monotonic invoke id generator, wraps around inside [1..=u32::MAX].
    invoke_counter: AtomicU32,
    /// Inbound notification frames, handed to the notification engine. The
    /// sender side is taken by the IO driver so the channel closes with it.
    notification_tx: Mutex<Option<mpsc::Sender<AmsFrame>>>,
    notification_rx: Mutex<Option<mpsc::Receiver<AmsFrame>>>,
}

impl Session {
    fn new(config: Arc<SessionConfig>, cancel: CancellationToken) -> Arc<Self> {
        let request_tx: Arc<ArcSwapOption<mpsc::Sender<SessionRequest>>> =
            Arc::new(ArcSwapOption::from(None));
        let (events_tx, _rx_unused) = broadcast::channel::<SessionEvent>(1024);
        let (lifecycle_tx, lifecycle_rx) = watch::channel(SessionLifecycleState::Idle);
        let (notification_tx, notification_rx) =
            mpsc::channel(config.notification_queue_capacity.max(1));
        let permits = config.max_concurrent_requests.max(1);

        Arc::new(Session {
            config,
            request_tx,
            cancel,
            events_tx,
            lifecycle_tx,
            lifecycle_rx,
            request_semaphore: Arc::new(Semaphore::new(permits)),
            invoke_counter: AtomicU32::new(0),
            notification_tx: Mutex::new(Some(notification_tx)),
            notification_rx: Mutex::new(Some(notification_rx)),
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Subscribe to session events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events_tx.subscribe()
    }

    /// Get a lifecycle watch receiver clone.
    pub fn lifecycle(&self) -> watch::Receiver<SessionLifecycleState> {
        self.lifecycle_rx.clone()
    }

    /// Get the current lifecycle state.
    #[inline]
    pub fn current_lifecycle(&self) -> SessionLifecycleState {
        *self.lifecycle_rx.borrow()
    }

    /// Whether the session currently accepts requests.
    #[inline]
    pub fn is_active(&self) -> bool {
        matches!(self.current_lifecycle(), SessionLifecycleState::Active)
    }

    /// Take the inbound notification frame receiver. The notification engine
    /// claims it exactly once; later calls return `None`.
    pub async fn take_notification_receiver(&self) -> Option<mpsc::Receiver<AmsFrame>> {
        self.notification_rx.lock().await.take()
    }

    /// Graceful shutdown: cancels the driver and wakes pending acquirers.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.request_semaphore.close();
    }

    /// Wait until the session is Active. Returns false when it lands in
    /// Closed or Failed instead.
    pub async fn wait_for_active(&self) -> bool {
        if self.is_active() {
            return true;
        }
        let mut rx = self.lifecycle();
        rx.wait_for(|s| {
            matches!(
                *s,
                SessionLifecycleState::Active
                    | SessionLifecycleState::Closed
                    | SessionLifecycleState::Failed
            )
        })
        .await
        .map(|s| matches!(*s, SessionLifecycleState::Active))
        .unwrap_or(false)
    }

    /// Allocate the next invoke id, skipping 0 on wrap.
    #[inline]
    fn next_invoke_id(&self) -> u32 {
        loop {
            let id = self.invoke_counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if id != 0 {
                return id;
            }
        }
    }

    /// Issue one command at `target` and await the matching response frame.
    ///
    /// Builds the header, allocates the invoke id, registers a response slot
    /// with the driver and suspends until the slot resolves. Dropping the
    /// returned future abandons the slot; a late response is then discarded
    /// by the driver rather than delivered to a newer requester.
    pub async fn request(
        &self,
        target: AmsAddr,
        command: CommandId,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<AmsFrame> {
        if !self.is_active() {
            return Err(Error::ConnectionClosed);
        }

        let permit = self
            .request_semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::ConnectionClosed)?;

        let invoke_id = self.next_invoke_id();
        let header = AmsHeader::request(
            target,
            self.config.local_addr,
            command,
            payload.len(),
            invoke_id,
        );
        let frame = AmsFrame::new(header, payload);

        let (tx, rx) = oneshot::channel();
        let req = SessionRequest {
            frame,
            timeout,
            response_tx: tx,
            permit,
        };

        let sender = self
            .request_tx
            .load_full()
            .ok_or(Error::ConnectionClosed)?;
        sender.send(req).await.map_err(|_| Error::ConnectionClosed)?;

        match rx.await {
            Ok(result) => result,
            // Driver dropped the slot without resolving it: teardown.
            Err(_) => Err(Error::ConnectionLost),
        }
    }

    /// [`Session::request`] with the default unary timeout.
    pub async fn request_default(
        &self,
        target: AmsAddr,
        command: CommandId,
        payload: Bytes,
    ) -> Result<AmsFrame> {
        self.request(target, command, payload, self.config.request_timeout)
            .await
    }
}

/// Session event loop facade; drives the connection when entered.
#[derive(Debug)]
pub struct SessionEventLoop {
    session: Arc<Session>,
    inner_cancel: CancellationToken,
    config: Arc<SessionConfig>,
    pre_connected: Option<TcpStream>,
}

impl SessionEventLoop {
    /// Enter and get a stream of session events.
    pub fn enter(self) -> impl Stream<Item = SessionEvent> {
        let session = Arc::clone(&self.session);
        let events_rx = session.subscribe_events();

        let cancel = self.inner_cancel.child_token();
        let config = Arc::clone(&self.config);
        let pre = self.pre_connected;
        tokio::spawn(async move {
            if let Some(stream) = pre {
                run_connection_with_stream(session, stream, config, cancel).await;
            } else {
                run_connection(session, config, cancel).await;
            }
        });

        futures::stream::unfold(events_rx, |mut rx| async move {
            match rx.recv().await {
                Ok(ev) => Some((ev, rx)),
                Err(_) => None,
            }
        })
    }

    /// Drain the event stream (utility).
    pub async fn run(self) {
        let s = self.enter();
        pin_mut!(s);
        while let Some(_ev) = s.next().await {}
    }

    /// Spawn a background task to drain the event stream.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Cancel the connection.
    pub fn cancel(&self) {
        self.inner_cancel.cancel();
    }
}

/// Create a session and its event loop.
pub fn create(config: SessionConfig) -> (Arc<Session>, SessionEventLoop) {
    let cancel = CancellationToken::new();
    let config = Arc::new(config);
    let session = Session::new(Arc::clone(&config), cancel.clone());
    let ev = SessionEventLoop {
        session: Arc::clone(&session),
        inner_cancel: cancel,
        config,
        pre_connected: None,
    };
    (session, ev)
}

/// Create a session over a pre-connected stream (tests, custom dialing).
pub fn create_with_stream(
    config: SessionConfig,
    stream: TcpStream,
) -> (Arc<Session>, SessionEventLoop) {
    let cancel = CancellationToken::new();
    let config = Arc::new(config);
    let session = Session::new(Arc::clone(&config), cancel.clone());
    let ev = SessionEventLoop {
        session: Arc::clone(&session),
        inner_cancel: cancel,
        config,
        pre_connected: Some(stream),
    };
    (session, ev)
}

/// Connection driver: establish the transport, then run the IO loop.
async fn run_connection(
    session: Arc<Session>,
    config: Arc<SessionConfig>,
    cancel: CancellationToken,
) {
    publish_lifecycle(
        &session.events_tx,
        &session.lifecycle_tx,
        SessionLifecycleState::Connecting,
    );
    let stream = match tokio::time::timeout(
        config.connect_timeout,
        TcpStream::connect(config.socket_addr),
    )
    .await
    {
        Ok(Ok(s)) => s,
        _ => {
            publish_lifecycle(
                &session.events_tx,
                &session.lifecycle_tx,
                SessionLifecycleState::Failed,
            );
            return;
        }
    };
    run_connection_with_stream(session, stream, config, cancel).await;
}

/// IO loop over an established stream.
async fn run_connection_with_stream(
    session: Arc<Session>,
    stream: TcpStream,
    config: Arc<SessionConfig>,
    cancel: CancellationToken,
) {
    if let Err(e) = stream.set_nodelay(config.tcp_nodelay) {
        warn!(error = %e, "set TCP_NODELAY failed");
    }
    let mut framed = Framed::new(stream, AmsTcpCodec);

    let (request_tx, mut request_rx) = mpsc::channel(config.send_queue_capacity);
    session.request_tx.store(Some(Arc::new(request_tx)));

    let events_tx = session.events_tx.clone();
    let lifecycle_tx = session.lifecycle_tx.clone();
    // Owning the sender ties the engine's channel lifetime to this driver:
    // when the loop exits, subscribers observe the end of their streams.
    let notification_tx = session.notification_tx.lock().await.take();

    let mut inflight: HashMap<u32, InflightEntry> = HashMap::with_capacity(64);
    let mut timeouts = BTreeMap::<Instant, Vec<u32>>::new();
    // Reusable sleep, reset to the nearest deadline each iteration.
    let mut deadline_sleep = Box::pin(sleep(Duration::from_millis(3_600_000)));

    // No handshake in ADS; the TCP connect is the whole establishment.
    publish_lifecycle(&events_tx, &lifecycle_tx, SessionLifecycleState::Active);

    loop {
        if let Some(dl) = timeouts.keys().next().cloned() {
            deadline_sleep
                .as_mut()
                .reset(tokio::time::Instant::from_std(dl));
        } else {
            let far = tokio::time::Instant::now() + Duration::from_millis(3_600_000);
            deadline_sleep.as_mut().reset(far);
        }
        select! {
            _ = cancel.cancelled() => {
                publish_lifecycle(&events_tx, &lifecycle_tx, SessionLifecycleState::Closing);
                break;
            }
            req = request_rx.recv() => {
                match req {
                    Some(request) => {
                        let (invoke_id, frame) = register_inflight_request(
                            request,
                            &mut inflight,
                            &mut timeouts,
                        );
                        if let Err(e) = framed.send(frame).await {
                            warn!(error = %e, invoke_id, "frame write failed");
                            handle_send_failure(invoke_id, &mut inflight);
                            let _ = events_tx.send(SessionEvent::TransportError);
                            break;
                        }
                    }
                    None => break,
                }
            }
            incoming = framed.next() => {
                match incoming {
                    Some(Ok(frame)) => {
                        handle_incoming_frame(
                            frame,
                            &mut inflight,
                            &notification_tx,
                            &events_tx,
                        );
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "receive loop frame error, closing");
                        let _ = events_tx.send(SessionEvent::TransportError);
                        break;
                    }
                    None => {
                        debug!("peer closed the connection");
                        let _ = events_tx.send(SessionEvent::TransportError);
                        break;
                    }
                }
            }
            _ = &mut deadline_sleep => {
                handle_request_timeouts(&mut timeouts, &mut inflight);
            }
        }
    }

    // Teardown: every pending slot resolves with ConnectionLost, new requests
    // fail fast, the notification engine sees its channel close.
    session.request_tx.store(None);
    session.request_semaphore.close();
    for (_, entry) in inflight.drain() {
        let _ = entry.tx.send(Err(Error::ConnectionLost));
    }
    match session.current_lifecycle() {
        SessionLifecycleState::Closing | SessionLifecycleState::Closed => {}
        _ => {
            publish_lifecycle(&events_tx, &lifecycle_tx, SessionLifecycleState::Closing);
        }
    }
    let _ = framed.close().await;
    publish_lifecycle(&events_tx, &lifecycle_tx, SessionLifecycleState::Closed);
}

/// Track a request in the inflight table and the timeout wheel.
#[inline]
fn register_inflight_request(
    request: SessionRequest,
    inflight: &mut HashMap<u32, InflightEntry>,
    timeouts: &mut BTreeMap<Instant, Vec<u32>>,
) -> (u32, AmsFrame) {
    let SessionRequest {
        frame,
        timeout,
        response_tx,
        permit,
    } = request;
    let invoke_id = frame.header.invoke_id;

    if inflight
        .insert(
            invoke_id,
            InflightEntry {
                tx: response_tx,
                _permit: permit,
            },
        )
        .is_some()
    {
        // Wrap-around collision within one session would need 2^32 inflight
        // requests; treat as a protocol bug.
        warn!(invoke_id, "invoke id collision in inflight table");
    }
    timeouts.entry(Instant::now() + timeout).or_default().push(invoke_id);
    (invoke_id, frame)
}

/// Resolve a send failure by completing the slot with ConnectionLost.
#[inline]
fn handle_send_failure(invoke_id: u32, inflight: &mut HashMap<u32, InflightEntry>) {
    if let Some(entry) = inflight.remove(&invoke_id) {
        let _ = entry.tx.send(Err(Error::ConnectionLost));
    }
}

/// Route one inbound frame: notifications to the engine, responses to their
/// slot, anything else to a diagnostic.
#[inline]
fn handle_incoming_frame(
    frame: AmsFrame,
    inflight: &mut HashMap<u32, InflightEntry>,
    notification_tx: &Option<mpsc::Sender<AmsFrame>>,
    events_tx: &broadcast::Sender<SessionEvent>,
) {
    if frame.header.command == CommandId::DeviceNotification {
        if frame.header.error_code != 0 {
            // Unsolicited frame, nobody is owed a failure for it.
            warn!(
                error_code = frame.header.error_code,
                "notification frame carries an error code, dropping"
            );
            return;
        }
        match notification_tx {
            Some(tx) => {
                if tx.try_send(frame).is_err() {
                    let _ = events_tx.send(SessionEvent::NotificationQueueFull);
                }
            }
            None => {
                let _ = events_tx.send(SessionEvent::NotificationQueueFull);
            }
        }
        return;
    }
    if !frame.header.state_flags.is_response() {
        warn!(
            command = ?frame.header.command,
            "unexpected non-response frame from peer, dropping"
        );
        return;
    }
    match inflight.remove(&frame.header.invoke_id) {
        Some(entry) => {
            // A dropped receiver (cancelled caller) makes this send fail;
            // the response is then discarded, which is the contract.
            let _ = entry.tx.send(Ok(frame));
        }
        None => {
            // Timed out or cancelled earlier; the slot is gone on purpose.
            debug!(invoke_id = frame.header.invoke_id, "orphan response discarded");
            let _ = events_tx.send(SessionEvent::OrphanResponse);
        }
    }
}

/// Fail every inflight request whose deadline has passed.
#[inline]
fn handle_request_timeouts(
    timeouts: &mut BTreeMap<Instant, Vec<u32>>,
    inflight: &mut HashMap<u32, InflightEntry>,
) {
    let now = Instant::now();
    let expired: Vec<Instant> = timeouts.keys().take_while(|d| **d <= now).cloned().collect();
    for deadline in expired {
        if let Some(ids) = timeouts.remove(&deadline) {
            for invoke_id in ids {
                if let Some(entry) = inflight.remove(&invoke_id) {
                    let _ = entry.tx.send(Err(Error::RequestTimeout));
                }
            }
        }
    }
}

#[inline]
fn publish_lifecycle(
    events_tx: &broadcast::Sender<SessionEvent>,
    lifecycle_tx: &watch::Sender<SessionLifecycleState>,
    state: SessionLifecycleState,
) {
    let _ = events_tx.send(SessionEvent::LifecycleChanged(state));
    let _ = lifecycle_tx.send(state);
}
