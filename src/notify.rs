//! Device notification engine.
//!
//! The session forwards every inbound notification frame to one engine task.
//! The task walks the stream into `(handle, timestamp, bytes)` samples and
//! appends them to a bounded per-handle buffer; a flush tick drains the
//! buffers into the subscribers' channels. Value decoding happens at the
//! subscriber, on read, so one malformed sample cannot stall other handles.
//! When a buffer outruns its cap the oldest samples are dropped and the
//! subscriber sees the overflow on its next read.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tokio::sync::{mpsc, Mutex};
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::client::{Client, NotificationRequest};
use crate::protocol::error::{Error, Result};
use crate::protocol::frame::notification::NotificationStream;
use crate::protocol::frame::AmsFrame;
use crate::protocol::index;
use crate::protocol::types::TransmissionMode;
use crate::symbols::Symbol;

/// Transmission policy of a subscription, in wall-clock units.
#[derive(Clone, Copy, Debug)]
pub struct NotificationAttributes {
    pub mode: TransmissionMode,
    /// Longest time the server may sit on a pending sample.
    pub max_delay: Duration,
    /// Server-side check or push period.
    pub cycle_time: Duration,
}

impl NotificationAttributes {
    /// Cyclic server push at the given period.
    pub fn server_cycle(cycle_time: Duration) -> Self {
        Self {
            mode: TransmissionMode::ServerCycle,
            max_delay: Duration::ZERO,
            cycle_time,
        }
    }

    /// Push on change, checked at the given period.
    pub fn on_change(cycle_time: Duration) -> Self {
        Self {
            mode: TransmissionMode::ServerOnChange,
            max_delay: Duration::ZERO,
            cycle_time,
        }
    }
}

/// One delivered sample of a subscribed symbol.
#[derive(Clone, Debug)]
pub struct Sample {
    /// Server timestamp of the containing stamp.
    pub timestamp: DateTime<Utc>,
    /// Raw value bytes; decode under the symbol's datatype.
    pub data: Bytes,
}

/// Tuning of the engine task.
#[derive(Clone, Copy, Debug)]
pub struct NotificationEngineConfig {
    /// Period of the buffer flush towards subscribers.
    pub flush_interval: Duration,
    /// Per-handle sample buffer cap; the oldest samples fall out first.
    pub buffer_capacity: usize,
    /// Depth of each subscriber's delivery channel.
    pub channel_capacity: usize,
}

impl Default for NotificationEngineConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_millis(500),
            buffer_capacity: 1024,
            channel_capacity: 256,
        }
    }
}

/// Receiving end of one active subscription.
#[derive(Debug)]
pub struct Subscription {
    /// Server-assigned notification handle.
    pub handle: u32,
    /// Name of the subscribed symbol.
    pub symbol_name: String,
    receiver: mpsc::Receiver<Sample>,
    overflow: Arc<AtomicU64>,
    overflow_seen: u64,
}

impl Subscription {
    /// Await the next sample in server order.
    ///
    /// Returns `Ok(None)` once the subscription is cancelled or the
    /// connection is lost. An overflow since the previous call surfaces as
    /// [`Error::NotificationOverflow`] before any further sample.
    pub async fn recv(&mut self) -> Result<Option<Sample>> {
        let dropped_total = self.overflow.load(Ordering::Relaxed);
        if dropped_total > self.overflow_seen {
            let dropped = dropped_total - self.overflow_seen;
            self.overflow_seen = dropped_total;
            return Err(Error::NotificationOverflow {
                handle: self.handle,
                dropped,
            });
        }
        Ok(self.receiver.recv().await)
    }

    /// Next sample if one is already buffered.
    pub fn try_recv(&mut self) -> Option<Sample> {
        self.receiver.try_recv().ok()
    }

    /// Total samples dropped on this handle since subscribing.
    pub fn overflow_count(&self) -> u64 {
        self.overflow.load(Ordering::Relaxed)
    }
}

enum EngineCommand {
    Register {
        handle: u32,
        sender: mpsc::Sender<Sample>,
        overflow: Arc<AtomicU64>,
    },
    Unregister {
        handle: u32,
    },
}

struct HandleBuffer {
    queue: VecDeque<Sample>,
    sender: mpsc::Sender<Sample>,
    overflow: Arc<AtomicU64>,
}

/// Notification subscription manager over one connection.
///
/// Owns the engine task and the server-side bookkeeping: subscribing resolves
/// the symbol's name handle, registers the notification and wires the local
/// delivery channel; cancelling removes both sides.
#[derive(Debug)]
pub struct NotificationEngine {
    client: Client,
    config: NotificationEngineConfig,
    control_tx: mpsc::Sender<EngineCommand>,
    /// Active handles and the symbol names behind them.
    active: Mutex<HashMap<u32, String>>,
}

impl NotificationEngine {
    /// Claim the session's notification receiver and spawn the engine task.
    ///
    /// Panics if the receiver was already claimed; one engine per session.
    pub async fn start(client: Client, config: NotificationEngineConfig) -> Self {
        let frames = client
            .session()
            .take_notification_receiver()
            .await
            .expect("session notification receiver already claimed");
        let (control_tx, control_rx) = mpsc::channel(64);
        tokio::spawn(run_engine(frames, control_rx, config));
        Self {
            client,
            config,
            control_tx,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribe to value changes of `symbol`.
    ///
    /// The symbol's name is resolved to a handle and the notification is
    /// registered against the by-handle value service, so the subscription
    /// survives online changes of the process image layout.
    pub async fn subscribe(
        &self,
        symbol: &Symbol,
        attrs: NotificationAttributes,
    ) -> Result<Subscription> {
        let name_handle = self.client.handle_by_name(&symbol.name).await?;
        let handle = self
            .client
            .add_device_notification(
                self.client.target(),
                NotificationRequest {
                    group: index::SYM_VALUE_BY_HANDLE,
                    offset: name_handle,
                    length: symbol.byte_len(),
                    mode: attrs.mode,
                    max_delay: attrs.max_delay,
                    cycle_time: attrs.cycle_time,
                },
            )
            .await?;

        let (sender, receiver) = mpsc::channel(self.config.channel_capacity.max(1));
        let overflow = Arc::new(AtomicU64::new(0));
        self.control_tx
            .send(EngineCommand::Register {
                handle,
                sender,
                overflow: Arc::clone(&overflow),
            })
            .await
            .map_err(|_| Error::ConnectionLost)?;
        self.active
            .lock()
            .await
            .insert(handle, symbol.name.clone());
        debug!(handle, symbol = %symbol.name, "notification subscribed");

        Ok(Subscription {
            handle,
            symbol_name: symbol.name.clone(),
            receiver,
            overflow,
            overflow_seen: 0,
        })
    }

    /// Cancel a subscription on both sides. Buffered samples for the handle
    /// are dropped with the local registration.
    pub async fn unsubscribe(&self, subscription: Subscription) -> Result<()> {
        let handle = subscription.handle;
        // Local removal first so samples stop flowing within one flush tick.
        let _ = self
            .control_tx
            .send(EngineCommand::Unregister { handle })
            .await;
        self.active.lock().await.remove(&handle);
        self.client
            .delete_device_notification(self.client.target(), handle)
            .await?;
        debug!(handle, symbol = %subscription.symbol_name, "notification cancelled");
        Ok(())
    }

    /// Number of currently active subscriptions.
    pub async fn active_count(&self) -> usize {
        self.active.lock().await.len()
    }

    /// Delete every active subscription from the server. Used on orderly
    /// shutdown; connection loss cleans up implicitly instead.
    pub async fn shutdown(&self) -> Result<()> {
        let handles: Vec<u32> = self.active.lock().await.keys().copied().collect();
        let mut failed = 0usize;
        for handle in handles {
            let _ = self
                .control_tx
                .send(EngineCommand::Unregister { handle })
                .await;
            self.active.lock().await.remove(&handle);
            if let Err(e) = self
                .client
                .delete_device_notification(self.client.target(), handle)
                .await
            {
                warn!(handle, error = %e, "delete notification failed on shutdown");
                failed += 1;
            }
        }
        if failed > 0 {
            info!(failed, "some notification deletions failed on shutdown");
        }
        Ok(())
    }
}

/// Engine task: demultiplex inbound frames, buffer per handle, flush on tick.
async fn run_engine(
    mut frames: mpsc::Receiver<AmsFrame>,
    mut control: mpsc::Receiver<EngineCommand>,
    config: NotificationEngineConfig,
) {
    let mut buffers: HashMap<u32, HandleBuffer> = HashMap::new();
    // First observed shape of each coalesced delivery stream, by invoke id.
    let mut templates: HashMap<u32, Vec<(u32, usize)>> = HashMap::new();
    let mut tick = interval(config.flush_interval);

    loop {
        select! {
            frame = frames.recv() => {
                match frame {
                    Some(frame) => {
                        ingest_frame(&frame, &mut buffers, &mut templates, &config);
                    }
                    None => {
                        // Session driver gone: close every delivery channel so
                        // subscribers observe the end of their streams.
                        debug!("session closed, shutting notification engine down");
                        buffers.clear();
                        break;
                    }
                }
            }
            command = control.recv() => {
                match command {
                    Some(EngineCommand::Register { handle, sender, overflow }) => {
                        buffers.insert(handle, HandleBuffer {
                            queue: VecDeque::new(),
                            sender,
                            overflow,
                        });
                        // Subscription changes reshape coalesced deliveries.
                        templates.clear();
                    }
                    Some(EngineCommand::Unregister { handle }) => {
                        buffers.remove(&handle);
                        templates.clear();
                    }
                    None => break,
                }
            }
            _ = tick.tick() => {
                flush_buffers(&mut buffers);
            }
        }
    }
}

/// Decode one notification frame into the per-handle buffers.
fn ingest_frame(
    frame: &AmsFrame,
    buffers: &mut HashMap<u32, HandleBuffer>,
    templates: &mut HashMap<u32, Vec<(u32, usize)>>,
    config: &NotificationEngineConfig,
) {
    let stream = match NotificationStream::decode(&frame.payload) {
        Ok(stream) => stream,
        Err(e) => {
            warn!(error = %e, "malformed notification stream dropped");
            return;
        }
    };

    // Coalesced deliveries repeat a fixed shape per invoke id; a deviation
    // means the server changed the stream mid-flight.
    let shape = stream.template();
    match templates.get(&frame.header.invoke_id) {
        None => {
            templates.insert(frame.header.invoke_id, shape);
        }
        Some(known) if *known != shape => {
            warn!(
                invoke_id = frame.header.invoke_id,
                "notification stream shape changed against its template"
            );
            templates.insert(frame.header.invoke_id, shape);
        }
        Some(_) => {}
    }

    for stamp in &stream.stamps {
        let timestamp = stamp.timestamp();
        for sample in &stamp.samples {
            let Some(buffer) = buffers.get_mut(&sample.handle) else {
                // Handle cancelled locally or never subscribed here.
                debug!(handle = sample.handle, "sample for unknown handle dropped");
                continue;
            };
            if buffer.queue.len() >= config.buffer_capacity {
                buffer.queue.pop_front();
                buffer.overflow.fetch_add(1, Ordering::Relaxed);
            }
            buffer.queue.push_back(Sample {
                timestamp,
                data: sample.data.clone(),
            });
        }
    }
}

/// Drain each buffer into its delivery channel, keeping what does not fit.
fn flush_buffers(buffers: &mut HashMap<u32, HandleBuffer>) {
    for buffer in buffers.values_mut() {
        while let Some(sample) = buffer.queue.front() {
            match buffer.sender.try_send(sample.clone()) {
                Ok(()) => {
                    buffer.queue.pop_front();
                }
                Err(mpsc::error::TrySendError::Full(_)) => break,
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    // Subscriber dropped its half; stop buffering for it.
                    buffer.queue.clear();
                    break;
                }
            }
        }
    }
}
