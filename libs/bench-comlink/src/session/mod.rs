//! Device sessions
//!
//! [`SessionCore`] carries everything the two instrument sessions share: the
//! dispatcher, the watchdog, the poll loop and the notification channel. The
//! device modules add their codec and business operations on top.

pub mod load;
pub mod vdc;

pub use load::LoadSession;
pub use vdc::VdcSession;

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::Channel;
use crate::config::SessionConfig;
use crate::dispatcher::{Dispatcher, RequestOrigin};
use crate::error::{LinkError, Result};
use crate::watchdog::Watchdog;

const EVENT_CAPACITY: usize = 64;

/// Notifications published by a session
#[derive(Debug, Clone)]
pub enum SessionEvent<S> {
    /// Handshake passed; the value is the device's version string
    Connected { endpoint: String, version: String },
    Disconnected,
    DataUpdated(Arc<S>),
    /// A poll tick failed; polling continues
    PollFailed(String),
    /// The device reported a fault condition
    Fault(String),
    /// The link broke; polling and the watchdog have been stopped
    ConnectionLost(String),
    WatchdogTimeout { elapsed: Duration, message: String },
}

/// Reads one full snapshot of a device
#[async_trait]
pub trait SnapshotReader: Send + Sync + 'static {
    type Snapshot: Clone + Send + Sync + 'static;

    async fn read_snapshot(
        &self,
        origin: RequestOrigin,
        cancel: &CancellationToken,
    ) -> Result<Self::Snapshot>;
}

/// Clears the in-flight flag however the poll ends
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        if flag.swap(true, Ordering::SeqCst) {
            None
        } else {
            Some(Self(flag))
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

struct PollTask {
    cancel: CancellationToken,
    _handle: JoinHandle<()>,
}

pub struct SessionCore<S> {
    name: &'static str,
    config: SessionConfig,
    dispatcher: Dispatcher,
    watchdog: Watchdog,
    events: broadcast::Sender<SessionEvent<S>>,
    latest: RwLock<Option<Arc<S>>>,
    poll_task: Mutex<Option<PollTask>>,
    poll_in_flight: AtomicBool,
}

impl<S> std::fmt::Debug for SessionCore<S>
where
    S: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCore")
            .field("name", &self.name)
            .field("connected", &self.dispatcher.is_connected())
            .field("polling", &self.is_polling())
            .finish()
    }
}

impl<S> SessionCore<S>
where
    S: Clone + Send + Sync + 'static,
{
    pub fn new(name: &'static str, config: SessionConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Arc::new_cyclic(|weak: &Weak<Self>| {
            let lost = weak.clone();
            let dispatcher = Dispatcher::new(
                name,
                Arc::new(move |err: &LinkError| {
                    if let Some(core) = lost.upgrade() {
                        core.handle_connection_lost(err);
                    }
                }),
            );

            let timeout_events = events.clone();
            let watchdog = Watchdog::new(
                name,
                config.watchdog_timeout(),
                config.watchdog_check_interval(),
                Arc::new(move |elapsed| {
                    let _ = timeout_events.send(SessionEvent::WatchdogTimeout {
                        elapsed,
                        message: Watchdog::timeout_message(elapsed),
                    });
                }),
            );

            Self {
                name,
                config,
                dispatcher,
                watchdog,
                events,
                latest: RwLock::new(None),
                poll_task: Mutex::new(None),
                poll_in_flight: AtomicBool::new(false),
            }
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn watchdog(&self) -> &Watchdog {
        &self.watchdog
    }

    pub fn is_connected(&self) -> bool {
        self.dispatcher.is_connected()
    }

    pub fn is_polling(&self) -> bool {
        self.poll_task.lock().is_some()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent<S>> {
        self.events.subscribe()
    }

    pub fn latest(&self) -> Option<Arc<S>> {
        self.latest.read().clone()
    }

    pub fn emit(&self, event: SessionEvent<S>) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    /// Open `channel`, probe the device and start supervision
    ///
    /// A failed probe closes the channel again so the session never stays
    /// connected without a verified device behind it.
    pub async fn establish<R, H, Fut>(
        self: &Arc<Self>,
        channel: Box<dyn Channel>,
        reader: Weak<R>,
        handshake: H,
        cancel: &CancellationToken,
    ) -> Result<String>
    where
        R: SnapshotReader<Snapshot = S>,
        H: FnOnce() -> Fut,
        Fut: Future<Output = Result<String>>,
    {
        self.config.validate()?;
        self.disconnect().await;

        let endpoint = channel.endpoint();
        self.dispatcher.open(channel, cancel).await?;

        let version = match handshake().await {
            Ok(version) => version,
            Err(e) => {
                self.dispatcher.close().await;
                warn!("[CONNECT] {}: handshake failed on {}: {}", self.name, endpoint, e);
                return Err(match e {
                    LinkError::Cancelled => LinkError::Cancelled,
                    other => LinkError::Handshake(format!(
                        "{} at {} did not answer: {}",
                        self.name, endpoint, other
                    )),
                });
            },
        };

        info!("[CONNECT] {}: {} version {}", self.name, endpoint, version);
        self.emit(SessionEvent::Connected {
            endpoint,
            version: version.clone(),
        });
        self.start_polling(reader);
        Ok(version)
    }

    /// Start the watchdog and the periodic poll loop
    pub fn start_polling<R>(self: &Arc<Self>, reader: Weak<R>)
    where
        R: SnapshotReader<Snapshot = S>,
    {
        self.stop_polling();
        self.watchdog.start();

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(poll_loop(
            Arc::downgrade(self),
            reader,
            self.config.poll_interval(),
            cancel.clone(),
        ));
        *self.poll_task.lock() = Some(PollTask {
            cancel,
            _handle: handle,
        });
        debug!("{} polling every {:?}", self.name, self.config.poll_interval());
    }

    /// Stop the poll loop and the watchdog together
    pub fn stop_polling(&self) {
        if let Some(task) = self.poll_task.lock().take() {
            task.cancel.cancel();
            debug!("{} polling stopped", self.name);
        }
        self.watchdog.stop();
    }

    /// Stop supervision and close the channel; best effort
    pub async fn disconnect(&self) {
        self.stop_polling();
        let was_connected = self.dispatcher.is_connected();
        self.dispatcher.close().await;
        if was_connected {
            self.emit(SessionEvent::Disconnected);
        }
    }

    fn handle_connection_lost(&self, err: &LinkError) {
        self.stop_polling();
        warn!("[STATUS] {}: polling stopped after link loss", self.name);
        self.emit(SessionEvent::ConnectionLost(err.to_string()));
    }

    /// Run one poll unless one is already in flight or the link is down
    ///
    /// Returns `Ok(None)` when the tick was skipped.
    pub async fn poll_once<R>(
        &self,
        reader: &R,
        origin: RequestOrigin,
        cancel: &CancellationToken,
    ) -> Result<Option<Arc<S>>>
    where
        R: SnapshotReader<Snapshot = S>,
    {
        if !self.dispatcher.is_connected() {
            return Ok(None);
        }
        let Some(_in_flight) = InFlight::acquire(&self.poll_in_flight) else {
            debug!("{} poll skipped: previous poll in flight", self.name);
            return Ok(None);
        };

        let result = reader.read_snapshot(origin, cancel).await;

        match result {
            Ok(snapshot) => {
                self.watchdog.feed();
                let snapshot = Arc::new(snapshot);
                *self.latest.write() = Some(Arc::clone(&snapshot));
                self.emit(SessionEvent::DataUpdated(Arc::clone(&snapshot)));
                Ok(Some(snapshot))
            },
            Err(e) => {
                if !e.is_cancelled() && self.dispatcher.is_connected() {
                    debug!("{} poll failed: {}", self.name, e);
                    self.emit(SessionEvent::PollFailed(e.to_string()));
                }
                Err(e)
            },
        }
    }
}

async fn poll_loop<S, R>(
    core: Weak<SessionCore<S>>,
    reader: Weak<R>,
    interval: Duration,
    cancel: CancellationToken,
) where
    S: Clone + Send + Sync + 'static,
    R: SnapshotReader<Snapshot = S>,
{
    // first poll one period after connect
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {},
        }
        let (Some(core), Some(reader)) = (core.upgrade(), reader.upgrade()) else {
            break;
        };
        // failures are reported as events; the loop keeps going
        let _ = core
            .poll_once(reader.as_ref(), RequestOrigin::Poll, &cancel)
            .await;
    }
}
