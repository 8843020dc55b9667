//! Process signal broker
//!
//! One broker per [`Runtime`](crate::runtime::Runtime) multiplexes OS
//! termination signals across every subscribed pool. The first signal fans
//! out graceful shutdown; any further signal escalates to forceful. Once
//! all subscribed pools have finished shutting down, the original signal is
//! re-raised with the default disposition restored so the process reports
//! the signal it was sent.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long graceful shutdown may run after the first signal before the
/// broker escalates to forceful shutdown on its own.
const GRACEFUL_ESCALATION_WINDOW: Duration = Duration::from_secs(5);

/// How long after forceful shutdown begins before the default signal
/// dispositions are restored, so a further signal kills the process
/// outright.
const HANDLER_REMOVAL_DELAY: Duration = Duration::from_secs(5);

/// Termination signals the broker handles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TermSignal {
    /// SIGTERM
    Term,
    /// SIGINT
    Int,
    /// SIGUSR2
    Usr2,
}

impl TermSignal {
    pub(crate) const ALL: [TermSignal; 3] = [Self::Term, Self::Int, Self::Usr2];

    /// Conventional signal name
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Term => "SIGTERM",
            Self::Int => "SIGINT",
            Self::Usr2 => "SIGUSR2",
        }
    }

    #[cfg(unix)]
    fn to_nix(self) -> nix::sys::signal::Signal {
        use nix::sys::signal::Signal;
        match self {
            Self::Term => Signal::SIGTERM,
            Self::Int => Signal::SIGINT,
            Self::Usr2 => Signal::SIGUSR2,
        }
    }
}

impl fmt::Display for TermSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Broker errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum BrokerError {
    /// A shutdown latch is already set; new pools cannot subscribe
    #[error("signal broker is already shutting down")]
    AlreadyShuttingDown,
}

/// Receives shutdown intents fanned out by the broker
#[async_trait]
pub trait ShutdownSink: Send + Sync {
    /// Begin graceful shutdown and complete when it is done.
    async fn graceful_shutdown(&self, message: String);

    /// Begin forceful shutdown and complete when it is done.
    async fn forceful_shutdown(&self, message: String);
}

/// Restores dispositions and re-raises signals.
///
/// Split out so the broker's escalation machinery can run under test
/// without killing the test process.
trait RaiseSignal: Send + Sync {
    fn restore_default(&self, sig: TermSignal);
    fn raise(&self, sig: TermSignal);
}

struct OsRaise;

#[cfg(unix)]
impl RaiseSignal for OsRaise {
    fn restore_default(&self, sig: TermSignal) {
        use nix::sys::signal::{signal, SigHandler};
        // Tokio's handler stays registered for the process lifetime;
        // without this the re-raised signal would be swallowed.
        unsafe {
            let _ = signal(sig.to_nix(), SigHandler::SigDfl);
        }
    }

    fn raise(&self, sig: TermSignal) {
        let _ = nix::sys::signal::raise(sig.to_nix());
    }
}

#[cfg(not(unix))]
impl RaiseSignal for OsRaise {
    fn restore_default(&self, _sig: TermSignal) {}

    fn raise(&self, _sig: TermSignal) {
        // No signal dispositions to restore; report an abnormal exit.
        std::process::exit(1);
    }
}

struct BrokerState {
    next_id: u64,
    sinks: HashMap<u64, Arc<dyn ShutdownSink>>,
    /// Cancelling this token stops the signal-listening task.
    installed: Option<CancellationToken>,
    shutting_down_gracefully: bool,
    shutting_down_forcefully: bool,
}

struct BrokerInner {
    state: Mutex<BrokerState>,
    raise: Arc<dyn RaiseSignal>,
}

/// Multiplexes OS termination signals across subscribed pools
///
/// Cloning is cheap and all clones share state. OS handlers are installed
/// by the first subscription and removed by the last, unless shutdown is
/// already in progress.
#[derive(Clone)]
pub struct SignalBroker {
    inner: Arc<BrokerInner>,
}

impl SignalBroker {
    pub(crate) fn new() -> Self {
        Self::with_raise(Arc::new(OsRaise))
    }

    fn with_raise(raise: Arc<dyn RaiseSignal>) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                state: Mutex::new(BrokerState {
                    next_id: 0,
                    sinks: HashMap::new(),
                    installed: None,
                    shutting_down_gracefully: false,
                    shutting_down_forcefully: false,
                }),
                raise,
            }),
        }
    }

    /// Register a sink for shutdown intents.
    ///
    /// The first subscription installs the OS handlers; later ones reuse
    /// them. Fails once either shutdown latch is set.
    pub fn subscribe(&self, sink: Arc<dyn ShutdownSink>) -> Result<SignalSubscription, BrokerError> {
        let id = {
            let mut state = self.inner.state.lock().unwrap();
            if state.shutting_down_gracefully || state.shutting_down_forcefully {
                return Err(BrokerError::AlreadyShuttingDown);
            }
            let id = state.next_id;
            state.next_id += 1;
            state.sinks.insert(id, sink);
            if state.installed.is_none() {
                let token = CancellationToken::new();
                state.installed = Some(token.clone());
                self.spawn_signal_task(token);
                debug!("installed signal handlers");
            }
            id
        };
        Ok(SignalSubscription {
            broker: self.clone(),
            id: Some(id),
        })
    }

    /// Number of live subscriptions
    pub fn ref_count(&self) -> usize {
        self.inner.state.lock().unwrap().sinks.len()
    }

    /// Whether the OS handlers are currently installed
    pub fn handlers_installed(&self) -> bool {
        self.inner.state.lock().unwrap().installed.is_some()
    }

    /// Whether the graceful latch has been set
    pub fn shutting_down_gracefully(&self) -> bool {
        self.inner.state.lock().unwrap().shutting_down_gracefully
    }

    /// Whether the forceful latch has been set
    pub fn shutting_down_forcefully(&self) -> bool {
        self.inner.state.lock().unwrap().shutting_down_forcefully
    }

    fn unsubscribe(&self, id: u64) {
        let uninstall = {
            let mut state = self.inner.state.lock().unwrap();
            state.sinks.remove(&id);
            if !state.sinks.is_empty() {
                return;
            }
            if state.shutting_down_gracefully || state.shutting_down_forcefully {
                warn!("shutdown in progress; leaving signal handlers installed");
                return;
            }
            state.installed.take()
        };
        if let Some(token) = uninstall {
            token.cancel();
            for sig in TermSignal::ALL {
                self.inner.raise.restore_default(sig);
            }
            debug!("removed signal handlers");
        }
    }

    fn spawn_signal_task(&self, uninstall: CancellationToken) {
        let broker = self.clone();
        tokio::spawn(async move {
            broker.signal_loop(uninstall).await;
        });
    }

    #[cfg(unix)]
    async fn signal_loop(self, uninstall: CancellationToken) {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                return;
            }
        };
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(stream) => stream,
            Err(e) => {
                error!(error = %e, "failed to install SIGINT handler");
                return;
            }
        };
        let mut sigusr2 = match signal(SignalKind::user_defined2()) {
            Ok(stream) => stream,
            Err(e) => {
                error!(error = %e, "failed to install SIGUSR2 handler");
                return;
            }
        };

        loop {
            let received = tokio::select! {
                _ = uninstall.cancelled() => return,
                _ = sigterm.recv() => TermSignal::Term,
                _ = sigint.recv() => TermSignal::Int,
                _ = sigusr2.recv() => TermSignal::Usr2,
            };
            self.on_signal(received);
        }
    }

    #[cfg(not(unix))]
    async fn signal_loop(self, uninstall: CancellationToken) {
        loop {
            tokio::select! {
                _ = uninstall.cancelled() => return,
                result = tokio::signal::ctrl_c() => {
                    if result.is_err() {
                        return;
                    }
                    self.on_signal(TermSignal::Int);
                }
            }
        }
    }

    /// React to one received (or injected) signal.
    fn on_signal(&self, sig: TermSignal) {
        let graceful_sinks = {
            let mut state = self.inner.state.lock().unwrap();
            if state.shutting_down_gracefully {
                None
            } else {
                state.shutting_down_gracefully = true;
                Some(state.sinks.values().cloned().collect::<Vec<_>>())
            }
        };

        let Some(sinks) = graceful_sinks else {
            // Any signal after the first escalates; a no-op once the
            // forceful latch is set.
            self.escalate_forceful(sig, "received another signal");
            return;
        };

        warn!(signal = %sig, "received signal; initiating graceful shutdown");
        let broker = self.clone();
        tokio::spawn(async move {
            // If graceful shutdown outlives the window, the broker
            // escalates on its own rather than waiting for a second
            // signal.
            let escalation = {
                let broker = broker.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(GRACEFUL_ESCALATION_WINDOW).await;
                    broker.escalate_forceful(sig, "graceful shutdown did not finish in time");
                })
            };

            let message = format!("worker shutdown due to {}", sig);
            join_all(sinks.iter().map(|sink| sink.graceful_shutdown(message.clone()))).await;
            escalation.abort();

            let forced = broker.inner.state.lock().unwrap().shutting_down_forcefully;
            if !forced {
                info!(signal = %sig, "graceful shutdown complete; re-raising signal");
                broker.uninstall_and_raise(sig);
            }
        });
    }

    /// Set the forceful latch and fan out forceful shutdown.
    ///
    /// Invoked by a second signal and by the escalation timer; whichever
    /// comes first wins and the other is a no-op.
    fn escalate_forceful(&self, sig: TermSignal, reason: &str) {
        let sinks = {
            let mut state = self.inner.state.lock().unwrap();
            if state.shutting_down_forcefully {
                debug!(signal = %sig, "forceful latch already set; ignoring");
                return;
            }
            state.shutting_down_forcefully = true;
            state.sinks.values().cloned().collect::<Vec<_>>()
        };

        warn!(signal = %sig, reason, "forcing shutdown");
        let broker = self.clone();
        tokio::spawn(async move {
            // Escape hatch: after the removal window a further signal
            // hits the default disposition and kills the process even if
            // a sink is wedged.
            let removal = {
                let broker = broker.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(HANDLER_REMOVAL_DELAY).await;
                    broker.uninstall();
                })
            };

            let message = format!("forced worker shutdown due to {}", sig);
            join_all(sinks.iter().map(|sink| sink.forceful_shutdown(message.clone()))).await;

            broker.uninstall_and_raise(sig);
            removal.abort();
        });
    }

    fn uninstall(&self) {
        let token = { self.inner.state.lock().unwrap().installed.take() };
        if let Some(token) = token {
            token.cancel();
        }
        for sig in TermSignal::ALL {
            self.inner.raise.restore_default(sig);
        }
    }

    fn uninstall_and_raise(&self, sig: TermSignal) {
        self.uninstall();
        self.inner.raise.raise(sig);
    }
}

/// A live broker subscription; releasing (or dropping) it removes the sink.
pub struct SignalSubscription {
    broker: SignalBroker,
    id: Option<u64>,
}

impl SignalSubscription {
    /// Remove the sink from the broker.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if let Some(id) = self.id.take() {
            self.broker.unsubscribe(id);
        }
    }
}

impl Drop for SignalSubscription {
    fn drop(&mut self) {
        self.release_inner();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::watch;

    struct RecordingRaise {
        raised: Mutex<Vec<TermSignal>>,
        restored: Mutex<Vec<TermSignal>>,
    }

    impl RecordingRaise {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                raised: Mutex::new(Vec::new()),
                restored: Mutex::new(Vec::new()),
            })
        }

        fn raised(&self) -> Vec<TermSignal> {
            self.raised.lock().unwrap().clone()
        }
    }

    impl RaiseSignal for RecordingRaise {
        fn restore_default(&self, sig: TermSignal) {
            self.restored.lock().unwrap().push(sig);
        }

        fn raise(&self, sig: TermSignal) {
            self.raised.lock().unwrap().push(sig);
        }
    }

    /// A sink whose graceful shutdown blocks until the gate opens.
    struct GatedSink {
        graceful_started: watch::Sender<bool>,
        gate: watch::Sender<bool>,
        forceful_calls: Mutex<u32>,
        graceful_calls: Mutex<u32>,
    }

    impl GatedSink {
        fn new(blocking: bool) -> Arc<Self> {
            let (graceful_started, _) = watch::channel(false);
            let (gate, _) = watch::channel(!blocking);
            Arc::new(Self {
                graceful_started,
                gate,
                forceful_calls: Mutex::new(0),
                graceful_calls: Mutex::new(0),
            })
        }

        fn open_gate(&self) {
            let _ = self.gate.send(true);
        }

        async fn wait_graceful_started(&self) {
            let mut rx = self.graceful_started.subscribe();
            while !*rx.borrow_and_update() {
                rx.changed().await.unwrap();
            }
        }
    }

    #[async_trait]
    impl ShutdownSink for GatedSink {
        async fn graceful_shutdown(&self, _message: String) {
            *self.graceful_calls.lock().unwrap() += 1;
            let _ = self.graceful_started.send(true);
            let mut rx = self.gate.subscribe();
            while !*rx.borrow_and_update() {
                rx.changed().await.unwrap();
            }
        }

        async fn forceful_shutdown(&self, _message: String) {
            *self.forceful_calls.lock().unwrap() += 1;
        }
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..1000 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_subscribe_installs_and_release_uninstalls() {
        let raise = RecordingRaise::new();
        let broker = SignalBroker::with_raise(raise.clone());

        assert_eq!(broker.ref_count(), 0);
        assert!(!broker.handlers_installed());

        let sink = GatedSink::new(false);
        let first = broker.subscribe(sink.clone()).unwrap();
        let second = broker.subscribe(sink.clone()).unwrap();

        assert_eq!(broker.ref_count(), 2);
        assert!(broker.handlers_installed());

        first.release();
        assert_eq!(broker.ref_count(), 1);
        assert!(broker.handlers_installed());

        second.release();
        assert_eq!(broker.ref_count(), 0);
        assert!(!broker.handlers_installed());
        // Uninstalling restores the default disposition for every signal.
        assert_eq!(raise.restored.lock().unwrap().len(), TermSignal::ALL.len());
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_signal_runs_graceful_then_reraises() {
        let raise = RecordingRaise::new();
        let broker = SignalBroker::with_raise(raise.clone());
        let sink = GatedSink::new(false);
        let _sub = broker.subscribe(sink.clone()).unwrap();

        broker.on_signal(TermSignal::Int);

        assert!(broker.shutting_down_gracefully());
        assert!(!broker.shutting_down_forcefully());

        wait_until(|| raise.raised() == vec![TermSignal::Int]).await;
        assert_eq!(*sink.graceful_calls.lock().unwrap(), 1);
        assert_eq!(*sink.forceful_calls.lock().unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_signal_escalates_to_forceful() {
        let raise = RecordingRaise::new();
        let broker = SignalBroker::with_raise(raise.clone());
        let sink = GatedSink::new(true);
        let _sub = broker.subscribe(sink.clone()).unwrap();

        broker.on_signal(TermSignal::Term);
        sink.wait_graceful_started().await;

        broker.on_signal(TermSignal::Term);
        assert!(broker.shutting_down_forcefully());

        wait_until(|| raise.raised() == vec![TermSignal::Term]).await;
        assert_eq!(*sink.forceful_calls.lock().unwrap(), 1);

        // Graceful completes afterwards; it must not re-raise again.
        sink.open_gate();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(raise.raised(), vec![TermSignal::Term]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_escalation_timer_forces_without_second_signal() {
        let raise = RecordingRaise::new();
        let broker = SignalBroker::with_raise(raise.clone());
        let sink = GatedSink::new(true);
        let _sub = broker.subscribe(sink.clone()).unwrap();

        broker.on_signal(TermSignal::Term);
        sink.wait_graceful_started().await;
        assert!(broker.shutting_down_gracefully());
        assert!(!broker.shutting_down_forcefully());

        // No second signal arrives; the escalation window elapses while
        // graceful shutdown is still wedged on the gate.
        tokio::time::sleep(GRACEFUL_ESCALATION_WINDOW + Duration::from_millis(100)).await;

        wait_until(|| broker.shutting_down_forcefully()).await;
        wait_until(|| *sink.forceful_calls.lock().unwrap() == 1).await;
        wait_until(|| raise.raised() == vec![TermSignal::Term]).await;

        // Graceful completes afterwards; it must not re-raise again.
        sink.open_gate();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(raise.raised(), vec![TermSignal::Term]);
    }

    #[tokio::test]
    async fn test_subscribe_after_latch_is_rejected() {
        let raise = RecordingRaise::new();
        let broker = SignalBroker::with_raise(raise.clone());
        let sink = GatedSink::new(true);
        let _sub = broker.subscribe(sink.clone()).unwrap();

        broker.on_signal(TermSignal::Term);

        let rejected = broker.subscribe(GatedSink::new(false));
        assert!(matches!(rejected, Err(BrokerError::AlreadyShuttingDown)));
    }

    #[tokio::test]
    async fn test_last_release_during_shutdown_keeps_handlers() {
        let raise = RecordingRaise::new();
        let broker = SignalBroker::with_raise(raise.clone());
        let sink = GatedSink::new(true);
        let sub = broker.subscribe(sink.clone()).unwrap();

        broker.on_signal(TermSignal::Term);
        sub.release();

        assert_eq!(broker.ref_count(), 0);
        assert!(broker.handlers_installed());
    }

    #[tokio::test]
    async fn test_latches_set_at_most_once() {
        let raise = RecordingRaise::new();
        let broker = SignalBroker::with_raise(raise.clone());
        let sink = GatedSink::new(true);
        let _sub = broker.subscribe(sink.clone()).unwrap();

        broker.on_signal(TermSignal::Term);
        sink.wait_graceful_started().await;
        broker.on_signal(TermSignal::Term);
        // A third signal after both latches is ignored.
        broker.on_signal(TermSignal::Usr2);

        assert!(broker.shutting_down_gracefully());
        assert!(broker.shutting_down_forcefully());
        assert_eq!(*sink.graceful_calls.lock().unwrap(), 1);
    }
}
