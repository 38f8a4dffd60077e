//! Periodic driving of the update state machine.
//!
//! The scheduler owns the poll cadence and nothing else; update state lives
//! in [`OtaUpdater`]. Pausing is a wait-free gate rather than a lock because
//! the polling flow may be parked deep inside network I/O when another thread
//! (a connectivity notifier, typically) asks it to stop.

use std::pin::Pin;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::task::Poll;
use std::time::Duration;

use async_io::Timer;
use atomic_waker::AtomicWaker;
use futures_lite::{future, Future};

use crate::common::{
    ota::{OtaUpdater, PollOutcome},
    target::UpdateTarget,
    transport::UpdateTransport,
};

struct PauseGateInner {
    waker: AtomicWaker,
    paused: AtomicBool,
    resume_epoch: AtomicU64,
}

/// Cloneable pause/resume switch shared between the polling flow and
/// whatever control flow decides connectivity.
///
/// `pause` and `resume` are idempotent and callable from any thread with no
/// download in flight or mid-chunk alike. The paused flow parks at the next
/// gate check; nothing already received is rolled back.
#[derive(Clone)]
pub struct PauseGate(Arc<PauseGateInner>);

impl Default for PauseGate {
    fn default() -> Self {
        Self(Arc::new(PauseGateInner {
            waker: AtomicWaker::new(),
            paused: AtomicBool::new(false),
            resume_epoch: AtomicU64::new(0),
        }))
    }
}

impl PauseGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pause(&self) {
        if !self.0.paused.swap(true, Ordering::Relaxed) {
            log::info!("update polling paused");
        }
    }

    pub fn resume(&self) {
        if self.0.paused.swap(false, Ordering::Relaxed) {
            log::info!("update polling resumed");
            self.0.resume_epoch.fetch_add(1, Ordering::Relaxed);
            self.0.waker.wake();
        }
    }

    pub fn is_paused(&self) -> bool {
        self.0.paused.load(Ordering::Relaxed)
    }

    /// Completes once the gate is open. Immediate when not paused.
    pub(crate) fn ready(&self) -> GateReady {
        GateReady(self.clone())
    }

    /// Completes on the first pause-to-resume transition after creation.
    pub(crate) fn resumed(&self) -> ResumeEdge {
        ResumeEdge {
            gate: self.clone(),
            seen: self.0.resume_epoch.load(Ordering::Relaxed),
        }
    }
}

pub(crate) struct GateReady(PauseGate);

impl Future for GateReady {
    type Output = ();
    fn poll(self: Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> Poll<Self::Output> {
        let inner = &self.0 .0;
        if !inner.paused.load(Ordering::Relaxed) {
            return Poll::Ready(());
        }
        inner.waker.register(cx.waker());
        if !inner.paused.load(Ordering::Relaxed) {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }
}

pub(crate) struct ResumeEdge {
    gate: PauseGate,
    seen: u64,
}

impl Future for ResumeEdge {
    type Output = ();
    fn poll(self: Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> Poll<Self::Output> {
        let inner = &self.gate.0;
        if inner.resume_epoch.load(Ordering::Relaxed) != self.seen {
            return Poll::Ready(());
        }
        inner.waker.register(cx.waker());
        if inner.resume_epoch.load(Ordering::Relaxed) != self.seen {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }
}

/// Source of the inter-poll delay, injectable so cadence is deterministic
/// under test.
pub trait PollClock {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + 'static>>;
}

#[derive(Default, Clone, Debug)]
pub struct MonotonicClock;

impl PollClock for MonotonicClock {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + 'static>> {
        Box::pin(async move {
            Timer::after(duration).await;
        })
    }
}

/// Interval-first polling loop around an [`OtaUpdater`].
///
/// Each cycle waits one poll interval (or less, when a resume arrives
/// mid-wait, so reconnecting devices check for updates right away), passes
/// the gate, and runs one poll. Poll errors are logged and the cadence keeps
/// going; the loop ends once an update is staged, since the device is
/// expected to restart from here.
pub struct UpdateScheduler<T: UpdateTransport, G: UpdateTarget> {
    updater: OtaUpdater<T, G>,
    gate: PauseGate,
    clock: Box<dyn PollClock>,
    interval: Duration,
}

impl<T: UpdateTransport, G: UpdateTarget> UpdateScheduler<T, G> {
    pub fn new(updater: OtaUpdater<T, G>) -> Self {
        let gate = updater.pause_gate();
        let interval = updater.config().poll_interval();
        Self {
            updater,
            gate,
            clock: Box::new(MonotonicClock),
            interval,
        }
    }

    pub fn with_clock(mut self, clock: Box<dyn PollClock>) -> Self {
        self.clock = clock;
        self
    }

    /// Control switch for this scheduler; clone freely, hand to other
    /// threads. Grab it before calling [`run`](Self::run).
    pub fn handle(&self) -> PauseGate {
        self.gate.clone()
    }

    pub async fn run(mut self) -> OtaUpdater<T, G> {
        log::info!(
            "update poller starting with interval {:?}",
            self.interval
        );
        loop {
            if self.updater.is_update_ready() {
                break;
            }
            future::or(self.clock.sleep(self.interval), self.gate.resumed()).await;
            self.gate.ready().await;
            match self.updater.poll_for_update().await {
                Ok(PollOutcome::UpdateReady) => break,
                Ok(outcome) => log::debug!("poll outcome: {:?}", outcome),
                Err(e) => log::error!("update poll failed: {}", e),
            }
        }
        log::info!("update staged, poller stopping");
        self.updater
    }
}
