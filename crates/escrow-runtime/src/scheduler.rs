//! Timers feeding the engine queue
//!
//! Every delayed or periodic action re-enters the engine as an
//! [`InternalEvent`]. Timers are owned through [`TimerHandle`]s; cancelling is
//! idempotent and a timer cancelled after its deadline but before its action
//! ran does not run the action.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::internal::InternalEvent;

pub type InternalSender = mpsc::UnboundedSender<InternalEvent>;
pub type InternalReceiver = mpsc::UnboundedReceiver<InternalEvent>;

pub fn create_internal_channel() -> (InternalSender, InternalReceiver) {
    mpsc::unbounded_channel()
}

// ----------------------------------------------------------------------------
// Timer Handle
// ----------------------------------------------------------------------------

#[derive(Debug)]
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl TimerHandle {
    /// Run `action` once after `delay` unless cancelled first
    pub fn once<F>(delay: Duration, action: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if !flag.load(Ordering::SeqCst) {
                action();
            }
        });
        Self { cancelled, task }
    }

    /// Run `action` immediately and then every `interval` until cancelled
    pub fn periodic<F>(interval: Duration, action: F) -> Self
    where
        F: Fn() + Send + 'static,
    {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if flag.load(Ordering::SeqCst) {
                    break;
                }
                action();
            }
        });
        Self { cancelled, task }
    }

    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            self.task.abort();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

// ----------------------------------------------------------------------------
// Scheduler
// ----------------------------------------------------------------------------

/// Posts internal events to the engine queue after a delay
#[derive(Debug, Clone)]
pub struct Scheduler {
    internal: InternalSender,
}

impl Scheduler {
    pub fn new(internal: InternalSender) -> Self {
        Self { internal }
    }

    /// Post immediately
    pub fn post(&self, event: InternalEvent) {
        if self.internal.send(event).is_err() {
            debug!("Engine queue closed, dropping internal event");
        }
    }

    pub fn post_after(&self, delay: Duration, event: InternalEvent) -> TimerHandle {
        let internal = self.internal.clone();
        TimerHandle::once(delay, move || {
            let _ = internal.send(event);
        })
    }

    pub fn post_every(&self, interval: Duration, event: InternalEvent) -> TimerHandle {
        let internal = self.internal.clone();
        TimerHandle::periodic(interval, move || {
            let _ = internal.send(event.clone());
        })
    }

    pub fn sender(&self) -> InternalSender {
        self.internal.clone()
    }
}
