//! # Cancellation & deadlines
//!
//! A call option may supply an abort-capable signal and an optional
//! millisecond deadline. On attach, the RPC binds one detachable listener to
//! the signal and arms one timer; both are released on the terminal event, so
//! a signal reused across many RPCs accumulates no residue.
//!
//! A signal already aborted at attach time cancels the RPC before it is ever
//! dispatched to the channel.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

/// Fires an [`AbortSignal`]. The controller side stays with the script code
/// that decides when to abort.
#[derive(Clone, Default)]
pub struct AbortController {
    signal: AbortSignal,
}

impl AbortController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal(&self) -> AbortSignal {
        self.signal.clone()
    }

    /// Aborts the signal, firing every attached listener. Idempotent.
    pub fn abort(&self) {
        self.signal.fire();
    }
}

/// An abort-capable signal shareable across any number of RPCs. Each RPC
/// attaches exactly one listener and detaches it on its terminal event.
#[derive(Clone, Default)]
pub struct AbortSignal {
    inner: Arc<Mutex<SignalState>>,
}

#[derive(Default)]
struct SignalState {
    aborted: bool,
    next_id: u64,
    listeners: HashMap<u64, Box<dyn FnOnce() + Send>>,
}

impl AbortSignal {
    pub fn aborted(&self) -> bool {
        self.inner.lock().expect("signal lock").aborted
    }

    /// Number of currently attached listeners. Useful to assert that
    /// terminated RPCs left nothing behind.
    pub fn listener_count(&self) -> usize {
        self.inner.lock().expect("signal lock").listeners.len()
    }

    fn fire(&self) {
        let listeners: Vec<_> = {
            let mut state = self.inner.lock().expect("signal lock");
            state.aborted = true;
            state.listeners.drain().map(|(_, f)| f).collect()
        };
        for listener in listeners {
            listener();
        }
    }

    fn add_listener(&self, f: Box<dyn FnOnce() + Send>) -> Option<ListenerGuard> {
        let mut state = self.inner.lock().expect("signal lock");
        if state.aborted {
            drop(state);
            f();
            return None;
        }
        let id = state.next_id;
        state.next_id += 1;
        state.listeners.insert(id, f);
        Some(ListenerGuard {
            signal: self.clone(),
            id,
        })
    }
}

/// Detaches its listener when dropped.
pub(crate) struct ListenerGuard {
    signal: AbortSignal,
    id: u64,
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        self.signal
            .inner
            .lock()
            .expect("signal lock")
            .listeners
            .remove(&self.id);
    }
}

/// The RPC was cancelled before it could be dispatched.
#[derive(Debug)]
pub(crate) struct PreAborted;

/// Per-RPC cancellation state: one listener guard, one optional deadline.
/// Owned by the task driving the RPC; the guard is released on the terminal
/// event, before that event becomes observable to script code.
pub(crate) struct RpcContext {
    cancelled_rx: watch::Receiver<bool>,
    deadline: Option<Duration>,
    guard: Mutex<Option<ListenerGuard>>,
}

impl RpcContext {
    /// Binds the signal and deadline to a fresh context. Fails with
    /// [`PreAborted`] when the signal has already fired, in which case no
    /// listener is attached and the RPC must not be dispatched.
    pub(crate) fn attach(
        signal: Option<&AbortSignal>,
        timeout_ms: u64,
    ) -> Result<Self, PreAborted> {
        let (tx, rx) = watch::channel(false);
        let guard = match signal {
            Some(signal) => {
                let listener = Box::new(move || {
                    let _ = tx.send(true);
                });
                match signal.add_listener(listener) {
                    Some(guard) => Some(guard),
                    None => return Err(PreAborted),
                }
            }
            None => None,
        };
        Ok(Self {
            cancelled_rx: rx,
            deadline: (timeout_ms > 0).then(|| Duration::from_millis(timeout_ms)),
            guard: Mutex::new(guard),
        })
    }

    /// Detaches the signal listener. Idempotent; also happens on drop.
    pub(crate) fn release(&self) {
        self.guard.lock().expect("rpc context lock").take();
    }

    /// Resolves when the bound signal fires; pends forever otherwise.
    pub(crate) async fn cancelled(&self) {
        let mut rx = self.cancelled_rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                // Listener detached without firing; cancellation can no
                // longer happen.
                std::future::pending::<()>().await;
            }
        }
    }

    /// Resolves when the deadline elapses; pends forever when unbounded.
    pub(crate) async fn deadline_elapsed(&self) {
        match self.deadline {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pre_aborted_signal_refuses_attach() {
        let controller = AbortController::new();
        controller.abort();
        assert!(controller.signal().aborted());
        assert!(RpcContext::attach(Some(&controller.signal()), 0).is_err());
        assert_eq!(controller.signal().listener_count(), 0);
    }

    #[test]
    fn listeners_detach_on_drop() {
        let controller = AbortController::new();
        let signal = controller.signal();
        let ctx = RpcContext::attach(Some(&signal), 0).unwrap();
        assert_eq!(signal.listener_count(), 1);
        drop(ctx);
        assert_eq!(signal.listener_count(), 0);
    }

    #[test]
    fn shared_signal_holds_one_listener_per_rpc() {
        let controller = AbortController::new();
        let signal = controller.signal();
        let contexts: Vec<_> = (0..8)
            .map(|_| RpcContext::attach(Some(&signal), 0).unwrap())
            .collect();
        assert_eq!(signal.listener_count(), 8);
        drop(contexts);
        assert_eq!(signal.listener_count(), 0);
    }

    #[tokio::test]
    async fn abort_wakes_a_pending_cancellation_wait() {
        let controller = AbortController::new();
        let ctx = RpcContext::attach(Some(&controller.signal()), 0).unwrap();
        controller.abort();
        // Resolves immediately; a hang here would time the test out.
        ctx.cancelled().await;
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_elapses_after_the_configured_timeout() {
        let ctx = RpcContext::attach(None, 25).unwrap();
        tokio::select! {
            biased;
            _ = ctx.deadline_elapsed() => {}
            _ = tokio::time::sleep(std::time::Duration::from_millis(100)) => {
                panic!("deadline did not fire");
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unbounded_deadline_never_fires() {
        let ctx = RpcContext::attach(None, 0).unwrap();
        tokio::select! {
            biased;
            _ = ctx.deadline_elapsed() => panic!("unbounded deadline fired"),
            _ = tokio::time::sleep(std::time::Duration::from_millis(100)) => {}
        }
    }
}
