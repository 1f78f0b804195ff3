//! # Cross-thread scheduler
//!
//! The single mechanism by which work crosses between channel-side tasks and
//! the script loop. Two primitives are offered:
//!
//! * [`LoopHandle::submit`] enqueues a closure for execution on the loop
//!   thread. It only fails once the loop has shut down.
//! * [`PromiseResolver::resolve`] / [`PromiseResolver::reject`] settle a
//!   [`Promise`] minted earlier on the loop. Settlement is routed through the
//!   same submit queue, so two events produced in order for the same RPC are
//!   observed in order.
//!
//! The loop itself is one dedicated OS thread running a current-thread tokio
//! runtime inside a `LocalSet`, which is what allows handler futures to be
//! `!Send` while the closures that create them cross threads.
use crate::status::GrpcError;
use std::future::Future;
use tokio::sync::{mpsc, oneshot};

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, thiserror::Error)]
#[error("event loop not running")]
pub struct LoopClosed;

/// The script loop: owns the thread on which every observable script action
/// happens. Dropping it (or calling [`EventLoop::shutdown`]) stops the loop;
/// pending submissions then fail with [`LoopClosed`] and reject their
/// promises through the normal rejection path.
pub struct EventLoop {
    handle: LoopHandle,
    shutdown: Option<oneshot::Sender<()>>,
    join: Option<std::thread::JoinHandle<()>>,
}

impl EventLoop {
    pub fn new() -> Self {
        let (jobs_tx, mut jobs_rx) = mpsc::unbounded_channel::<Job>();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let join = std::thread::Builder::new()
            .name("pontic-loop".into())
            .spawn(move || {
                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_time()
                    .build()
                    .expect("failed to build the loop runtime");
                let local = tokio::task::LocalSet::new();
                local.block_on(&rt, async move {
                    loop {
                        tokio::select! {
                            biased;
                            _ = &mut shutdown_rx => break,
                            job = jobs_rx.recv() => match job {
                                Some(job) => job(),
                                None => break,
                            },
                        }
                    }
                    // Queued jobs and local tasks are dropped here; any
                    // promise resolver they captured rejects on drop.
                });
            })
            .expect("failed to spawn the loop thread");

        Self {
            handle: LoopHandle { jobs: jobs_tx },
            shutdown: Some(shutdown_tx),
            join: Some(join),
        }
    }

    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    /// Runs a script closure on the loop, blocking the calling thread until
    /// the future it returns settles. Must not be called from the loop
    /// thread itself.
    pub fn run<F, Fut, T>(&self, f: F) -> Result<T, LoopClosed>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + 'static,
        T: Send + 'static,
    {
        self.handle.run(f)
    }

    /// Stops the loop. Idempotent.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Cheap handle used by channel-side tasks to reach the loop.
#[derive(Clone)]
pub struct LoopHandle {
    jobs: mpsc::UnboundedSender<Job>,
}

impl LoopHandle {
    /// Enqueues a closure for execution on the loop thread.
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) -> Result<(), LoopClosed> {
        self.jobs.send(Box::new(job)).map_err(|_| LoopClosed)
    }

    /// Delivers a value to a receiver awaited on the loop, serialized through
    /// the submit queue so it cannot overtake previously submitted events.
    /// If the loop is gone the sender is dropped, which rejects the receiver.
    pub(crate) fn deliver<T: Send + 'static>(&self, tx: oneshot::Sender<T>, value: T) {
        let _ = self.submit(move || {
            let _ = tx.send(value);
        });
    }

    /// Mints a promise whose continuation lives on the loop.
    pub fn promise<T: Send + 'static>(&self) -> (PromiseResolver<T>, Promise<T>) {
        let (tx, rx) = oneshot::channel();
        (
            PromiseResolver {
                tx: Some(tx),
                sched: self.clone(),
            },
            Promise { rx },
        )
    }

    fn run<F, Fut, T>(&self, f: F) -> Result<T, LoopClosed>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = std::sync::mpsc::sync_channel(1);
        self.submit(move || {
            let fut = f();
            tokio::task::spawn_local(async move {
                let _ = tx.send(fut.await);
            });
        })?;
        rx.recv().map_err(|_| LoopClosed)
    }
}

/// A one-shot settlement handle. Awaiting it suspends the script task until
/// the resolver fires (or is lost to a loop shutdown, which rejects).
pub struct Promise<T> {
    rx: oneshot::Receiver<Result<T, GrpcError>>,
}

impl<T> Future for Promise<T> {
    type Output = Result<T, GrpcError>;

    fn poll(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        std::pin::Pin::new(&mut self.rx).poll(cx).map(|res| match res {
            Ok(settled) => settled,
            Err(_) => Err(GrpcError::internal("event loop not running")),
        })
    }
}

/// The channel-side half of a [`Promise`]. Dropping it unsettled rejects the
/// promise with the loop-shutdown error.
pub struct PromiseResolver<T> {
    tx: Option<oneshot::Sender<Result<T, GrpcError>>>,
    sched: LoopHandle,
}

impl<T: Send + 'static> PromiseResolver<T> {
    pub fn resolve(self, value: T) {
        self.settle(Ok(value));
    }

    pub fn reject(self, error: GrpcError) {
        self.settle(Err(error));
    }

    fn settle(mut self, outcome: Result<T, GrpcError>) {
        if let Some(tx) = self.tx.take() {
            self.sched.deliver(tx, outcome);
        }
    }
}
