//! Module execution engine.
//!
//! A run is one worker task holding the session lock, a bounded channel
//! carrying its output to the consumer, and a stop flag going the other way.
//! The consumer sees the run as a [`ModuleRun`] stream.
//!
//! ```text
//! caller ──run_module──▶ AccessGate (busy) ──▶ tokio::spawn(worker)
//!                                                  │ holds OwnedMutexGuard<Session>
//!                                                  ▼
//!   ModuleRun<T> ◀── mpsc (HANDOFF_CAPACITY) ◀── Emitter<T>
//!        │                                         ▲
//!        └──────── watch<bool> stop ───────────────┘
//! ```
//!
//! Lifecycle:
//!
//! - The gate is released as soon as the worker finishes, before its final
//!   error (if any) is queued, or as soon as the consumer cancels or drops the
//!   run, whichever comes first. Releasing is idempotent.
//! - A worker fault is delivered once, in order after every record produced
//!   before it; the stream then ends. A panicking module counts as a fault.
//! - After a cancel the worker stops at its next record boundary and drops
//!   the session lock.

use super::RecordSink;
use crate::error::{ArcError, ArcResult};
use crate::instrument::session::Session;
use crate::measurement::MeasurementRecord;
use anyhow::anyhow;
use async_trait::async_trait;
use futures::stream::{FusedStream, Stream};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, watch, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Records buffered between the worker and the consumer.
pub const HANDOFF_CAPACITY: usize = 64;

const IDLE: u64 = 0;

/// Busy flag shared by the controller and its runs. Holds the id of the run
/// that owns the session, or zero.
#[derive(Debug)]
pub(crate) struct AccessGate {
    active: AtomicU64,
    next_id: AtomicU64,
}

impl AccessGate {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            active: AtomicU64::new(IDLE),
            next_id: AtomicU64::new(1),
        })
    }

    /// Claim the board for a new run.
    pub(crate) fn try_acquire(self: &Arc<Self>) -> ArcResult<RunTicket> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.active
            .compare_exchange(IDLE, id, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| ArcError::ControllerBusy)?;
        Ok(RunTicket {
            gate: self.clone(),
            id,
        })
    }

    /// Fail with `ControllerBusy` while a run holds the board.
    pub(crate) fn check(&self) -> ArcResult<()> {
        match self.active_run() {
            Some(_) => Err(ArcError::ControllerBusy),
            None => Ok(()),
        }
    }

    pub(crate) fn active_run(&self) -> Option<u64> {
        match self.active.load(Ordering::Acquire) {
            IDLE => None,
            id => Some(id),
        }
    }
}

/// Proof of ownership of the gate for one run.
#[derive(Debug, Clone)]
pub(crate) struct RunTicket {
    gate: Arc<AccessGate>,
    id: u64,
}

impl RunTicket {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Release the gate if this run still holds it.
    pub(crate) fn release(&self) -> bool {
        self.gate
            .active
            .compare_exchange(self.id, IDLE, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Worker side of the handoff buffer.
pub(crate) struct Emitter<T> {
    tx: mpsc::Sender<ArcResult<T>>,
    stop: watch::Receiver<bool>,
}

impl<T: Send> Emitter<T> {
    pub(crate) async fn send(&mut self, item: T) -> ArcResult<()> {
        if self.stopped() {
            return Err(ArcError::Cancelled);
        }
        self.tx
            .send(Ok(item))
            .await
            .map_err(|_| ArcError::Cancelled)
    }

    pub(crate) fn stopped(&self) -> bool {
        *self.stop.borrow() || self.tx.is_closed()
    }

    pub(crate) async fn pause(&mut self, period: Duration) -> bool {
        let stop = &mut self.stop;
        let stopped = async {
            while !*stop.borrow_and_update() {
                if stop.changed().await.is_err() {
                    break;
                }
            }
        };
        tokio::select! {
            _ = tokio::time::sleep(period) => !self.tx.is_closed(),
            _ = stopped => false,
        }
    }
}

#[async_trait]
impl RecordSink for Emitter<MeasurementRecord> {
    async fn emit(&mut self, record: MeasurementRecord) -> ArcResult<()> {
        self.send(record).await
    }

    fn should_stop(&self) -> bool {
        self.stopped()
    }

    async fn idle(&mut self, period: Duration) -> bool {
        self.pause(period).await
    }
}

/// Work executed on the engine's worker.
#[async_trait]
pub(crate) trait Job<T>: Send + 'static {
    fn name(&self) -> &str;

    async fn run(self: Box<Self>, session: &mut Session, out: &mut Emitter<T>) -> ArcResult<()>;
}

/// Start `job` on a worker task that owns `session` until it returns.
pub(crate) fn spawn<T: Send + 'static>(
    job: Box<dyn Job<T>>,
    mut session: OwnedMutexGuard<Option<Session>>,
    ticket: RunTicket,
) -> ModuleRun<T> {
    let (tx, rx) = mpsc::channel(HANDOFF_CAPACITY);
    let (stop_tx, stop_rx) = watch::channel(false);
    let name = job.name().to_string();
    let id = ticket.id();
    let worker_ticket = ticket.clone();
    let worker_name = name.clone();

    let worker = tokio::spawn(async move {
        let mut out = Emitter { tx, stop: stop_rx };
        info!(run = id, module = %worker_name, "module started");

        let result = match session.as_mut() {
            Some(session) => AssertUnwindSafe(job.run(session, &mut out))
                .catch_unwind()
                .await
                .unwrap_or_else(|payload| Err(panicked(&worker_name, payload.as_ref()))),
            None => Err(ArcError::NotConnected),
        };
        drop(session);
        worker_ticket.release();

        match result {
            Ok(()) if out.stopped() => info!(run = id, module = %worker_name, "module stopped"),
            Ok(()) => info!(run = id, module = %worker_name, "module finished"),
            Err(ArcError::Cancelled) => info!(run = id, module = %worker_name, "module cancelled"),
            Err(e) => {
                warn!(run = id, module = %worker_name, error = %e, "module failed");
                if out.tx.send(Err(e)).await.is_err() {
                    debug!(run = id, "consumer gone before fault delivery");
                }
            }
        }
    });

    ModuleRun {
        id,
        name,
        rx,
        stop: stop_tx,
        ticket,
        done: false,
        worker: Some(worker),
    }
}

fn panicked(name: &str, payload: &(dyn Any + Send)) -> ArcError {
    let reason = payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown cause");
    ArcError::Module(anyhow!("module {} panicked: {}", name, reason))
}

/// An in-flight or finished module run, consumed as a stream.
///
/// Yields each record in the order the worker produced it, then at most one
/// error, then ends. Not restartable: a drained run yields nothing more.
/// Dropping the run before it ends stops the worker.
#[derive(Debug)]
pub struct ModuleRun<T> {
    id: u64,
    name: String,
    rx: mpsc::Receiver<ArcResult<T>>,
    stop: watch::Sender<bool>,
    ticket: RunTicket,
    done: bool,
    worker: Option<JoinHandle<()>>,
}

impl<T> ModuleRun<T> {
    /// Identifier of this run.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Name of the module or sequence being run.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// True once the stream has ended or was cancelled.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Stop the worker at its next record boundary and release the
    /// controller. Records not yet pulled are discarded.
    pub fn cancel(&mut self) {
        if !self.done {
            debug!(run = self.id, "run cancelled by consumer");
        }
        self.stop.send_replace(true);
        self.rx.close();
        self.ticket.release();
        self.done = true;
    }

    /// Cancel if still running, then wait for the worker to exit.
    pub async fn join(mut self) {
        if !self.done {
            self.cancel();
        }
        if let Some(worker) = self.worker.take() {
            if let Err(e) = worker.await {
                warn!(run = self.id, error = %e, "module worker panicked");
            }
        }
    }

    fn finish(&mut self) {
        self.done = true;
        self.ticket.release();
    }
}

impl<T> Stream for ModuleRun<T> {
    type Item = ArcResult<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(Ok(item))) => Poll::Ready(Some(Ok(item))),
            Poll::Ready(Some(Err(e))) => {
                this.finish();
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.finish();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T> FusedStream for ModuleRun<T> {
    fn is_terminated(&self) -> bool {
        self.done
    }
}

impl<T> Drop for ModuleRun<T> {
    fn drop(&mut self) {
        self.stop.send_replace(true);
        self.ticket.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MockBoard;
    use crate::config::BoardConfig;
    use crate::instrument::crossbar::Coordinate;
    use crate::instrument::session::ConnectOptions;
    use futures::StreamExt;
    use tokio::sync::Mutex;
    use tracing_test::traced_test;

    struct Count(u32);

    #[async_trait]
    impl Job<u32> for Count {
        fn name(&self) -> &str {
            "count"
        }

        async fn run(self: Box<Self>, _session: &mut Session, out: &mut Emitter<u32>) -> ArcResult<()> {
            for i in 0..self.0 {
                out.send(i).await?;
            }
            Ok(())
        }
    }

    struct FailAfter(u32);

    #[async_trait]
    impl Job<u32> for FailAfter {
        fn name(&self) -> &str {
            "fail"
        }

        async fn run(self: Box<Self>, session: &mut Session, out: &mut Emitter<u32>) -> ArcResult<()> {
            for i in 0..self.0 {
                out.send(i).await?;
            }
            session.read_one(Coordinate::new(99, 0)).await?;
            Ok(())
        }
    }

    async fn locked_session() -> OwnedMutexGuard<Option<Session>> {
        let (transport, _board) = MockBoard::spawn();
        let options = ConnectOptions::default().with_reset_delay(Duration::ZERO);
        let session = Session::open(transport, BoardConfig::with_size(4, 4), options)
            .await
            .unwrap();
        Arc::new(Mutex::new(Some(session))).lock_owned().await
    }

    #[test]
    fn test_gate_is_exclusive_and_release_idempotent() {
        let gate = AccessGate::new();
        let ticket = gate.try_acquire().unwrap();
        assert!(matches!(gate.try_acquire(), Err(ArcError::ControllerBusy)));
        assert!(gate.check().is_err());
        assert!(ticket.release());
        assert!(!ticket.release());
        assert!(gate.check().is_ok());

        let next = gate.try_acquire().unwrap();
        assert!(!ticket.release());
        assert_eq!(gate.active_run(), Some(next.id()));
    }

    #[tokio::test]
    async fn test_run_delivers_in_order_more_than_capacity() {
        let gate = AccessGate::new();
        let ticket = gate.try_acquire().unwrap();
        let total = HANDOFF_CAPACITY as u32 * 3;
        let run = spawn(Box::new(Count(total)), locked_session().await, ticket);

        let items: Vec<u32> = run.map(|r| r.unwrap()).collect().await;
        assert_eq!(items, (0..total).collect::<Vec<_>>());
        assert!(gate.check().is_ok());
    }

    #[tokio::test]
    async fn test_fault_delivered_once_after_records() {
        let gate = AccessGate::new();
        let ticket = gate.try_acquire().unwrap();
        let mut run = spawn(Box::new(FailAfter(2)), locked_session().await, ticket);

        assert_eq!(run.next().await.unwrap().unwrap(), 0);
        assert_eq!(run.next().await.unwrap().unwrap(), 1);
        assert!(matches!(
            run.next().await,
            Some(Err(ArcError::Address { word: 99, .. }))
        ));
        assert!(gate.check().is_ok());
        assert!(run.next().await.is_none());
        assert!(run.next().await.is_none());
    }

    #[tokio::test]
    async fn test_drop_releases_gate() {
        let gate = AccessGate::new();
        let ticket = gate.try_acquire().unwrap();
        let mut run = spawn(Box::new(Count(1000)), locked_session().await, ticket);
        run.next().await.unwrap().unwrap();
        drop(run);
        assert!(gate.check().is_ok());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_cancel_discards_pending_records() {
        let gate = AccessGate::new();
        let ticket = gate.try_acquire().unwrap();
        let mut run = spawn(Box::new(Count(10)), locked_session().await, ticket);
        run.next().await.unwrap().unwrap();

        run.cancel();
        assert!(run.is_done());
        assert!(gate.check().is_ok());
        assert!(run.next().await.is_none());
        assert!(logs_contain("run cancelled by consumer"));
        run.join().await;
    }
}
