//! Ordered, asynchronous delivery of callback work
//!
//! Components with tight loops hand their listener notifications to an
//! `OpsQueue` so listener code, which may take other locks, never runs on the
//! loop itself.

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{trace, Instrument, Span};

type Op = Box<dyn FnOnce() + Send + 'static>;

pub struct OpsQueue {
    name: &'static str,
    tx: Mutex<Option<mpsc::UnboundedSender<Op>>>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Op>>>,
    span: Span,
}

impl OpsQueue {
    #[must_use]
    pub fn new(name: &'static str, span: Span) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            name,
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
            span,
        }
    }

    /// Spawn the worker. Ops enqueued before this run once it starts.
    ///
    /// Must be called from within a tokio runtime. Later calls are no-ops.
    pub fn start(&self) {
        let Some(mut rx) = self.rx.lock().take() else {
            return;
        };

        let name = self.name;
        tokio::spawn(
            async move {
                while let Some(op) = rx.recv().await {
                    op();
                }
                trace!(queue = name, "ops queue drained");
            }
            .instrument(self.span.clone()),
        );
    }

    /// Stop accepting ops. Ops already queued are still run.
    pub fn stop(&self) {
        self.tx.lock().take();
    }

    pub fn enqueue(&self, op: impl FnOnce() + Send + 'static) {
        if let Some(tx) = self.tx.lock().as_ref() {
            // the worker only goes away after stop
            let _ = tx.send(Box::new(op));
        }
    }
}
