//! Shared harness for the integration tests: a recording mock endpoint and a
//! consumer that feeds a route from an in-memory backlog.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use sy_common::{Exchange, ExchangeError, Result, Value};
use sy_router::{Consumer, ConsumerContext, EngineContext, Processor, RouterError, ShutdownRunningTask};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("sy_router=debug")
        .with_test_writer()
        .try_init();
}

// ============================================================================
// Mock endpoint
// ============================================================================

/// Records every exchange it receives. Can be scripted to fail the first `n`
/// calls (or every call) and to take time per call.
pub struct MockEndpoint {
    name: String,
    received: Mutex<Vec<Exchange>>,
    notify: Notify,
    failures_left: AtomicUsize,
    failure_kind: Mutex<String>,
    delay: Mutex<Option<Duration>>,
}

impl MockEndpoint {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            received: Mutex::new(Vec::new()),
            notify: Notify::new(),
            failures_left: AtomicUsize::new(0),
            failure_kind: Mutex::new("IOException".to_string()),
            delay: Mutex::new(None),
        })
    }

    /// Create a mock and register it under `uri`.
    pub fn register(context: &EngineContext, uri: &str) -> Arc<Self> {
        let mock = Self::new(uri);
        context.endpoints().register(uri, mock.clone());
        mock
    }

    pub fn fail_times(&self, times: usize, kind: &str) {
        self.failures_left.store(times, Ordering::SeqCst);
        *self.failure_kind.lock() = kind.to_string();
    }

    pub fn always_fail(&self, kind: &str) {
        self.fail_times(usize::MAX, kind);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn count(&self) -> usize {
        self.received.lock().len()
    }

    pub fn received(&self) -> Vec<Exchange> {
        self.received.lock().clone()
    }

    pub fn bodies(&self) -> Vec<Value> {
        self.received.lock().iter().map(|ex| ex.body().clone()).collect()
    }

    /// Wait until at least `count` exchanges arrived. Returns false on timeout.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.notify.notified();
                if self.count() >= count {
                    return;
                }
                notified.await;
            }
        })
        .await
        .is_ok()
    }
}

#[async_trait]
impl Processor for MockEndpoint {
    async fn process(&self, exchange: &mut Exchange) -> Result<()> {
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.received.lock().push(exchange.clone());
        self.notify.notify_waiters();

        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| match left {
                0 => None,
                usize::MAX => Some(usize::MAX),
                n => Some(n - 1),
            })
            .is_ok();
        if failing {
            let kind = self.failure_kind.lock().clone();
            return Err(ExchangeError::processing(kind, format!("{} failed", self.name)));
        }
        Ok(())
    }
}

// ============================================================================
// Backlog consumer
// ============================================================================

/// Hands queued bodies to its route one at a time, like a polling consumer
/// over an in-memory queue. A forced stop aborts the exchange in progress.
pub struct BacklogConsumer {
    backlog: Arc<Mutex<VecDeque<Value>>>,
    processed: Arc<AtomicUsize>,
    forced: AtomicBool,
    stop_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl BacklogConsumer {
    pub fn new<I, V>(bodies: I) -> Arc<Self>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let (stop_tx, _) = watch::channel(false);
        Arc::new(Self {
            backlog: Arc::new(Mutex::new(bodies.into_iter().map(Into::into).collect())),
            processed: Arc::new(AtomicUsize::new(0)),
            forced: AtomicBool::new(false),
            stop_tx,
            task: Mutex::new(None),
        })
    }

    pub fn push(&self, body: impl Into<Value>) {
        self.backlog.lock().push_back(body.into());
    }

    /// Exchanges handed to the route so far.
    pub fn processed(&self) -> usize {
        self.processed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Consumer for BacklogConsumer {
    async fn start(&self, context: ConsumerContext) -> std::result::Result<(), RouterError> {
        self.stop_tx.send_replace(false);
        self.forced.store(false, Ordering::SeqCst);
        let backlog = self.backlog.clone();
        let processed = self.processed.clone();
        let mut stop_rx = self.stop_tx.subscribe();

        let handle = tokio::spawn(async move {
            loop {
                if *stop_rx.borrow() {
                    break;
                }
                let next = backlog.lock().pop_front();
                match next {
                    Some(body) => {
                        let mut exchange = Exchange::with_body(body);
                        if let Err(e) = context.processor.process(&mut exchange).await {
                            context
                                .exception_handler
                                .handle_exception("Error processing exchange", Some(&exchange), &e);
                        }
                        processed.fetch_add(1, Ordering::SeqCst);
                    }
                    None => {
                        tokio::select! {
                            _ = tokio::time::sleep(Duration::from_millis(5)) => {}
                            _ = stop_rx.changed() => {}
                        }
                    }
                }
            }
        });
        *self.task.lock() = Some(handle);
        Ok(())
    }

    async fn stop(&self) {
        self.stop_tx.send_replace(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            if self.forced.load(Ordering::SeqCst) {
                task.abort();
            }
            let _ = task.await;
        }
    }

    fn pending_exchanges(&self) -> usize {
        self.backlog.lock().len()
    }

    fn prepare_shutdown(&self, task: ShutdownRunningTask, forced: bool) {
        if forced {
            self.forced.store(true, Ordering::SeqCst);
        }
        if forced || task == ShutdownRunningTask::CompleteCurrentTaskOnly {
            self.backlog.lock().clear();
        }
    }
}
