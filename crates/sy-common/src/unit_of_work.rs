use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use crate::exchange::Exchange;
use crate::message::Message;

/// Callback invoked once when the exchange that owns a unit of work finishes.
#[async_trait]
pub trait Synchronization: Send + Sync {
    async fn on_complete(&self, exchange: &Exchange);

    async fn on_failure(&self, exchange: &Exchange);
}

/// Scope spanning one top-level exchange. Keeps a snapshot of the original
/// inbound message and runs registered synchronizations exactly once when the
/// exchange is done, in registration order.
pub struct UnitOfWork {
    exchange_id: String,
    original_message: Message,
    synchronizations: Mutex<Vec<Arc<dyn Synchronization>>>,
    done: AtomicBool,
}

impl UnitOfWork {
    pub fn new(exchange: &Exchange) -> Self {
        Self {
            exchange_id: exchange.id().to_string(),
            original_message: exchange.in_message().clone(),
            synchronizations: Mutex::new(Vec::new()),
            done: AtomicBool::new(false),
        }
    }

    pub fn exchange_id(&self) -> &str {
        &self.exchange_id
    }

    /// The in message as it was when the exchange entered its first route.
    pub fn original_message(&self) -> &Message {
        &self.original_message
    }

    pub fn add_synchronization(&self, synchronization: Arc<dyn Synchronization>) {
        self.synchronizations.lock().push(synchronization);
    }

    pub fn synchronization_count(&self) -> usize {
        self.synchronizations.lock().len()
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    /// Run the synchronizations. Faults count as failure. Subsequent calls are no-ops.
    pub async fn done(&self, exchange: &Exchange) {
        if self.done.swap(true, Ordering::SeqCst) {
            return;
        }

        let synchronizations = std::mem::take(&mut *self.synchronizations.lock());
        let failed = exchange.is_failed() || exchange.message().is_fault();
        debug!(
            exchange_id = %self.exchange_id,
            count = synchronizations.len(),
            failed,
            "Unit of work done"
        );

        for synchronization in synchronizations {
            if failed {
                synchronization.on_failure(exchange).await;
            } else {
                synchronization.on_complete(exchange).await;
            }
        }
    }
}

impl fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("exchange_id", &self.exchange_id)
            .field("synchronizations", &self.synchronization_count())
            .field("done", &self.is_done())
            .finish()
    }
}
