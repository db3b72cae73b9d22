use std::{
    collections::BTreeMap,
    sync::{Arc, atomic::AtomicU64},
};

use tokio::sync::RwLock;
use tracing::{error, trace};
use uuid::Uuid;

use crate::models::{DepositInfo, Payment, PaymentStatus};

/// Events emitted by the sdk to registered listeners.
#[derive(Clone, Debug)]
pub enum SdkEvent {
    /// A wallet sync pass completed.
    Synced,
    /// Deposits were claimed into the wallet.
    ClaimedDeposits { claimed_deposits: Vec<DepositInfo> },
    /// Deposits were detected that could not be claimed automatically.
    UnclaimedDeposits {
        unclaimed_deposits: Vec<DepositInfo>,
    },
    PaymentSucceeded { payment: Payment },
    PaymentPending { payment: Payment },
    PaymentFailed { payment: Payment },
}

impl SdkEvent {
    pub fn from_payment(payment: Payment) -> Self {
        match payment.status {
            PaymentStatus::Completed => SdkEvent::PaymentSucceeded { payment },
            PaymentStatus::Pending => SdkEvent::PaymentPending { payment },
            PaymentStatus::Failed => SdkEvent::PaymentFailed { payment },
        }
    }
}

impl std::fmt::Display for SdkEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SdkEvent::Synced => write!(f, "synced"),
            SdkEvent::ClaimedDeposits { .. } => write!(f, "claimed deposits"),
            SdkEvent::UnclaimedDeposits { .. } => write!(f, "unclaimed deposits"),
            SdkEvent::PaymentSucceeded { payment } => write!(f, "payment succeeded: {}", payment.id),
            SdkEvent::PaymentPending { payment } => write!(f, "payment pending: {}", payment.id),
            SdkEvent::PaymentFailed { payment } => write!(f, "payment failed: {}", payment.id),
        }
    }
}

#[async_trait::async_trait]
pub trait EventListener: Send + Sync {
    async fn on_event(&self, e: SdkEvent);
}

/// Fans events out to registered listeners. Each listener runs on its own
/// task so a slow or panicking listener cannot block delivery to the rest.
pub struct EventEmitter {
    listener_index: AtomicU64,
    listeners: RwLock<BTreeMap<String, Arc<dyn EventListener>>>,
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new()
    }
}

impl EventEmitter {
    pub fn new() -> Self {
        Self {
            listener_index: AtomicU64::new(0),
            listeners: RwLock::new(BTreeMap::new()),
        }
    }

    /// Registers a listener, returning an id that can be used to remove it.
    pub async fn add_listener(&self, listener: Box<dyn EventListener>) -> String {
        let index = self
            .listener_index
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let id = format!("listener_{}-{}", index, Uuid::new_v4());
        self.listeners
            .write()
            .await
            .insert(id.clone(), Arc::from(listener));
        id
    }

    /// Removes a listener. Returns whether a listener with this id existed.
    pub async fn remove_listener(&self, id: &str) -> bool {
        self.listeners.write().await.remove(id).is_some()
    }

    pub async fn emit(&self, event: &SdkEvent) {
        trace!("Emitting event: {event}");
        let listeners: Vec<(String, Arc<dyn EventListener>)> = self
            .listeners
            .read()
            .await
            .iter()
            .map(|(id, listener)| (id.clone(), Arc::clone(listener)))
            .collect();

        let mut handles = Vec::with_capacity(listeners.len());
        for (id, listener) in listeners {
            let event = event.clone();
            handles.push((id, tokio::spawn(async move {
                listener.on_event(event).await;
            })));
        }
        for (id, handle) in handles {
            if let Err(e) = handle.await {
                error!("Event listener {id} failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct CountingListener {
        count: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl EventListener for CountingListener {
        async fn on_event(&self, _e: SdkEvent) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct PanickingListener;

    #[async_trait::async_trait]
    impl EventListener for PanickingListener {
        async fn on_event(&self, _e: SdkEvent) {
            panic!("listener failure");
        }
    }

    #[tokio::test]
    async fn test_add_remove_listener() {
        let emitter = EventEmitter::new();
        let count = Arc::new(AtomicUsize::new(0));
        let id = emitter
            .add_listener(Box::new(CountingListener {
                count: Arc::clone(&count),
            }))
            .await;

        emitter.emit(&SdkEvent::Synced).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        assert!(emitter.remove_listener(&id).await);
        emitter.emit(&SdkEvent::Synced).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        assert!(!emitter.remove_listener(&id).await);
    }

    #[tokio::test]
    async fn test_listener_failure_does_not_block_others() {
        let emitter = EventEmitter::new();
        let count = Arc::new(AtomicUsize::new(0));
        emitter.add_listener(Box::new(PanickingListener)).await;
        emitter
            .add_listener(Box::new(CountingListener {
                count: Arc::clone(&count),
            }))
            .await;
        emitter.add_listener(Box::new(PanickingListener)).await;

        emitter.emit(&SdkEvent::Synced).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
