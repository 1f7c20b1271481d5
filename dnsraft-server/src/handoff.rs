use dnsraft_common::error::{DnsRaftError, Result};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};

/// Single-slot queue between one producer side and one consumer side, with
/// an explicit closed state.
///
/// `offer` waits until the slot is free and `take` waits until it is full;
/// both return [`DnsRaftError::Closed`] as soon as the queue is closed.
pub struct HandoffQueue<T> {
    tx: mpsc::Sender<T>,
    rx: AsyncMutex<mpsc::Receiver<T>>,
    closed: Mutex<bool>,
    close_signal: watch::Sender<bool>,
}

impl<T: Send> HandoffQueue<T> {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(1);
        let (close_signal, _) = watch::channel(false);
        Self {
            tx,
            rx: AsyncMutex::new(rx),
            closed: Mutex::new(false),
            close_signal,
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock()
    }

    /// Hands `item` to the consumer side.
    pub async fn offer(&self, item: T) -> Result<()> {
        let mut closed = self.close_signal.subscribe();
        if self.is_closed() {
            return Err(DnsRaftError::Closed);
        }
        tokio::select! {
            biased;
            _ = wait_closed(&mut closed) => Err(DnsRaftError::Closed),
            sent = self.tx.send(item) => sent.map_err(|_| DnsRaftError::Closed),
        }
    }

    /// Waits for the next item.
    pub async fn take(&self) -> Result<T> {
        let mut closed = self.close_signal.subscribe();
        if self.is_closed() {
            return Err(DnsRaftError::Closed);
        }
        let next = async {
            let mut rx = self.rx.lock().await;
            rx.recv().await
        };
        let item = tokio::select! {
            biased;
            _ = wait_closed(&mut closed) => None,
            item = next => item,
        };
        match item {
            Some(item) => Ok(item),
            None => {
                // close() cannot drain while a take holds the receiver
                self.drain().await;
                Err(DnsRaftError::Closed)
            }
        }
    }

    async fn drain(&self) {
        let mut rx = self.rx.lock().await;
        rx.close();
        while rx.try_recv().is_ok() {}
    }

    /// Closes the queue and drops anything left in the slot. Returns `false`
    /// if it was already closed.
    pub fn close(&self) -> bool {
        {
            let mut closed = self.closed.lock();
            if *closed {
                return false;
            }
            *closed = true;
        }
        self.close_signal.send_replace(true);
        if let Ok(mut rx) = self.rx.try_lock() {
            rx.close();
            while rx.try_recv().is_ok() {}
        }
        true
    }
}

impl<T: Send> Default for HandoffQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    loop {
        if *closed.borrow_and_update() {
            return;
        }
        if closed.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_offer_then_take() {
        let queue = HandoffQueue::new();
        queue.offer(7u32).await.unwrap();
        assert_eq!(queue.take().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let queue: HandoffQueue<u32> = HandoffQueue::new();
        assert!(queue.close());
        assert!(!queue.close());
        assert!(queue.is_closed());
        assert!(matches!(queue.offer(1).await, Err(DnsRaftError::Closed)));
        assert!(matches!(queue.take().await, Err(DnsRaftError::Closed)));
    }

    #[tokio::test]
    async fn test_close_releases_blocked_take() {
        let queue: Arc<HandoffQueue<u32>> = Arc::new(HandoffQueue::new());
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.take().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        queue.close();
        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("take should return promptly")
            .unwrap();
        assert!(matches!(result, Err(DnsRaftError::Closed)));
    }

    #[tokio::test]
    async fn test_close_during_take_drops_pending_item() {
        let queue: Arc<HandoffQueue<Arc<()>>> = Arc::new(HandoffQueue::new());
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.take().await })
        };
        // Let the take park on the receiver while holding its lock
        tokio::time::sleep(Duration::from_millis(20)).await;

        // The item lands in the slot and the queue closes before the take
        // runs again, so the take sees both and picks closed.
        let item = Arc::new(());
        queue.offer(Arc::clone(&item)).await.unwrap();
        queue.close();

        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("take should return promptly")
            .unwrap();
        assert!(matches!(result, Err(DnsRaftError::Closed)));
        assert_eq!(Arc::strong_count(&item), 1);
        assert!(matches!(
            queue.offer(Arc::new(())).await,
            Err(DnsRaftError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_close_releases_blocked_offer() {
        let queue: Arc<HandoffQueue<u32>> = Arc::new(HandoffQueue::new());
        queue.offer(1).await.unwrap();

        // The slot is full, so the second offer waits
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.offer(2).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        queue.close();
        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("offer should return promptly")
            .unwrap();
        assert!(matches!(result, Err(DnsRaftError::Closed)));
    }
}
