use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

/// A named server-side long-poll point.
///
/// Any number of GET requests may hang on the endpoint; a call to
/// [`AjaxEndpoint::update`] sends the payload to every pending waiter and
/// leaves the endpoint quiescent again. Waiters that subscribe after the
/// notification instant do not receive it retroactively.
#[derive(Debug, Default)]
pub struct AjaxEndpoint {
    pending: Mutex<Vec<oneshot::Sender<String>>>,
}

impl AjaxEndpoint {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            pending: Mutex::new(Vec::new()),
        })
    }

    /// Park a new waiter. The returned receiver completes with the payload
    /// of the next `update()` call.
    pub fn subscribe(&self) -> oneshot::Receiver<String> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().push(tx);
        rx
    }

    /// Deliver `payload` to every currently-pending waiter.
    pub fn update(&self, payload: &str) {
        let waiters = std::mem::take(&mut *self.pending.lock());
        for waiter in waiters {
            // A waiter whose connection already went away is skipped.
            let _ = waiter.send(payload.to_owned());
        }
    }

    pub fn num_pending(&self) -> usize {
        self.pending.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn update_flushes_all_pending_waiters() {
        let endpoint = AjaxEndpoint::new();
        let rx1 = endpoint.subscribe();
        let rx2 = endpoint.subscribe();
        assert_eq!(endpoint.num_pending(), 2);

        endpoint.update("{\"status\":\"ok\"}");
        assert_eq!(endpoint.num_pending(), 0);
        assert_eq!(rx1.await.unwrap(), "{\"status\":\"ok\"}");
        assert_eq!(rx2.await.unwrap(), "{\"status\":\"ok\"}");
    }

    #[tokio::test]
    async fn late_subscribers_miss_earlier_updates() {
        let endpoint = AjaxEndpoint::new();
        endpoint.update("first");
        let mut rx = endpoint.subscribe();
        assert!(rx.try_recv().is_err());
        endpoint.update("second");
        assert_eq!(rx.await.unwrap(), "second");
    }
}
