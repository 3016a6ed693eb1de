use crate::error::TransportError;
use parking_lot::Mutex;
use std::sync::Arc;

/// Called with the failure and whether it came from the reader (`true`) or
/// from a send/replay (`false`). Called outside the hub lock, so it may use
/// the connection's error API itself.
pub type UdpErrorHandler = Arc<dyn Fn(&TransportError, bool) + Send + Sync>;

/// Handle returned by a registration; pass it back to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UdpErrorSubscription(u64);

#[derive(Default)]
struct HubState {
    last: Option<Arc<TransportError>>,
    next_id: u64,
    listeners: Vec<(u64, UdpErrorHandler)>,
}

/// Sticky last unreliable-channel error plus its listeners, under one lock.
#[derive(Default)]
pub(crate) struct UdpErrorHub {
    state: Mutex<HubState>,
}

impl UdpErrorHub {
    /// Register `handler`, replaying the last error to it straight away.
    pub fn subscribe(&self, handler: UdpErrorHandler) -> UdpErrorSubscription {
        let (id, last) = {
            let mut state = self.state.lock();
            let id = state.next_id;
            state.next_id += 1;
            state.listeners.push((id, handler.clone()));
            (id, state.last.clone())
        };
        if let Some(last) = last {
            handler(&*last, false);
        }
        UdpErrorSubscription(id)
    }

    pub fn unsubscribe(&self, sub: UdpErrorSubscription) -> bool {
        let mut state = self.state.lock();
        let before = state.listeners.len();
        state.listeners.retain(|(id, _)| *id != sub.0);
        state.listeners.len() != before
    }

    pub fn last(&self) -> Option<Arc<TransportError>> {
        self.state.lock().last.clone()
    }

    /// Record `err` as the last error and hand it to every listener.
    /// Returns false when nobody was listening.
    pub fn report(&self, err: TransportError, from_reader: bool) -> bool {
        let err = Arc::new(err);
        let listeners: Vec<UdpErrorHandler> = {
            let mut state = self.state.lock();
            state.last = Some(err.clone());
            state.listeners.iter().map(|(_, h)| h.clone()).collect()
        };
        for handler in &listeners {
            handler(&*err, from_reader);
        }
        !listeners.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn refused() -> TransportError {
        io::Error::from(io::ErrorKind::ConnectionRefused).into()
    }

    #[test]
    fn last_error_is_replayed_on_subscribe() {
        let hub = UdpErrorHub::default();
        assert!(!hub.report(refused(), false));
        assert!(hub.last().is_some());

        let replays = Arc::new(AtomicUsize::new(0));
        let sub = hub.subscribe({
            let replays = replays.clone();
            Arc::new(move |_, from_reader| {
                assert!(!from_reader);
                replays.fetch_add(1, Ordering::SeqCst);
            })
        });
        assert_eq!(replays.load(Ordering::SeqCst), 1);

        assert!(hub.unsubscribe(sub));
        assert!(!hub.unsubscribe(sub));
    }

    #[test]
    fn every_listener_is_notified() {
        let hub = UdpErrorHub::default();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let hits = hits.clone();
            hub.subscribe(Arc::new(move |err, from_reader| {
                assert!(from_reader);
                assert!(matches!(err, TransportError::Io(_)));
                hits.fetch_add(1, Ordering::SeqCst);
            }));
        }
        assert!(hub.report(refused(), true));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn listeners_may_reenter_the_hub() {
        let hub = Arc::new(UdpErrorHub::default());
        hub.report(refused(), false);

        let seen = Arc::new(AtomicUsize::new(0));
        let sub = hub.subscribe({
            let hub = Arc::downgrade(&hub);
            let seen = seen.clone();
            Arc::new(move |_, _| {
                let Some(hub) = hub.upgrade() else { return };
                assert!(hub.last().is_some());
                seen.fetch_add(1, Ordering::SeqCst);
            })
        });
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        assert!(hub.report(refused(), true));
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert!(hub.unsubscribe(sub));
    }
}
