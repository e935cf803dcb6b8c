use chrono::{DateTime, Utc};
use std::net::Ipv4Addr;
use tokio::sync::mpsc::{self, error::TrySendError};

/// Tells the control plane that a service address was seen on the
/// outgoing path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MissEvent {
    pub timestamp: DateTime<Utc>,
    pub service: Ipv4Addr,
}

/// Sending half of the notification channel. Never blocks, a full or
/// closed channel loses the event.
#[derive(Clone)]
pub struct MissNotifier {
    tx: Option<mpsc::Sender<MissEvent>>,
}

pub fn channel(capacity: usize) -> (MissNotifier, mpsc::Receiver<MissEvent>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (MissNotifier { tx: Some(tx) }, rx)
}

impl MissNotifier {
    /// A notifier without a consumer, every event is lost.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Returns false if the event was not queued.
    pub fn notify(&self, service: u32) -> bool {
        let Some(tx) = &self.tx else {
            return false;
        };

        let event = MissEvent {
            timestamp: Utc::now(),
            service: Ipv4Addr::from(service),
        };

        match tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_channel_loses_events() {
        let (notifier, mut rx) = channel(2);
        assert!(notifier.notify(1));
        assert!(notifier.notify(2));
        assert!(!notifier.notify(3));

        let ev = rx.try_recv().unwrap();
        assert_eq!(ev.service, Ipv4Addr::from(1));
        assert_eq!(rx.try_recv().unwrap().service, Ipv4Addr::from(2));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn closed_or_disabled_never_blocks() {
        let (notifier, rx) = channel(1);
        drop(rx);
        assert!(!notifier.notify(1));
        assert!(!MissNotifier::disabled().notify(1));
    }
}
