//! Change notifications raised by the background services.

use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc as async_mpsc;
use tracing::{debug, info};

use crate::work::ServiceStatus;

#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// Human readable progress message.
    Status(String),
    /// The scheduler's state, text or CPU level changed.
    WorkStatus(ServiceStatus),
    /// Folders or their image sets changed on disk.
    FoldersChanged,
    /// The cached copy of an image is stale.
    CacheEvicted(i64),
    /// Metadata write-back finished for an image.
    MetadataWritten {
        image_id: i64,
        written: usize,
        failed: usize,
    },
}

/// Receiver of notifications. Implementations must not block.
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Writes notifications to the log.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notification: Notification) {
        match notification {
            Notification::Status(text) => info!("{}", text),
            Notification::WorkStatus(status) => debug!(
                status = status.status.as_str(),
                cpu = status.cpu_level,
                "{}",
                status.status_text
            ),
            Notification::FoldersChanged => info!("Folders changed"),
            Notification::CacheEvicted(id) => debug!(image_id = id, "Cache entry evicted"),
            Notification::MetadataWritten {
                image_id,
                written,
                failed,
            } => debug!(image_id, written, failed, "Metadata written"),
        }
    }
}

/// Forwards notifications to a channel. A closed receiver is ignored.
pub struct ChannelNotifier {
    tx: mpsc::Sender<Notification>,
}

impl ChannelNotifier {
    pub fn new(tx: mpsc::Sender<Notification>) -> Self {
        Self { tx }
    }

    pub fn pair() -> (Self, mpsc::Receiver<Notification>) {
        let (tx, rx) = mpsc::channel();
        (Self::new(tx), rx)
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, notification: Notification) {
        let _ = self.tx.send(notification);
    }
}

/// Collapses bursts of events into one callback.
///
/// After the first event the conflator waits until `window` passes with no
/// further events, then invokes the callback once. Must be created inside a
/// tokio runtime.
pub struct EventConflator {
    tx: async_mpsc::UnboundedSender<()>,
}

impl EventConflator {
    pub fn spawn<F>(window: Duration, callback: F) -> Self
    where
        F: Fn() + Send + 'static,
    {
        let (tx, mut rx) = async_mpsc::unbounded_channel::<()>();

        tokio::spawn(async move {
            while rx.recv().await.is_some() {
                loop {
                    match tokio::time::timeout(window, rx.recv()).await {
                        Ok(Some(())) => continue,
                        Ok(None) => {
                            callback();
                            return;
                        }
                        Err(_) => break,
                    }
                }
                callback();
            }
        });

        Self { tx }
    }

    pub fn event(&self) {
        let _ = self.tx.send(());
    }
}

/// Delays and coalesces [`Notification::FoldersChanged`]; everything else passes straight through.
pub struct ConflatingNotifier {
    inner: Arc<dyn Notifier>,
    folders_changed: EventConflator,
}

impl ConflatingNotifier {
    pub fn new(inner: Arc<dyn Notifier>, window: Duration) -> Self {
        let target = Arc::clone(&inner);
        let folders_changed = EventConflator::spawn(window, move || {
            target.notify(Notification::FoldersChanged);
        });
        Self {
            inner,
            folders_changed,
        }
    }
}

impl Notifier for ConflatingNotifier {
    fn notify(&self, notification: Notification) {
        match notification {
            Notification::FoldersChanged => self.folders_changed.event(),
            other => self.inner.notify(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_conflator_coalesces_burst() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let conflator = EventConflator::spawn(Duration::from_millis(50), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        for _ in 0..5 {
            conflator.event();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // A later burst fires again
        conflator.event();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_conflating_notifier_passes_other_events() {
        let (channel, rx) = ChannelNotifier::pair();
        let notifier = ConflatingNotifier::new(Arc::new(channel), Duration::from_millis(30));

        notifier.notify(Notification::FoldersChanged);
        notifier.notify(Notification::CacheEvicted(7));
        notifier.notify(Notification::FoldersChanged);

        assert_eq!(rx.recv().unwrap(), Notification::CacheEvicted(7));
        tokio::time::sleep(Duration::from_millis(200)).await;

        let rest: Vec<Notification> = rx.try_iter().collect();
        assert_eq!(rest, vec![Notification::FoldersChanged]);
    }
}
