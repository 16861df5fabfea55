//! Lifecycle event notifications.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

/// Everything observable about a store's lifecycle, as one variant enum.
#[derive(Clone, Debug)]
pub enum IndexEvent {
    Init,
    /// No store file existed on init.
    NoIndex,
    /// The file existed but was dirty or unreadable.
    NotValidIndex,
    Rebuilding,
    Rebuilt { nodes: u64 },
    CleanupRegistered,
    CleanupStarted,
    CleanupFinished {
        pages_visited: u64,
        tree_nodes: u64,
        pages_reclaimed: u64,
        duration: Duration,
    },
    CleanupClosed,
    CleanupFailed { error: String },
}

pub trait MonitorSink: Send + Sync {
    fn notify(&self, event: &IndexEvent);
}

/// Fan-out registry for monitor sinks. Cloning shares the registry.
#[derive(Clone, Default)]
pub struct Monitors {
    sinks: Arc<RwLock<Vec<Arc<dyn MonitorSink>>>>,
}

impl Monitors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, sink: Arc<dyn MonitorSink>) {
        self.sinks.write().push(sink);
    }

    pub(crate) fn emit(&self, event: IndexEvent) {
        for sink in self.sinks.read().iter() {
            sink.notify(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct Collecting(Mutex<Vec<String>>);

    impl MonitorSink for Collecting {
        fn notify(&self, event: &IndexEvent) {
            self.0.lock().push(format!("{event:?}"));
        }
    }

    #[test]
    fn every_registered_sink_hears_every_event() {
        let monitors = Monitors::new();
        let first = Arc::new(Collecting(Mutex::new(Vec::new())));
        let second = Arc::new(Collecting(Mutex::new(Vec::new())));
        monitors.register(first.clone());
        monitors.register(second.clone());
        monitors.emit(IndexEvent::Rebuilding);
        monitors.emit(IndexEvent::Rebuilt { nodes: 3 });
        assert_eq!(first.0.lock().len(), 2);
        assert_eq!(second.0.lock().as_slice(), first.0.lock().as_slice());
    }
}
