//! Network reachability signal.

use tokio::sync::watch;

/// Whether the device currently believes it can reach the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Online,
    Offline,
}

impl Connectivity {
    pub fn is_online(self) -> bool {
        self == Connectivity::Online
    }
}

impl From<bool> for Connectivity {
    fn from(online: bool) -> Self {
        if online {
            Connectivity::Online
        } else {
            Connectivity::Offline
        }
    }
}

/// Source of connectivity transitions.
///
/// Platforms wire their reachability API behind this trait; the remote
/// adapter only needs the latest value and a wake-up on change.
pub trait ConnectivityObserver: Send + Sync {
    fn subscribe(&self) -> watch::Receiver<Connectivity>;
}

/// Manually driven connectivity source.
pub struct ConnectivityMonitor {
    tx: watch::Sender<Connectivity>,
}

impl ConnectivityMonitor {
    pub fn new(initial: Connectivity) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    pub fn current(&self) -> Connectivity {
        *self.tx.borrow()
    }

    /// Publish a new value; subscribers only wake on an actual change.
    pub fn set(&self, connectivity: Connectivity) {
        self.tx.send_if_modified(|current| {
            if *current == connectivity {
                false
            } else {
                *current = connectivity;
                true
            }
        });
    }

    pub fn set_online(&self) {
        self.set(Connectivity::Online);
    }

    pub fn set_offline(&self) {
        self.set(Connectivity::Offline);
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(Connectivity::Online)
    }
}

impl ConnectivityObserver for ConnectivityMonitor {
    fn subscribe(&self) -> watch::Receiver<Connectivity> {
        self.tx.subscribe()
    }
}
