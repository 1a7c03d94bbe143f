//! Container event watcher.
//!
//! Supervises the event-source subprocess (`docker events` by default),
//! parses its line-delimited JSON output, filters and enriches container
//! lifecycle events, and relays them to core. The supervisor recovers from
//! subprocess death with exponential backoff and never propagates a failure
//! out of the subsystem.

mod enrich;
mod event;
mod line_parser;
mod supervisor;

pub use enrich::{DockerInspector, EventEnricher};
pub use event::EventFilter;
pub use supervisor::EventWatcher;

pub(crate) use enrich::{split_image_reference, state_label};

use std::sync::atomic::{AtomicU32, Ordering};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[repr(u32)]
pub enum WatcherState {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
}

impl WatcherState {
    #[inline]
    fn from_u32(val: u32) -> WatcherState {
        match val {
            0 => WatcherState::Stopped,
            1 => WatcherState::Starting,
            2 => WatcherState::Running,
            3 => WatcherState::Stopping,
            _ => panic!("Impossible"),
        }
    }
    #[inline]
    fn into_u32(self) -> u32 {
        self as u32
    }
}

impl AsRef<str> for WatcherState {
    fn as_ref(&self) -> &str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
        }
    }
}

pub(crate) struct AtomicWatcherState(AtomicU32);

impl AtomicWatcherState {
    pub(crate) fn new(val: WatcherState) -> Self {
        AtomicWatcherState(AtomicU32::new(val as u32))
    }
    pub(crate) fn load(&self, ordering: Ordering) -> WatcherState {
        WatcherState::from_u32(self.0.load(ordering))
    }
    pub(crate) fn store(&self, value: WatcherState, ordering: Ordering) {
        self.0.store(value.into_u32(), ordering)
    }
}
