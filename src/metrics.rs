#[cfg(feature = "metrics")]
mod imp {
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::time::Duration;

    use tracing::info;

    // Cumulative counters
    static CHANNELS_ADOPTED: AtomicU64 = AtomicU64::new(0);
    static CHANNELS_REAPED: AtomicU64 = AtomicU64::new(0);
    static ADOPTIONS_REJECTED: AtomicU64 = AtomicU64::new(0);
    static POLL_EVENTS: AtomicU64 = AtomicU64::new(0);
    static BYTES_RELAYED: AtomicU64 = AtomicU64::new(0);
    // Gauge
    static LIVE_CHANNELS: AtomicUsize = AtomicUsize::new(0);

    #[derive(Clone, Copy)]
    pub struct MetricsSnapshot {
        pub channels_adopted: u64,
        pub channels_reaped: u64,
        pub adoptions_rejected: u64,
        pub poll_events: u64,
        pub bytes_relayed: u64,
        pub live_channels: usize,
    }

    pub fn inc_channels_adopted() {
        CHANNELS_ADOPTED.fetch_add(1, Ordering::Relaxed);
        LIVE_CHANNELS.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_channels_reaped() {
        CHANNELS_REAPED.fetch_add(1, Ordering::Relaxed);
        LIVE_CHANNELS.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn inc_adoptions_rejected() {
        ADOPTIONS_REJECTED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_poll_events() {
        POLL_EVENTS.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes_relayed(count: usize) {
        BYTES_RELAYED.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn snapshot() -> MetricsSnapshot {
        MetricsSnapshot {
            channels_adopted: CHANNELS_ADOPTED.load(Ordering::Relaxed),
            channels_reaped: CHANNELS_REAPED.load(Ordering::Relaxed),
            adoptions_rejected: ADOPTIONS_REJECTED.load(Ordering::Relaxed),
            poll_events: POLL_EVENTS.load(Ordering::Relaxed),
            bytes_relayed: BYTES_RELAYED.load(Ordering::Relaxed),
            live_channels: LIVE_CHANNELS.load(Ordering::Relaxed),
        }
    }

    pub fn spawn_reporter() {
        const INTERVAL_SECS: u64 = 10;
        std::thread::spawn(|| {
            let mut last = snapshot();
            loop {
                std::thread::sleep(Duration::from_secs(INTERVAL_SECS));
                let snap = snapshot();
                info!(
                    interval_secs = INTERVAL_SECS,
                    adopted = snap.channels_adopted.saturating_sub(last.channels_adopted),
                    reaped = snap.channels_reaped.saturating_sub(last.channels_reaped),
                    rejected = snap.adoptions_rejected.saturating_sub(last.adoptions_rejected),
                    poll_events = snap.poll_events.saturating_sub(last.poll_events),
                    bytes_relayed = snap.bytes_relayed.saturating_sub(last.bytes_relayed),
                    live_channels = snap.live_channels,
                    "metrics delta"
                );
                last = snap;
            }
        });
    }
}

#[cfg(not(feature = "metrics"))]
#[allow(dead_code)]
mod imp {
    #[derive(Clone, Copy)]
    pub struct MetricsSnapshot {
        pub channels_adopted: u64,
        pub channels_reaped: u64,
        pub adoptions_rejected: u64,
        pub poll_events: u64,
        pub bytes_relayed: u64,
        pub live_channels: usize,
    }

    pub fn inc_channels_adopted() {}
    pub fn inc_channels_reaped() {}
    pub fn inc_adoptions_rejected() {}
    pub fn inc_poll_events() {}
    pub fn add_bytes_relayed(_: usize) {}
    pub fn snapshot() -> MetricsSnapshot {
        MetricsSnapshot {
            channels_adopted: 0,
            channels_reaped: 0,
            adoptions_rejected: 0,
            poll_events: 0,
            bytes_relayed: 0,
            live_channels: 0,
        }
    }
    pub fn spawn_reporter() {}
}

pub use imp::*;
