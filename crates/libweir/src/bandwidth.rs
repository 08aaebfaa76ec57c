use std::collections::VecDeque;

use crate::type_aliases::PeerHandle;

/// Slots in the per-peer rate history ring. One slot per second.
pub(crate) const RATEHISTORY: usize = 20;

/// Global token buckets for inbound and outbound bytes, refilled once
/// per second, plus the FIFO queues of peers parked when a bucket ran
/// dry. A cap of 0 means unlimited.
pub(crate) struct Bandwidth {
    pub ibwlim: u64,
    pub obwlim: u64,
    pub ibw_left: u64,
    pub obw_left: u64,
    /// Monotonic second counter, bumped by the heartbeat.
    pub seconds: u64,
    pub readq: VecDeque<PeerHandle>,
    pub writeq: VecDeque<PeerHandle>,
}

impl Bandwidth {
    pub fn new(download_bps: u64, upload_bps: u64) -> Self {
        Self {
            ibwlim: download_bps,
            obwlim: upload_bps,
            ibw_left: download_bps,
            obw_left: upload_bps,
            seconds: 0,
            readq: VecDeque::new(),
            writeq: VecDeque::new(),
        }
    }

    /// Start a new second: advance the clock and refill both buckets.
    pub fn tick(&mut self) {
        self.seconds += 1;
        self.ibw_left = self.ibwlim;
        self.obw_left = self.obwlim;
    }

    pub fn slot(&self) -> usize {
        self.seconds as usize % RATEHISTORY
    }

    pub fn unlink(&mut self, h: PeerHandle) {
        self.readq.retain(|x| *x != h);
        self.writeq.retain(|x| *x != h);
    }
}
