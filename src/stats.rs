//! I/O statistics: marks, windows and aggregated summaries.
//!
//! Proxies record one [`IoMark`] per completed read or write. A sliding
//! window of marks condenses into an [`IoStatSummary`]; the aggregation
//! layer buckets summaries per application/uid/gid into [`Bin`]s, a ring of
//! which forms the telemetry window exposed to the embedder.
use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::*;

use crate::error::Error;

/// A single recorded I/O operation. Immutable once created.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IoMark {
    pub at: SystemTime,
    pub bytes: u64,
}

impl IoMark {
    pub fn now(bytes: u64) -> Self {
        Self {
            at: SystemTime::now(),
            bytes,
        }
    }
}

/// Spread statistics over a set of per-second transfer rates.
///
/// Rates are recorded incrementally; the running sum of squared deviations
/// keeps each update O(1) and two accumulators can be combined exactly, so
/// per-stream statistics fold into per-application ones without revisiting
/// the marks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Bandwidth {
    samples: usize,
    mean: f64,
    /// Running sum of squared deviations from the mean.
    m2: f64,
    peak: f64,
    floor: f64,
}

impl Bandwidth {
    pub fn record(&mut self, rate: f64) {
        if !rate.is_finite() {
            return;
        }
        if self.samples == 0 {
            self.peak = rate;
            self.floor = rate;
        } else {
            self.peak = self.peak.max(rate);
            self.floor = self.floor.min(rate);
        }
        self.samples += 1;
        let delta = rate - self.mean;
        self.mean += delta / self.samples as f64;
        self.m2 += delta * (rate - self.mean);
    }

    pub fn samples(&self) -> usize {
        self.samples
    }
    pub fn is_empty(&self) -> bool {
        self.samples == 0
    }
    /// Mean rate in bytes per second.
    pub fn mean(&self) -> f64 {
        self.mean
    }
    pub fn stddev(&self) -> f64 {
        if self.samples == 0 {
            0.0
        } else {
            (self.m2 / self.samples as f64).sqrt()
        }
    }
    pub fn peak(&self) -> f64 {
        self.peak
    }
    pub fn floor(&self) -> f64 {
        self.floor
    }

    /// Combine two rate sets, exactly as if every sample had been recorded
    /// into a single accumulator.
    pub fn combine(&self, other: &Bandwidth) -> Bandwidth {
        if self.is_empty() {
            return other.clone();
        }
        if other.is_empty() {
            return self.clone();
        }
        let n = self.samples + other.samples;
        let mean =
            (self.mean * self.samples as f64 + other.mean * other.samples as f64) / n as f64;
        let shift = other.mean - self.mean;
        let m2 = self.m2
            + other.m2
            + shift * shift * (self.samples as f64 * other.samples as f64) / n as f64;
        Bandwidth {
            samples: n,
            mean,
            m2,
            peak: self.peak.max(other.peak),
            floor: self.floor.min(other.floor),
        }
    }
}

impl std::fmt::Display for Bandwidth {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        if self.is_empty() {
            write!(f, "-")
        } else {
            write!(
                f,
                "{:.0} B/s (sd {:.0}, {:.0}..{:.0}, n={})",
                self.mean,
                self.stddev(),
                self.floor,
                self.peak,
                self.samples
            )
        }
    }
}

/// Sliding window of marks for one direction of one stream.
#[derive(Debug)]
pub struct IoStat {
    window: Duration,
    marks: Mutex<VecDeque<IoMark>>,
}

impl IoStat {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            marks: Mutex::new(VecDeque::new()),
        }
    }

    pub fn add(&self, mark: IoMark) {
        let mut marks = self.marks.lock();
        marks.push_back(mark);
        Self::prune(&mut marks, self.window);
    }

    fn prune(marks: &mut VecDeque<IoMark>, window: Duration) {
        let cutoff = SystemTime::now() - window;
        while marks.front().map(|m| m.at < cutoff).unwrap_or(false) {
            marks.pop_front();
        }
    }

    pub fn samples(&self) -> usize {
        let mut marks = self.marks.lock();
        Self::prune(&mut marks, self.window);
        marks.len()
    }

    /// Bandwidth over the window as the spread of per-second byte rates;
    /// `None` when the window holds no marks.
    pub fn bandwidth(&self) -> Option<Bandwidth> {
        let mut marks = self.marks.lock();
        Self::prune(&mut marks, self.window);
        if marks.is_empty() {
            return None;
        }
        let mut per_second: BTreeMap<u64, u64> = BTreeMap::new();
        for m in marks.iter() {
            let sec = m
                .at
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs();
            *per_second.entry(sec).or_default() += m.bytes;
        }
        let mut bw = Bandwidth::default();
        for bytes in per_second.values() {
            bw.record(*bytes as f64);
        }
        Some(bw)
    }

    /// Operations per second over `seconds`; rejects a zero divisor.
    pub fn iops(&self, seconds: u64) -> Result<f64, Error> {
        if seconds == 0 {
            return Err(Error::InvalidArgument("zero seconds for rate calculation"));
        }
        Ok(self.samples() as f64 / seconds as f64)
    }

    pub fn total_bytes(&self) -> u64 {
        let mut marks = self.marks.lock();
        Self::prune(&mut marks, self.window);
        marks.iter().map(|m| m.bytes).sum()
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}

/// Aggregated read and write statistics over a window.
///
/// `read_bandwidth`/`write_bandwidth` stay `None` when no samples were seen;
/// serialization preserves that distinction from an all-zero summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct IoStatSummary {
    pub read_bandwidth: Option<Bandwidth>,
    pub write_bandwidth: Option<Bandwidth>,
    pub read_samples: usize,
    pub write_samples: usize,
    pub read_iops: f64,
    pub write_iops: f64,
    pub window_secs: u64,
}

impl IoStatSummary {
    pub fn collect(read: &IoStat, write: &IoStat) -> Result<Self, Error> {
        let window_secs = read.window().as_secs().max(write.window().as_secs());
        if window_secs == 0 {
            return Err(Error::InvalidArgument("zero seconds for rate calculation"));
        }
        Ok(Self {
            read_bandwidth: read.bandwidth(),
            write_bandwidth: write.bandwidth(),
            read_samples: read.samples(),
            write_samples: write.samples(),
            read_iops: read.iops(window_secs)?,
            write_iops: write.iops(window_secs)?,
            window_secs,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.read_samples == 0 && self.write_samples == 0
    }

    fn merge(&mut self, other: &IoStatSummary) {
        self.read_samples += other.read_samples;
        self.write_samples += other.write_samples;
        self.read_iops += other.read_iops;
        self.write_iops += other.write_iops;
        self.read_bandwidth = combine_opt(&self.read_bandwidth, &other.read_bandwidth);
        self.write_bandwidth = combine_opt(&self.write_bandwidth, &other.write_bandwidth);
        self.window_secs = self.window_secs.max(other.window_secs);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDirection {
    Read,
    Write,
}

/// One sample reported to the aggregation layer.
#[derive(Debug, Clone)]
pub struct IoSample {
    pub app: String,
    pub uid: u32,
    pub gid: u32,
    pub direction: IoDirection,
    pub mark: IoMark,
}

/// One time-bucket of per-application, per-uid and per-gid summaries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Bin {
    pub apps: BTreeMap<String, IoStatSummary>,
    pub uids: BTreeMap<u32, IoStatSummary>,
    pub gids: BTreeMap<u32, IoStatSummary>,
}

impl Bin {
    fn record(&mut self, sample: &IoSample, bin_secs: u64) {
        for summary in [
            self.apps.entry(sample.app.clone()).or_default(),
            self.uids.entry(sample.uid).or_default(),
            self.gids.entry(sample.gid).or_default(),
        ] {
            summary.window_secs = bin_secs;
            match sample.direction {
                IoDirection::Read => summary.read_samples += 1,
                IoDirection::Write => summary.write_samples += 1,
            }
        }
    }
}

/// Ring of [`Bin`]s forming the sliding aggregation window.
#[derive(Debug)]
pub struct AggregateWindow {
    bins: Mutex<VecDeque<Bin>>,
    bin_len: Duration,
    capacity: usize,
}

impl AggregateWindow {
    pub fn new(bin_len: Duration, capacity: usize) -> Self {
        let mut bins = VecDeque::with_capacity(capacity);
        bins.push_back(Bin::default());
        Self {
            bins: Mutex::new(bins),
            bin_len,
            capacity,
        }
    }

    pub fn record(&self, sample: &IoSample) {
        let mut bins = self.bins.lock();
        let bin_secs = self.bin_len.as_secs();
        bins.back_mut().unwrap().record(sample, bin_secs);
    }

    /// Close the current bin and open a fresh one, evicting the oldest when
    /// the ring is full.
    pub fn rotate(&self) {
        let mut bins = self.bins.lock();
        if bins.len() == self.capacity {
            bins.pop_front();
        }
        bins.push_back(Bin::default());
    }

    /// Fold all bins into a per-application snapshot.
    pub fn snapshot(&self) -> Bin {
        let bins = self.bins.lock();
        let mut out = Bin::default();
        for bin in bins.iter() {
            for (k, v) in &bin.apps {
                out.apps.entry(k.clone()).or_default().merge(v);
            }
            for (k, v) in &bin.uids {
                out.uids.entry(*k).or_default().merge(v);
            }
            for (k, v) in &bin.gids {
                out.gids.entry(*k).or_default().merge(v);
            }
        }
        out
    }

    pub fn bin_count(&self) -> usize {
        self.bins.lock().len()
    }
}

/// Registry of per-file I/O streams.
///
/// Every tracked stream is one `(inode, app, uid, gid)` tuple with its own
/// read and write mark windows. Queries fold the matching streams into a
/// sample-weighted bandwidth; a background cleaner prunes streams whose
/// windows have gone empty.
#[derive(Debug)]
pub struct IoMap {
    window: Duration,
    inner: Mutex<IoMapInner>,
}

#[derive(Debug, Default)]
struct IoMapInner {
    streams: BTreeMap<u64, Vec<std::sync::Arc<IoStream>>>,
    apps: std::collections::BTreeSet<String>,
    uids: std::collections::BTreeSet<u32>,
    gids: std::collections::BTreeSet<u32>,
}

/// One tracked stream: the I/O of one file on behalf of one
/// application/user/group.
#[derive(Debug)]
pub struct IoStream {
    pub ino: u64,
    pub app: String,
    pub uid: u32,
    pub gid: u32,
    reads: IoStat,
    writes: IoStat,
}

impl IoStream {
    fn new(ino: u64, app: &str, uid: u32, gid: u32, window: Duration) -> Self {
        Self {
            ino,
            app: app.to_owned(),
            uid,
            gid,
            reads: IoStat::new(window),
            writes: IoStat::new(window),
        }
    }

    fn stat(&self, direction: IoDirection) -> &IoStat {
        match direction {
            IoDirection::Read => &self.reads,
            IoDirection::Write => &self.writes,
        }
    }

    pub fn add(&self, direction: IoDirection, mark: IoMark) {
        self.stat(direction).add(mark);
    }

    pub fn bandwidth(&self, direction: IoDirection) -> Option<Bandwidth> {
        self.stat(direction).bandwidth()
    }

    pub fn summary(&self) -> Result<IoStatSummary, Error> {
        IoStatSummary::collect(&self.reads, &self.writes)
    }

    fn is_idle(&self) -> bool {
        self.reads.samples() == 0 && self.writes.samples() == 0
    }
}

/// Selector for [`IoMap`] queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamKey<'a> {
    App(&'a str),
    Uid(u32),
    Gid(u32),
}

impl IoMap {
    pub fn new(window: Duration) -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            window,
            inner: Mutex::new(IoMapInner::default()),
        })
    }

    fn stream(
        &self,
        ino: u64,
        app: &str,
        uid: u32,
        gid: u32,
    ) -> std::sync::Arc<IoStream> {
        let mut inner = self.inner.lock();
        let streams = inner.streams.entry(ino).or_default();
        if let Some(stream) = streams
            .iter()
            .find(|s| s.app == app && s.uid == uid && s.gid == gid)
        {
            return stream.clone();
        }
        let stream = std::sync::Arc::new(IoStream::new(ino, app, uid, gid, self.window));
        streams.push(stream.clone());
        inner.apps.insert(app.to_owned());
        inner.uids.insert(uid);
        inner.gids.insert(gid);
        stream
    }

    pub fn add_read(&self, ino: u64, app: &str, uid: u32, gid: u32, bytes: u64) {
        self.stream(ino, app, uid, gid)
            .add(IoDirection::Read, IoMark::now(bytes));
    }

    pub fn add_write(&self, ino: u64, app: &str, uid: u32, gid: u32, bytes: u64) {
        self.stream(ino, app, uid, gid)
            .add(IoDirection::Write, IoMark::now(bytes));
    }

    pub fn apps(&self) -> Vec<String> {
        self.inner.lock().apps.iter().cloned().collect()
    }

    pub fn uids(&self) -> Vec<u32> {
        self.inner.lock().uids.iter().copied().collect()
    }

    pub fn gids(&self) -> Vec<u32> {
        self.inner.lock().gids.iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().streams.values().map(|v| v.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn matching(&self, key: &StreamKey<'_>) -> Vec<std::sync::Arc<IoStream>> {
        let inner = self.inner.lock();
        inner
            .streams
            .values()
            .flatten()
            .filter(|s| match key {
                StreamKey::App(app) => s.app == *app,
                StreamKey::Uid(uid) => s.uid == *uid,
                StreamKey::Gid(gid) => s.gid == *gid,
            })
            .cloned()
            .collect()
    }

    /// Combined bandwidth over all streams matching the key; `None` when no
    /// matching stream holds marks.
    pub fn bandwidth(&self, key: StreamKey<'_>, direction: IoDirection) -> Option<Bandwidth> {
        let mut folded = Bandwidth::default();
        for stream in self.matching(&key) {
            if let Some(bw) = stream.bandwidth(direction) {
                folded = folded.combine(&bw);
            }
        }
        (!folded.is_empty()).then_some(folded)
    }

    /// Fold all streams matching the key into one summary.
    pub fn summary(&self, key: StreamKey<'_>) -> Result<IoStatSummary, Error> {
        let streams = self.matching(&key);
        let window_secs = self.window.as_secs();
        if window_secs == 0 {
            return Err(Error::InvalidArgument("zero seconds for rate calculation"));
        }
        let mut out = IoStatSummary {
            window_secs,
            ..Default::default()
        };
        for stream in &streams {
            out.read_samples += stream.reads.samples();
            out.write_samples += stream.writes.samples();
        }
        out.read_iops = out.read_samples as f64 / window_secs as f64;
        out.write_iops = out.write_samples as f64 / window_secs as f64;
        out.read_bandwidth = self.bandwidth(key.clone(), IoDirection::Read);
        out.write_bandwidth = self.bandwidth(key, IoDirection::Write);
        Ok(out)
    }

    /// Forget every stream of an application; returns whether any existed.
    pub fn remove_app(&self, app: &str) -> bool {
        let mut inner = self.inner.lock();
        let mut removed = false;
        for streams in inner.streams.values_mut() {
            let before = streams.len();
            streams.retain(|s| s.app != app);
            removed |= streams.len() != before;
        }
        inner.streams.retain(|_, v| !v.is_empty());
        inner.apps.remove(app);
        removed
    }

    /// Snapshot of every live stream.
    pub fn snapshot(&self) -> Vec<std::sync::Arc<IoStream>> {
        self.inner.lock().streams.values().flatten().cloned().collect()
    }

    /// Drop streams whose windows hold no marks anymore.
    pub fn prune(&self) -> usize {
        let mut inner = self.inner.lock();
        for streams in inner.streams.values_mut() {
            streams.retain(|s| !s.is_idle());
        }
        inner.streams.retain(|_, v| !v.is_empty());
        inner.streams.values().map(|v| v.len()).sum()
    }

    /// Background cleaner pruning idle streams on the window period.
    pub fn spawn_cleaner(
        self: std::sync::Arc<Self>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let this = self;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(this.window) => {
                        let left = this.prune();
                        debug!(left, "pruned idle I/O streams");
                    }
                }
            }
        })
    }
}

fn combine_opt(a: &Option<Bandwidth>, b: &Option<Bandwidth>) -> Option<Bandwidth> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.combine(b)),
        (Some(a), None) => Some(a.clone()),
        (None, b) => b.clone(),
    }
}

/// Statistics receiver: drains reported samples into the window and rotates
/// bins on a timer. The publishing/shaping counterparts of the original
/// sub-system live in the service, not in this core.
pub fn spawn_receiver(
    window: std::sync::Arc<AggregateWindow>,
    mut rx: mpsc::Receiver<IoSample>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut rotate = tokio::time::interval(window.bin_len);
        rotate.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = rotate.tick() => window.rotate(),
                sample = rx.recv() => match sample {
                    Some(sample) => window.record(&sample),
                    None => {
                        debug!("statistics channel closed");
                        return;
                    }
                },
            }
        }
    })
}
