// store.rs — shared telemetry: current telegram, history rings, peak

use tokio::sync::{watch, Mutex, RwLock, RwLockReadGuard};

use crate::*;

/// Short-term ring capacity: 15 minutes of once-per-second telegrams.
pub const SHORT_TERM_LOG_SIZE: usize = 900;
/// Long-term ring capacity: 24 hours of quarter-hour slots.
pub const LONG_TERM_LOG_SIZE: usize = 96;
/// Billing window length in seconds.
pub const QUARTER_HOUR_SECS: i64 = 900;

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ShortTermEntry {
    pub timestamp: i64,
    pub current_avg_demand: f32,
    pub current_power_usage: f32,
}

/// Long-term history holds the energy registers in integral Wh.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LongTermEntry {
    pub timestamp: i64,
    pub delivered_tariff1_wh: u32,
    pub delivered_tariff2_wh: u32,
    pub returned_tariff1_wh: u32,
    pub returned_tariff2_wh: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PredictedPeak {
    pub value: f32,
    pub timestamp: i64,
}

/// The quarter-hour bucket a timestamp falls into.
pub fn quarter_bucket(timestamp: i64) -> i64 {
    timestamp.div_euclid(QUARTER_HOUR_SECS)
}

/// Fixed-capacity ring with a saturating item count. `iter` walks the
/// entries in insertion order, oldest first.
pub struct RingLog<T> {
    slots: Vec<T>,
    head: usize,
    len: usize,
}

impl<T: Copy + Default> RingLog<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: vec![T::default(); capacity],
            head: 0,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append, overwriting the oldest entry once full.
    pub fn push(&mut self, entry: T) {
        self.slots[self.head] = entry;
        self.head = (self.head + 1) % self.slots.len();
        if self.len < self.slots.len() {
            self.len += 1;
        }
    }

    /// The most recently pushed entry.
    pub fn last(&self) -> Option<&T> {
        if self.len == 0 {
            return None;
        }
        Some(&self.slots[(self.head + self.slots.len() - 1) % self.slots.len()])
    }

    /// Overwrite the most recently pushed entry in place; pushes when the
    /// ring is still empty.
    pub fn replace_last(&mut self, entry: T) {
        if self.len == 0 {
            self.push(entry);
            return;
        }
        let newest = (self.head + self.slots.len() - 1) % self.slots.len();
        self.slots[newest] = entry;
    }

    /// Entries oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        let tail = (self.head + self.slots.len() - self.len) % self.slots.len();
        (0..self.len).map(move |i| &self.slots[(tail + i) % self.slots.len()])
    }

    pub fn to_vec(&self) -> Vec<T> {
        self.iter().copied().collect()
    }
}

/// All shared telemetry. Every aggregate sits behind its own lock; an
/// operation holds exactly one lock for exactly its own duration.
pub struct MeterState {
    telegram: RwLock<P1Data>,
    short_term: Mutex<RingLog<ShortTermEntry>>,
    long_term: Mutex<RingLog<LongTermEntry>>,
    predicted_peak: RwLock<PredictedPeak>,
    telegram_seq: watch::Sender<u64>,
}

impl MeterState {
    pub fn new() -> Self {
        let (telegram_seq, _) = watch::channel(0);
        Self {
            telegram: RwLock::new(P1Data::default()),
            short_term: Mutex::new(RingLog::with_capacity(SHORT_TERM_LOG_SIZE)),
            long_term: Mutex::new(RingLog::with_capacity(LONG_TERM_LOG_SIZE)),
            predicted_peak: RwLock::new(PredictedPeak::default()),
            telegram_seq,
        }
    }

    /// Replace the current telegram, then raise the "telegram available"
    /// signal. The snapshot is fully committed before the signal edge, so a
    /// consumer that wakes on it always reads the new record.
    pub async fn commit_telegram(&self, data: P1Data) {
        *self.telegram.write().await = data;
        self.telegram_seq.send_modify(|seq| *seq = seq.wrapping_add(1));
    }

    /// Read access to the current telegram, valid for the guard's lifetime.
    pub async fn telegram(&self) -> RwLockReadGuard<'_, P1Data> {
        self.telegram.read().await
    }

    /// Subscribe to the "telegram available" signal. The signal coalesces:
    /// a consumer that lags gets one wakeup for several commits.
    pub fn telegram_watch(&self) -> watch::Receiver<u64> {
        self.telegram_seq.subscribe()
    }

    pub async fn append_short_term(&self, entry: ShortTermEntry) {
        self.short_term.lock().await.push(entry);
    }

    /// One slot per quarter-hour: a sample from a new bucket advances the
    /// ring, a sample within the newest slot's bucket overwrites it, so
    /// every slot ends up holding the last observation of its quarter.
    pub async fn append_long_term(&self, entry: LongTermEntry) {
        let mut log = self.long_term.lock().await;
        match log.last() {
            Some(newest) if quarter_bucket(entry.timestamp) <= quarter_bucket(newest.timestamp) => {
                log.replace_last(entry);
            }
            _ => log.push(entry),
        }
    }

    /// Chronological copy of the short-term log.
    pub async fn short_term_items(&self) -> Vec<ShortTermEntry> {
        self.short_term.lock().await.to_vec()
    }

    /// Chronological copy of the long-term log.
    pub async fn long_term_items(&self) -> Vec<LongTermEntry> {
        self.long_term.lock().await.to_vec()
    }

    pub async fn predicted_peak(&self) -> PredictedPeak {
        *self.predicted_peak.read().await
    }

    pub async fn set_predicted_peak(&self, peak: PredictedPeak) {
        *self.predicted_peak.write().await = peak;
    }
}

impl Default for MeterState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn short(timestamp: i64, demand: f32) -> ShortTermEntry {
        ShortTermEntry {
            timestamp,
            current_avg_demand: demand,
            current_power_usage: demand,
        }
    }

    fn long(timestamp: i64, wh: u32) -> LongTermEntry {
        LongTermEntry {
            timestamp,
            delivered_tariff1_wh: wh,
            ..Default::default()
        }
    }

    #[test]
    fn ring_fills_then_wraps_in_order() {
        let mut ring = RingLog::with_capacity(4);
        for i in 0..6 {
            ring.push(short(i, i as f32));
        }
        assert_eq!(ring.len(), 4);
        let timestamps: Vec<i64> = ring.iter().map(|e| e.timestamp).collect();
        assert_eq!(timestamps, vec![2, 3, 4, 5]);
        assert_eq!(ring.last().unwrap().timestamp, 5);
    }

    #[test]
    fn ring_replace_last() {
        let mut ring = RingLog::with_capacity(3);
        ring.replace_last(short(1, 1.0));
        assert_eq!(ring.len(), 1);
        ring.push(short(2, 2.0));
        ring.replace_last(short(3, 3.0));
        assert_eq!(ring.len(), 2);
        let timestamps: Vec<i64> = ring.iter().map(|e| e.timestamp).collect();
        assert_eq!(timestamps, vec![1, 3]);
    }

    #[tokio::test]
    async fn short_term_count_saturates() {
        let meter = MeterState::new();
        for i in 0..(SHORT_TERM_LOG_SIZE as i64 + 10) {
            meter.append_short_term(short(i, 0.0)).await;
        }
        let items = meter.short_term_items().await;
        assert_eq!(items.len(), SHORT_TERM_LOG_SIZE);
        assert!(items.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        assert_eq!(items[0].timestamp, 10);
    }

    #[tokio::test]
    async fn long_term_keeps_one_entry_per_quarter() {
        let meter = MeterState::new();
        meter.append_long_term(long(100, 1)).await;
        meter.append_long_term(long(200, 2)).await;
        meter.append_long_term(long(899, 3)).await;

        let items = meter.long_term_items().await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].delivered_tariff1_wh, 3);

        meter.append_long_term(long(900, 4)).await;
        let items = meter.long_term_items().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[1].delivered_tariff1_wh, 4);
    }

    #[tokio::test]
    async fn commit_raises_signal_after_snapshot_is_visible() {
        let meter = MeterState::new();
        let mut signal = meter.telegram_watch();
        assert!(!signal.has_changed().unwrap());

        let data = P1Data {
            current_power_usage: 0.532,
            ..Default::default()
        };
        meter.commit_telegram(data).await;

        signal.changed().await.unwrap();
        assert_eq!(meter.telegram().await.current_power_usage, 0.532);
    }

    #[tokio::test]
    async fn signal_coalesces_for_lagging_consumers() {
        let meter = MeterState::new();
        let mut signal = meter.telegram_watch();
        meter.commit_telegram(P1Data::default()).await;
        meter.commit_telegram(P1Data::default()).await;

        signal.changed().await.unwrap();
        // Both commits collapsed into a single pending wakeup.
        assert!(!signal.has_changed().unwrap());
    }

    #[tokio::test]
    async fn assembled_valid_frame_commits_once_and_signals_once() {
        let body = "/FLU5\\x\r\n1-0:1.7.0(00.532*kW)\r\n!";
        let mut frame = body.as_bytes().to_vec();
        let trailer = format!("{:04X}\r\n", P1_CRC.checksum(&frame));
        frame.extend_from_slice(trailer.as_bytes());

        let meter = MeterState::new();
        let mut signal = meter.telegram_watch();
        let mut assembler = TelegramAssembler::new();
        let mut parsed = Vec::new();
        // Delivery split across two reads assembles like a single one.
        let (a, b) = frame.split_at(11);
        for chunk in [a, b] {
            assembler.feed(chunk, |telegram| parsed.extend(parse_telegram(telegram)));
        }
        for data in parsed.drain(..) {
            meter.commit_telegram(data).await;
        }

        signal.changed().await.unwrap();
        assert!(!signal.has_changed().unwrap());
        assert_eq!(meter.telegram().await.current_power_usage, 0.532);
    }

    #[tokio::test]
    async fn corrupted_frame_neither_commits_nor_signals() {
        let body = "/FLU5\\x\r\n1-0:1.7.0(00.532*kW)\r\n!";
        let mut frame = body.as_bytes().to_vec();
        let trailer = format!("{:04X}\r\n", P1_CRC.checksum(&frame) ^ 0x0001);
        frame.extend_from_slice(trailer.as_bytes());

        let meter = MeterState::new();
        let mut signal = meter.telegram_watch();
        let mut assembler = TelegramAssembler::new();
        let mut parsed = Vec::new();
        assembler.feed(&frame, |telegram| parsed.extend(parse_telegram(telegram)));

        assert!(parsed.is_empty());
        assert!(!signal.has_changed().unwrap());
        assert_eq!(meter.telegram().await.current_power_usage, 0.0);
    }

    #[tokio::test]
    async fn predicted_peak_is_replaced_whole() {
        let meter = MeterState::new();
        assert_eq!(meter.predicted_peak().await, PredictedPeak::default());
        let peak = PredictedPeak {
            value: 3.5,
            timestamp: 900,
        };
        meter.set_predicted_peak(peak).await;
        assert_eq!(meter.predicted_peak().await, peak);
    }
}
// EOF
