//! Distribution of decoded ECG packets to independent consumers.
//!
//! A [`StreamFanout`] takes packets from a session (via
//! [`attach`](StreamFanout::attach)) or directly (via
//! [`publish`](StreamFanout::publish)) and hands every packet to each
//! registered consumer:
//!
//! - [`ChartConsumer`]: a fixed-size [`ChartBuffer`] for live display
//! - [`AccumulatorConsumer`]: raw samples with timestamps, drained by the
//!   flush timer into the local store
//! - [`SampleSink`]: an optional bounded channel for anything else
//!
//! Every consumer has its own cancellation token, so a slow or cancelled
//! consumer never affects the others. Publishing never blocks. Chart and
//! sink consumers run in their own tasks and skip packets when they fall
//! behind. Accumulators are appended to inside `publish` and see every
//! packet.

use std::ops::ControlFlow;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use heartlink_types::{EcgPacket, SampleRecord};

use crate::clock::Clock;
use crate::error::{Error, Result};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Geometry of the live chart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChartOptions {
    /// Sampling frequency in Hz.
    /// Default: 128.
    pub frequency_hz: u16,
    /// Seconds of signal shown at once.
    /// Default: 4.
    pub time_interval_secs: u16,
    /// Samples below this are drawn at this value.
    /// Default: -2048.
    pub min_value: i16,
    /// Samples above this are drawn at this value.
    /// Default: 2047.
    pub max_value: i16,
}

impl Default for ChartOptions {
    fn default() -> Self {
        Self {
            frequency_hz: 128,
            time_interval_secs: 4,
            min_value: -2048,
            max_value: 2047,
        }
    }
}

impl ChartOptions {
    /// Set the sampling frequency.
    #[must_use]
    pub fn frequency_hz(mut self, frequency_hz: u16) -> Self {
        self.frequency_hz = frequency_hz;
        self
    }

    /// Set the visible time window.
    #[must_use]
    pub fn time_interval_secs(mut self, secs: u16) -> Self {
        self.time_interval_secs = secs;
        self
    }

    /// Set the clamp range.
    #[must_use]
    pub fn range(mut self, min_value: i16, max_value: i16) -> Self {
        self.min_value = min_value;
        self.max_value = max_value;
        self
    }

    /// Number of samples the chart holds.
    pub fn capacity(&self) -> usize {
        usize::from(self.frequency_hz) * usize::from(self.time_interval_secs)
    }

    /// Validate the options.
    pub fn validate(&self) -> Result<()> {
        if self.capacity() == 0 {
            return Err(Error::InvalidConfig(
                "chart frequency and time interval must be > 0".to_string(),
            ));
        }
        if self.min_value > self.max_value {
            return Err(Error::InvalidConfig(format!(
                "chart min_value {} exceeds max_value {}",
                self.min_value, self.max_value
            )));
        }
        Ok(())
    }
}

/// Fixed-size ring of clamped samples for display.
///
/// When the write index wraps, the whole buffer is zeroed before the next
/// write, so the chart redraws from an empty trace.
#[derive(Debug, Clone)]
pub struct ChartBuffer {
    data: Vec<i16>,
    written: u64,
    resets: u64,
    min_value: i16,
    max_value: i16,
}

impl ChartBuffer {
    /// Create a buffer from validated options.
    pub fn new(options: &ChartOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            data: vec![0; options.capacity()],
            written: 0,
            resets: 0,
            min_value: options.min_value,
            max_value: options.max_value,
        })
    }

    /// Write one sample. Returns `true` if the buffer was reset first.
    pub fn push(&mut self, sample: i16) -> bool {
        let capacity = self.data.len() as u64;
        let position = (self.written % capacity) as usize;
        let wrapped = self.written > 0 && position == 0;
        if wrapped {
            self.data.fill(0);
            self.resets += 1;
        }
        self.data[position] = sample.clamp(self.min_value, self.max_value);
        self.written += 1;
        wrapped
    }

    /// Write every sample of a packet.
    pub fn push_packet(&mut self, packet: &EcgPacket) {
        for &sample in &packet.samples {
            self.push(sample);
        }
    }

    /// The backing storage.
    pub fn samples(&self) -> &[i16] {
        &self.data
    }

    /// Always equal to [`capacity`](Self::capacity).
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Position the next sample is written to.
    pub fn write_index(&self) -> usize {
        (self.written % self.data.len() as u64) as usize
    }

    /// Total samples written since creation.
    pub fn samples_written(&self) -> u64 {
        self.written
    }

    /// How many times the buffer has been zeroed.
    pub fn reset_count(&self) -> u64 {
        self.resets
    }
}

/// Append-only list of raw sample batches.
///
/// Appends and [`drain`](Self::drain) share one mutex, so a drain sees
/// every record appended before it and none twice.
#[derive(Debug, Clone, Default)]
pub struct Accumulator {
    records: Arc<Mutex<Vec<SampleRecord>>>,
}

impl Accumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, record: SampleRecord) {
        lock(&self.records).push(record);
    }

    /// Move every record out, leaving the accumulator empty.
    pub fn drain(&self) -> Vec<SampleRecord> {
        std::mem::take(&mut *lock(&self.records))
    }

    /// Number of records waiting to be drained.
    pub fn len(&self) -> usize {
        lock(&self.records).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.records).is_empty()
    }
}

/// The task behind a consumer.
///
/// Cancelling (or dropping) the handle stops only this consumer.
#[derive(Debug)]
pub struct ConsumerHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl ConsumerHandle {
    /// Stop the consumer.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether the consumer task is still running.
    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop the consumer and wait for its task to finish.
    pub async fn shutdown(mut self) {
        self.token.cancel();
        let _ = (&mut self.task).await;
    }
}

impl Drop for ConsumerHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Live chart consumer.
#[derive(Debug)]
pub struct ChartConsumer {
    buffer: Arc<Mutex<ChartBuffer>>,
    handle: ConsumerHandle,
}

impl ChartConsumer {
    /// Copy of the current chart contents.
    pub fn snapshot(&self) -> Vec<i16> {
        lock(&self.buffer).samples().to_vec()
    }

    /// Run `f` against the buffer without copying it.
    pub fn with_buffer<R>(&self, f: impl FnOnce(&ChartBuffer) -> R) -> R {
        f(&lock(&self.buffer))
    }

    pub fn handle(&self) -> &ConsumerHandle {
        &self.handle
    }
}

/// Consumer appending raw samples to an [`Accumulator`].
#[derive(Debug)]
pub struct AccumulatorConsumer {
    accumulator: Accumulator,
    handle: ConsumerHandle,
}

impl AccumulatorConsumer {
    /// The accumulator this consumer appends to.
    pub fn accumulator(&self) -> &Accumulator {
        &self.accumulator
    }

    pub fn handle(&self) -> &ConsumerHandle {
        &self.handle
    }
}

/// Consumer forwarding samples into a bounded channel.
///
/// When the channel is full new samples are dropped.
#[derive(Debug)]
pub struct SampleSink {
    receiver: mpsc::Receiver<Vec<i16>>,
    handle: ConsumerHandle,
}

impl SampleSink {
    /// Receive the next batch of samples.
    pub async fn recv(&mut self) -> Option<Vec<i16>> {
        self.receiver.recv().await
    }

    pub fn handle(&self) -> &ConsumerHandle {
        &self.handle
    }
}

impl Stream for SampleSink {
    type Item = Vec<i16>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

#[derive(Debug)]
struct AccumulatorEntry {
    accumulator: Accumulator,
    token: CancellationToken,
}

#[derive(Debug)]
struct Shared {
    sender: broadcast::Sender<Arc<EcgPacket>>,
    accumulators: Mutex<Vec<AccumulatorEntry>>,
    clock: Arc<dyn Clock>,
}

impl Shared {
    fn publish(&self, packet: EcgPacket) -> usize {
        let appended = {
            let mut accumulators = lock(&self.accumulators);
            accumulators.retain(|entry| !entry.token.is_cancelled());
            if !accumulators.is_empty() {
                let record = SampleRecord::new(self.clock.now(), packet.samples.to_vec());
                for entry in accumulators.iter() {
                    entry.accumulator.append(record.clone());
                }
            }
            accumulators.len()
        };
        appended + self.sender.send(Arc::new(packet)).unwrap_or(0)
    }

    fn live_accumulators(&self) -> usize {
        lock(&self.accumulators)
            .iter()
            .filter(|entry| !entry.token.is_cancelled())
            .count()
    }
}

/// Fans ECG packets out to independent consumers.
#[derive(Debug)]
pub struct StreamFanout {
    shared: Arc<Shared>,
    token: CancellationToken,
}

impl StreamFanout {
    /// Create a fanout buffering up to `capacity` packets per chart or sink
    /// consumer.
    pub fn new(capacity: usize, clock: Arc<dyn Clock>) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            shared: Arc::new(Shared {
                sender,
                accumulators: Mutex::new(Vec::new()),
                clock,
            }),
            token: CancellationToken::new(),
        }
    }

    /// Hand a packet to every consumer. Never blocks.
    ///
    /// Accumulators receive the packet before this returns. Returns the
    /// number of consumers the packet was handed to.
    pub fn publish(&self, packet: EcgPacket) -> usize {
        if self.token.is_cancelled() {
            return 0;
        }
        self.shared.publish(packet)
    }

    /// Pump packets from a session's ECG stream into the fanout until the
    /// stream closes or the fanout is cancelled.
    pub fn attach(&self, mut packets: broadcast::Receiver<EcgPacket>) -> JoinHandle<()> {
        let shared = Arc::clone(&self.shared);
        let token = self.token.child_token();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    result = packets.recv() => match result {
                        Ok(packet) => {
                            shared.publish(packet);
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            debug!(skipped, "Fanout input lagged, dropping packets");
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }
            debug!("Fanout input detached");
        })
    }

    /// Register a live chart consumer.
    pub fn register_chart(&self, options: ChartOptions) -> Result<ChartConsumer> {
        let buffer = Arc::new(Mutex::new(ChartBuffer::new(&options)?));
        let task_buffer = Arc::clone(&buffer);
        let handle = self.spawn_consumer("chart", move |packet| {
            lock(&task_buffer).push_packet(packet);
            ControlFlow::Continue(())
        });
        Ok(ChartConsumer { buffer, handle })
    }

    /// Register a consumer appending raw samples to a new accumulator.
    pub fn register_accumulator(&self) -> AccumulatorConsumer {
        self.register_accumulator_with(Accumulator::new())
    }

    /// Register a consumer appending raw samples to `accumulator`.
    ///
    /// Appends happen synchronously in [`publish`](Self::publish), so no
    /// packet is skipped however far the flush timer falls behind.
    pub fn register_accumulator_with(&self, accumulator: Accumulator) -> AccumulatorConsumer {
        let token = self.token.child_token();
        lock(&self.shared.accumulators).push(AccumulatorEntry {
            accumulator: accumulator.clone(),
            token: token.clone(),
        });
        let task_token = token.clone();
        let task = tokio::spawn(async move {
            task_token.cancelled().await;
            debug!(consumer = "accumulator", "Consumer stopped");
        });
        let handle = ConsumerHandle { token, task };
        AccumulatorConsumer {
            accumulator,
            handle,
        }
    }

    /// Register a consumer forwarding samples into a channel of `capacity`
    /// batches.
    pub fn register_sink(&self, capacity: usize) -> SampleSink {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let handle = self.spawn_consumer("sink", move |packet| {
            match sender.try_send(packet.samples.to_vec()) {
                Ok(()) => ControlFlow::Continue(()),
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!(sequence = packet.sequence, "Sample sink full, dropping");
                    ControlFlow::Continue(())
                }
                Err(mpsc::error::TrySendError::Closed(_)) => ControlFlow::Break(()),
            }
        });
        SampleSink { receiver, handle }
    }

    /// Number of live consumers.
    pub fn consumer_count(&self) -> usize {
        self.shared.sender.receiver_count() + self.shared.live_accumulators()
    }

    /// Cancel every consumer and any attached input.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    fn spawn_consumer<F>(&self, name: &'static str, mut on_packet: F) -> ConsumerHandle
    where
        F: FnMut(&EcgPacket) -> ControlFlow<()> + Send + 'static,
    {
        // Subscribe before spawning so no packet published after
        // registration is missed.
        let mut packets = self.shared.sender.subscribe();
        let token = self.token.child_token();
        let task_token = token.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = task_token.cancelled() => break,
                    result = packets.recv() => match result {
                        Ok(packet) => {
                            if on_packet(&packet).is_break() {
                                break;
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            debug!(consumer = name, skipped, "Consumer lagged, dropping packets");
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }
            debug!(consumer = name, "Consumer stopped");
        });
        ConsumerHandle { token, task }
    }
}

impl Drop for StreamFanout {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use futures::StreamExt;
    use time::OffsetDateTime;

    use crate::clock::ManualClock;

    fn fanout() -> (Arc<ManualClock>, StreamFanout) {
        let clock = Arc::new(ManualClock::new(OffsetDateTime::UNIX_EPOCH));
        let fanout = StreamFanout::new(64, clock.clone());
        (clock, fanout)
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn test_chart_capacity() {
        let options = ChartOptions::default();
        assert_eq!(options.capacity(), 512);
        let buffer = ChartBuffer::new(&options).unwrap();
        assert_eq!(buffer.len(), 512);
        assert!(buffer.samples().iter().all(|&s| s == 0));
    }

    #[test]
    fn test_chart_options_validation() {
        assert!(ChartOptions::default().frequency_hz(0).validate().is_err());
        assert!(ChartOptions::default().range(10, -10).validate().is_err());
        assert!(ChartOptions::default().range(-10, 10).validate().is_ok());
    }

    #[test]
    fn test_chart_resets_once_after_wrap() {
        let options = ChartOptions::default()
            .frequency_hz(128)
            .time_interval_secs(4);
        let mut buffer = ChartBuffer::new(&options).unwrap();

        let mut resets_at = Vec::new();
        for i in 0..513u32 {
            if buffer.push(1) {
                resets_at.push(i);
            }
            assert_eq!(buffer.len(), 512);
        }

        assert_eq!(resets_at, vec![512]);
        assert_eq!(buffer.reset_count(), 1);
        assert_eq!(buffer.write_index(), 1);
        // Only the sample written after the reset survives.
        assert_eq!(buffer.samples()[0], 1);
        assert!(buffer.samples()[1..].iter().all(|&s| s == 0));
    }

    #[test]
    fn test_chart_clamps() {
        let options = ChartOptions::default()
            .frequency_hz(2)
            .time_interval_secs(2)
            .range(-100, 100);
        let mut buffer = ChartBuffer::new(&options).unwrap();
        buffer.push(500);
        buffer.push(-500);
        buffer.push(42);
        assert_eq!(buffer.samples(), &[100, -100, 42, 0]);
    }

    #[test]
    fn test_accumulator_drain_moves_records() {
        let accumulator = Accumulator::new();
        accumulator.append(SampleRecord::new(OffsetDateTime::UNIX_EPOCH, vec![1, 2]));
        accumulator.append(SampleRecord::new(OffsetDateTime::UNIX_EPOCH, vec![3, 4]));
        assert_eq!(accumulator.len(), 2);

        let drained = accumulator.drain();
        assert_eq!(drained.len(), 2);
        assert!(accumulator.is_empty());
        assert!(accumulator.drain().is_empty());
    }

    #[tokio::test]
    async fn test_chart_clamps_but_accumulator_keeps_raw() {
        let (clock, fanout) = fanout();
        let chart = fanout
            .register_chart(
                ChartOptions::default()
                    .frequency_hz(4)
                    .time_interval_secs(1)
                    .range(-1000, 1000),
            )
            .unwrap();
        let accumulated = fanout.register_accumulator();

        clock.advance(Duration::from_secs(5));
        assert_eq!(fanout.publish(EcgPacket::with_samples(1, [5000, -5000])), 2);
        settle().await;

        assert_eq!(chart.snapshot(), vec![1000, -1000, 0, 0]);
        let records = accumulated.accumulator().drain();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].samples, vec![5000, -5000]);
        assert_eq!(records[0].timestamp.unix_timestamp(), 5);
    }

    #[tokio::test]
    async fn test_accumulator_sees_every_packet_past_channel_capacity() {
        let (_clock, fanout) = fanout();
        let accumulated = fanout.register_accumulator();
        let chart = fanout.register_chart(ChartOptions::default()).unwrap();

        // Nothing is polled until `settle`, so the broadcast channel (64)
        // overflows while the accumulator must not.
        for sequence in 0..100 {
            fanout.publish(EcgPacket::with_samples(sequence, [sequence as i16, 0]));
        }
        settle().await;

        let records = accumulated.accumulator().drain();
        assert_eq!(records.len(), 100);
        assert_eq!(records[99].samples, vec![99, 0]);
        assert!(chart.with_buffer(|buffer| buffer.samples_written()) < 200);
    }

    #[tokio::test]
    async fn test_chart_wraps_through_fanout() {
        let (_clock, fanout) = fanout();
        let chart = fanout
            .register_chart(ChartOptions::default().frequency_hz(128).time_interval_secs(4))
            .unwrap();

        // 256 packets of two samples fill the 512-sample chart exactly.
        for sequence in 0..256u32 {
            fanout.publish(EcgPacket::with_samples(sequence, [1, 1]));
            if sequence % 32 == 31 {
                settle().await;
            }
        }
        settle().await;
        chart.with_buffer(|buffer| {
            assert_eq!(buffer.samples_written(), 512);
            assert_eq!(buffer.reset_count(), 0);
            assert!(buffer.samples().iter().all(|&s| s == 1));
        });

        // The 513th sample wraps, resets once and lands at index 0.
        fanout.publish(EcgPacket::with_samples(256, [2, 3]));
        settle().await;
        chart.with_buffer(|buffer| {
            assert_eq!(buffer.samples_written(), 514);
            assert_eq!(buffer.reset_count(), 1);
            assert_eq!(buffer.len(), 512);
            assert_eq!(&buffer.samples()[..2], &[2, 3]);
            assert!(buffer.samples()[2..].iter().all(|&s| s == 0));
        });
    }

    #[tokio::test]
    async fn test_cancelling_one_consumer_leaves_others() {
        let (_clock, fanout) = fanout();
        let chart = fanout.register_chart(ChartOptions::default()).unwrap();
        let accumulated = fanout.register_accumulator();
        let mut sink = fanout.register_sink(8);

        chart.handle().cancel();
        settle().await;
        assert!(!chart.handle().is_active());

        fanout.publish(EcgPacket::with_samples(1, [7, 8]));
        settle().await;

        assert!(chart.snapshot().iter().all(|&s| s == 0));
        assert_eq!(accumulated.accumulator().len(), 1);
        assert_eq!(sink.recv().await, Some(vec![7, 8]));
        assert!(accumulated.handle().is_active());
    }

    #[tokio::test]
    async fn test_full_sink_does_not_block_others() {
        let (_clock, fanout) = fanout();
        let accumulated = fanout.register_accumulator();
        let mut sink = fanout.register_sink(1);

        for sequence in 0..5 {
            fanout.publish(EcgPacket::with_samples(sequence, [0, 0]));
        }
        settle().await;

        assert_eq!(accumulated.accumulator().len(), 5);
        // Only the first batch fit; the rest were dropped.
        assert_eq!(sink.next().await, Some(vec![0, 0]));
        assert!(sink.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cancel_fanout_stops_all_consumers() {
        let (_clock, fanout) = fanout();
        let chart = fanout.register_chart(ChartOptions::default()).unwrap();
        let accumulated = fanout.register_accumulator();

        fanout.cancel();
        settle().await;

        assert!(fanout.is_cancelled());
        assert!(!chart.handle().is_active());
        assert!(!accumulated.handle().is_active());
    }

    #[tokio::test]
    async fn test_attach_pumps_session_stream() {
        let (_clock, fanout) = fanout();
        let accumulated = fanout.register_accumulator();
        let (tx, rx) = broadcast::channel(16);
        let pump = fanout.attach(rx);

        tx.send(EcgPacket::with_samples(1, [1, 2])).unwrap();
        tx.send(EcgPacket::with_samples(2, [3, 4])).unwrap();
        drop(tx);
        pump.await.unwrap();
        settle().await;

        let samples: Vec<_> = accumulated
            .accumulator()
            .drain()
            .into_iter()
            .flat_map(|r| r.samples)
            .collect();
        assert_eq!(samples, vec![1, 2, 3, 4]);
    }
}
