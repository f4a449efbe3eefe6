//! Background firmware streaming.
//!
//! An upload runs on its own thread which owns the port for the whole
//! session. The thread pulls chunks from a source, frames them into FIFO
//! writes and keeps at most [`ACK_WINDOW`] writes unacknowledged:
//!
//! ```text
//!            chunk          ack window full
//!  Idle ──► Streaming ──────────────┐
//!              │   ▲  wait_ack      │
//!              │   └────────────────┘
//!              │ source exhausted
//!              ▼
//!           Draining ──► Done
//!              │
//!   any error  ▼
//!            Failed
//! ```
//!
//! Progress is reported at most every [`PROGRESS_INTERVAL`] and the sink
//! always receives exactly one [`Progress::Finished`], as its last call.

use {
    crate::{
        error::{Error, Result},
        port::Port,
        protocol::fifo::{self, MAX_CHUNK},
    },
    log::{debug, info, warn},
    std::{
        io::{self, Cursor, Read},
        thread::{self, JoinHandle},
        time::{Duration, Instant},
    },
};

/// Maximum number of FIFO writes allowed in flight without an ack.
///
/// Approximates the device-side buffering; targets with smaller buffers
/// need a smaller window (see [`UploadOptions::with_ack_window`]).
pub const ACK_WINDOW: usize = 6;

/// Minimum spacing between two progress notifications.
pub const PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

/// Progress notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Total bytes handed to the device so far.
    Sent(u64),
    /// The session ended, successfully or not. Always the last notification.
    Finished,
}

impl Progress {
    /// Integer form used by callers that expect `-1` as the end marker.
    #[must_use]
    pub fn as_raw(self) -> i64 {
        match self {
            Self::Sent(bytes) => i64::try_from(bytes).unwrap_or(i64::MAX),
            Self::Finished => -1,
        }
    }

    /// Whether this is the terminal notification.
    #[must_use]
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Finished)
    }
}

/// Receiver of upload progress, called from the upload thread.
pub trait ProgressSink: Send {
    /// Handle one notification.
    fn notify(&mut self, progress: Progress);
}

impl<F> ProgressSink for F
where
    F: FnMut(Progress) + Send,
{
    fn notify(&mut self, progress: Progress) {
        self(progress);
    }
}

/// Sink that ignores every notification.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn notify(&mut self, _progress: Progress) {}
}

/// Tunables for the streaming loop.
#[derive(Debug, Clone)]
pub struct UploadOptions {
    /// Maximum unacknowledged FIFO writes.
    pub ack_window: usize,
    /// Minimum time between progress notifications.
    pub progress_interval: Duration,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            ack_window: ACK_WINDOW,
            progress_interval: PROGRESS_INTERVAL,
        }
    }
}

impl UploadOptions {
    /// Set the ack window. Values below 1 are raised to 1.
    #[must_use]
    pub fn with_ack_window(mut self, window: usize) -> Self {
        self.ack_window = window.max(1);
        self
    }

    /// Set the progress interval.
    #[must_use]
    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }
}

/// Streaming state, logged on each transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    /// Not started.
    Idle,
    /// Sending chunks.
    Streaming,
    /// Source exhausted, collecting the remaining acks.
    Draining,
    /// Every chunk was sent and acknowledged.
    Done,
    /// Stopped on an error.
    Failed,
}

/// What a successful upload did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct UploadSummary {
    /// Payload bytes written to the FIFO.
    pub bytes_sent: u64,
    /// Number of FIFO frames.
    pub chunks_sent: usize,
    /// Wall time of the session.
    pub elapsed: Duration,
}

/// Result handed back by [`DfuDevice::end_upload`](crate::DfuDevice::end_upload).
pub type UploadOutcome = Result<UploadSummary>;

/// Chunk source reading from any [`Read`] implementation.
///
/// Each pull performs one `read` of at most the chunk size, so short reads
/// produce short chunks. A zero-length read ends the stream.
#[derive(Debug)]
pub struct ReaderSource<R> {
    reader: R,
    chunk_size: usize,
    done: bool,
}

impl<R: Read> ReaderSource<R> {
    /// Wrap a reader, pulling up to [`MAX_CHUNK`] bytes per chunk.
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            chunk_size: MAX_CHUNK,
            done: false,
        }
    }

    /// Set the chunk size, clamped to `1..=MAX_CHUNK`.
    #[must_use]
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.clamp(1, MAX_CHUNK);
        self
    }
}

impl ReaderSource<Cursor<Vec<u8>>> {
    /// Stream an in-memory image.
    pub fn from_bytes(image: impl Into<Vec<u8>>) -> Self {
        Self::new(Cursor::new(image.into()))
    }
}

impl<R: Read> Iterator for ReaderSource<R> {
    type Item = io::Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let mut buf = vec![0u8; self.chunk_size];
        loop {
            match self.reader.read(&mut buf) {
                Ok(0) => {
                    self.done = true;
                    return None;
                },
                Ok(n) => {
                    buf.truncate(n);
                    return Some(Ok(buf));
                },
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                },
            }
        }
    }
}

/// A running upload: the thread and the port it borrowed.
pub(crate) struct UploadSession<P> {
    handle: JoinHandle<(P, UploadOutcome)>,
}

impl<P> UploadSession<P> {
    /// Whether the upload thread has returned.
    pub(crate) fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the thread and take the port back.
    pub(crate) fn join(self) -> Result<(P, UploadOutcome)> {
        self.handle.join().map_err(|_| Error::TaskPanicked)
    }
}

/// Start streaming `source` on a new thread that owns `port`.
///
/// If the thread cannot be created the port is dropped.
pub(crate) fn spawn<P, S, K>(
    port: P,
    source: S,
    sink: K,
    options: UploadOptions,
) -> Result<UploadSession<P>>
where
    P: Port + 'static,
    S: Iterator<Item = io::Result<Vec<u8>>> + Send + 'static,
    K: ProgressSink + 'static,
{
    let handle = thread::Builder::new()
        .name("vnadfu-upload".into())
        .spawn(move || {
            let mut port = port;
            let outcome = Streamer::new(&mut port, sink, options).run(source);
            (port, outcome)
        })?;
    Ok(UploadSession { handle })
}

/// Streaming loop state, owned by the upload thread.
struct Streamer<'a, P: ?Sized, K> {
    port: &'a mut P,
    sink: K,
    options: UploadOptions,
    state: UploadState,
    outstanding: usize,
    progress: u64,
    chunks: usize,
    last_notify: Instant,
}

impl<'a, P, K> Streamer<'a, P, K>
where
    P: Port + ?Sized,
    K: ProgressSink,
{
    fn new(port: &'a mut P, sink: K, options: UploadOptions) -> Self {
        Self {
            port,
            sink,
            options,
            state: UploadState::Idle,
            outstanding: 0,
            progress: 0,
            chunks: 0,
            last_notify: Instant::now(),
        }
    }

    fn set_state(&mut self, state: UploadState) {
        debug!("Upload state {:?} -> {state:?}", self.state);
        self.state = state;
    }

    fn run<S>(mut self, source: S) -> UploadOutcome
    where
        S: Iterator<Item = io::Result<Vec<u8>>>,
    {
        let started = Instant::now();
        self.set_state(UploadState::Streaming);

        let result = self.stream(source).and_then(|()| {
            self.set_state(UploadState::Draining);
            self.drain()
        });

        match result {
            Ok(()) => {
                self.set_state(UploadState::Done);
                info!(
                    "Upload complete: {} bytes in {} chunks",
                    self.progress, self.chunks
                );
            },
            Err(ref e) => {
                self.set_state(UploadState::Failed);
                warn!("Upload failed after {} bytes: {e}", self.progress);
            },
        }
        self.sink.notify(Progress::Finished);

        result.map(|()| UploadSummary {
            bytes_sent: self.progress,
            chunks_sent: self.chunks,
            elapsed: started.elapsed(),
        })
    }

    fn stream<S>(&mut self, source: S) -> Result<()>
    where
        S: Iterator<Item = io::Result<Vec<u8>>>,
    {
        for chunk in source {
            let chunk = chunk.map_err(Error::Source)?;
            if chunk.is_empty() {
                continue;
            }

            fifo::send_chunk(&mut *self.port, &chunk)?;
            self.progress += chunk.len() as u64;
            self.chunks += 1;
            self.outstanding += 1;

            if self.last_notify.elapsed() >= self.options.progress_interval {
                self.last_notify = Instant::now();
                self.sink.notify(Progress::Sent(self.progress));
            }

            if self.outstanding >= self.options.ack_window {
                fifo::wait_ack(&mut *self.port)?;
                self.outstanding -= 1;
            }
        }
        Ok(())
    }

    fn drain(&mut self) -> Result<()> {
        while self.outstanding > 0 {
            fifo::wait_ack(&mut *self.port)?;
            self.outstanding -= 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::SimDevice;
    use std::sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    };

    type Log = Arc<Mutex<Vec<Progress>>>;

    fn recorder() -> (Log, impl ProgressSink + 'static) {
        let log: Log = Arc::default();
        let sink_log = Arc::clone(&log);
        (log, move |p: Progress| sink_log.lock().unwrap().push(p))
    }

    fn fixed_chunks(sizes: &[usize]) -> impl Iterator<Item = io::Result<Vec<u8>>> + Send + 'static {
        let chunks: Vec<_> = sizes
            .iter()
            .enumerate()
            .map(|(i, &n)| Ok(vec![(i % 256) as u8; n]))
            .collect();
        chunks.into_iter()
    }

    fn assert_progress_contract(log: &[Progress]) {
        assert_eq!(log.last(), Some(&Progress::Finished));
        assert_eq!(log.iter().filter(|p| p.is_finished()).count(), 1);

        let sent: Vec<u64> = log
            .iter()
            .filter_map(|p| match p {
                Progress::Sent(n) => Some(*n),
                Progress::Finished => None,
            })
            .collect();
        assert!(sent.windows(2).all(|w| w[0] <= w[1]), "progress went backwards: {sent:?}");
    }

    #[test]
    fn test_progress_raw_values() {
        assert_eq!(Progress::Sent(1000).as_raw(), 1000);
        assert_eq!(Progress::Finished.as_raw(), -1);
        assert!(Progress::Finished.is_finished());
        assert!(!Progress::Sent(0).is_finished());
    }

    #[test]
    fn test_options() {
        let options = UploadOptions::default();
        assert_eq!(options.ack_window, 6);
        assert_eq!(options.progress_interval, Duration::from_millis(100));

        assert_eq!(UploadOptions::default().with_ack_window(0).ack_window, 1);
        assert_eq!(
            UploadOptions::default()
                .with_progress_interval(Duration::ZERO)
                .progress_interval,
            Duration::ZERO
        );
    }

    #[test]
    fn test_reader_source_chunks() {
        let sizes: Vec<usize> = ReaderSource::from_bytes(vec![0xAB; 600])
            .map(|c| c.unwrap().len())
            .collect();
        assert_eq!(sizes, vec![255, 255, 90]);

        let sizes: Vec<usize> = ReaderSource::from_bytes(vec![0; 100])
            .with_chunk_size(64)
            .map(|c| c.unwrap().len())
            .collect();
        assert_eq!(sizes, vec![64, 36]);

        assert_eq!(ReaderSource::from_bytes(Vec::new()).count(), 0);
        assert_eq!(
            ReaderSource::from_bytes(vec![0; 10])
                .with_chunk_size(1000)
                .chunk_size,
            MAX_CHUNK
        );
    }

    #[test]
    fn test_reader_source_stops_after_error() {
        struct Broken;
        impl Read for Broken {
            fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
                Err(io::Error::other("bad sector"))
            }
        }

        let mut source = ReaderSource::new(Broken);
        assert!(source.next().unwrap().is_err());
        assert!(source.next().is_none());
    }

    #[test]
    fn test_1000_byte_image_in_four_chunks() {
        let dev = SimDevice::new();
        let handle = dev.handle();
        let (log, sink) = recorder();

        let session = spawn(
            dev,
            ReaderSource::from_bytes(vec![0x5A; 1000]),
            sink,
            UploadOptions::default(),
        )
        .unwrap();
        let (_port, outcome) = session.join().unwrap();
        let summary = outcome.unwrap();

        let sizes: Vec<usize> = handle.fifo_chunks().iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![255, 255, 255, 235]);
        assert_eq!(summary.bytes_sent, 1000);
        assert_eq!(summary.chunks_sent, 4);
        assert_eq!(handle.unacked(), 0);

        let log = log.lock().unwrap();
        assert_eq!(log.last(), Some(&Progress::Finished));
        assert_progress_contract(&log);
    }

    #[test]
    fn test_payload_reaches_device_in_order() {
        let image: Vec<u8> = (0..2000u32).map(|i| (i * 7 % 251) as u8).collect();
        let dev = SimDevice::new();
        let handle = dev.handle();

        let (_port, outcome) = spawn(
            dev,
            ReaderSource::from_bytes(image.clone()),
            NoProgress,
            UploadOptions::default(),
        )
        .unwrap()
        .join()
        .unwrap();
        outcome.unwrap();

        assert_eq!(handle.fifo_chunks().concat(), image);
    }

    #[test]
    fn test_window_never_exceeded() {
        let patterns: [&[usize]; 5] = [
            &[1],
            &[255; 5],
            &[255; 40],
            &[1, 255, 17, 200, 3, 99, 255, 128, 64, 32, 16, 8],
            &[10; 100],
        ];

        for sizes in patterns {
            let dev = SimDevice::new();
            let handle = dev.handle();
            let options = UploadOptions::default();
            let (_port, outcome) = spawn(dev, fixed_chunks(sizes), NoProgress, options)
                .unwrap()
                .join()
                .unwrap();

            let summary = outcome.unwrap();
            assert_eq!(summary.chunks_sent, sizes.len());
            assert_eq!(summary.bytes_sent, sizes.iter().sum::<usize>() as u64);
            assert_eq!(handle.max_unacked(), sizes.len().min(ACK_WINDOW));
            assert_eq!(handle.unacked(), 0);
        }
    }

    #[test]
    fn test_custom_window() {
        let dev = SimDevice::new();
        let handle = dev.handle();
        let options = UploadOptions::default().with_ack_window(2);

        let (_port, outcome) = spawn(dev, fixed_chunks(&[50; 10]), NoProgress, options)
            .unwrap()
            .join()
            .unwrap();
        outcome.unwrap();
        assert_eq!(handle.max_unacked(), 2);
    }

    #[test]
    fn test_blocks_when_device_stops_acking() {
        let dev = SimDevice::new();
        let handle = dev.handle();
        handle.withhold_acks();

        let session =
            spawn(dev, fixed_chunks(&[10; 20]), NoProgress, UploadOptions::default()).unwrap();

        assert!(handle.wait_for_fifo_writes(6, Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(150));
        assert_eq!(handle.fifo_chunks().len(), 6);
        assert!(!session.is_finished());

        handle.release_acks(1);
        assert!(handle.wait_for_fifo_writes(7, Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(100));
        assert_eq!(handle.fifo_chunks().len(), 7);
        assert!(handle.max_unacked() <= ACK_WINDOW);

        handle.resume_acks();
        let (_port, outcome) = session.join().unwrap();
        assert_eq!(outcome.unwrap().chunks_sent, 20);
        assert_eq!(handle.max_unacked(), ACK_WINDOW);
    }

    #[test]
    fn test_drain_waits_for_every_ack() {
        let dev = SimDevice::new();
        let handle = dev.handle();
        handle.withhold_acks();

        // Fewer chunks than the window: nothing blocks until draining
        let session =
            spawn(dev, fixed_chunks(&[10; 3]), NoProgress, UploadOptions::default()).unwrap();
        assert!(handle.wait_for_fifo_writes(3, Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(100));
        assert!(!session.is_finished());

        handle.release_acks(3);
        let (_port, outcome) = session.join().unwrap();
        outcome.unwrap();
        assert_eq!(handle.unacked(), 0);
    }

    #[test]
    fn test_hang_up_while_draining_fails_session() {
        let dev = SimDevice::new();
        let handle = dev.handle();
        handle.hang_up_after(2);
        let (log, sink) = recorder();
        let options = UploadOptions::default().with_progress_interval(Duration::from_secs(60));

        // Every chunk fits in the window, so the hang-up is seen while draining
        let (_port, outcome) = spawn(dev, fixed_chunks(&[10; 3]), sink, options)
            .unwrap()
            .join()
            .unwrap();

        assert!(matches!(outcome, Err(Error::ConnectionClosed)));
        assert_eq!(handle.fifo_chunks().len(), 3);
        assert_eq!(*log.lock().unwrap(), vec![Progress::Finished]);
    }

    #[test]
    fn test_source_error_on_third_pull() {
        let pulls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&pulls);
        let source = std::iter::from_fn(move || {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            Some(if n < 3 {
                Ok(vec![0x11; 100])
            } else {
                Err(io::Error::other("read failed"))
            })
        });

        let dev = SimDevice::new();
        let handle = dev.handle();
        let (log, sink) = recorder();

        let (_port, outcome) = spawn(dev, source, sink, UploadOptions::default())
            .unwrap()
            .join()
            .unwrap();

        let err = outcome.unwrap_err();
        assert!(matches!(err, Error::Source(ref e) if e.to_string() == "read failed"));
        assert_eq!(pulls.load(Ordering::SeqCst), 3);
        assert_eq!(handle.fifo_chunks().len(), 2);
        assert_progress_contract(&log.lock().unwrap());
    }

    #[test]
    fn test_device_hang_up_fails_session() {
        let dev = SimDevice::new();
        let handle = dev.handle();
        handle.hang_up_after(3);
        let (log, sink) = recorder();

        let (_port, outcome) = spawn(dev, fixed_chunks(&[20; 30]), sink, UploadOptions::default())
            .unwrap()
            .join()
            .unwrap();

        let err = outcome.unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed));
        assert!(err.is_transport());
        // Two acks arrived before the hang-up, so the window stalls on the 8th frame
        assert_eq!(handle.fifo_chunks().len(), 8);
        assert_progress_contract(&log.lock().unwrap());
    }

    #[test]
    fn test_write_failure_fails_session() {
        let dev = SimDevice::new();
        let handle = dev.handle();
        handle.fail_writes(true);
        let (log, sink) = recorder();

        let (_port, outcome) = spawn(dev, fixed_chunks(&[20; 3]), sink, UploadOptions::default())
            .unwrap()
            .join()
            .unwrap();

        assert!(matches!(outcome, Err(Error::Io(_))));
        assert_eq!(*log.lock().unwrap(), vec![Progress::Finished]);
    }

    #[test]
    fn test_oversized_chunk_from_source() {
        let dev = SimDevice::new();
        let handle = dev.handle();

        let chunks = fixed_chunks(&[100, 300, 100]);
        let (_port, outcome) = spawn(dev, chunks, NoProgress, UploadOptions::default())
            .unwrap()
            .join()
            .unwrap();

        assert!(matches!(outcome, Err(Error::ChunkTooLarge { len: 300 })));
        assert_eq!(handle.fifo_chunks().len(), 1);
    }

    #[test]
    fn test_empty_chunks_are_skipped() {
        let dev = SimDevice::new();
        let handle = dev.handle();

        let chunks = fixed_chunks(&[0, 3, 0]);
        let (_port, outcome) = spawn(dev, chunks, NoProgress, UploadOptions::default())
            .unwrap()
            .join()
            .unwrap();

        assert_eq!(outcome.unwrap().chunks_sent, 1);
        assert_eq!(handle.fifo_chunks().len(), 1);
    }

    #[test]
    fn test_progress_is_throttled() {
        let _ = env_logger::builder().is_test(true).try_init();

        // 12 chunks, one every 25ms: roughly one notification per 4 chunks
        let source = fixed_chunks(&[100; 12]).inspect(|_| thread::sleep(Duration::from_millis(25)));
        let dev = SimDevice::new();
        let (log, sink) = recorder();

        let (_port, outcome) = spawn(dev, source, sink, UploadOptions::default())
            .unwrap()
            .join()
            .unwrap();
        outcome.unwrap();

        let log = log.lock().unwrap();
        assert_progress_contract(&log);
        let sent = log.iter().filter(|p| !p.is_finished()).count();
        assert!(sent >= 1, "expected at least one progress update");
        assert!(sent < 12, "progress should not fire on every chunk");
        for p in log.iter() {
            if let Progress::Sent(n) = p {
                assert_eq!(n % 100, 0);
                assert!(*n <= 1200);
            }
        }
    }

    #[test]
    fn test_zero_interval_reports_every_chunk() {
        let dev = SimDevice::new();
        let (log, sink) = recorder();
        let options = UploadOptions::default().with_progress_interval(Duration::ZERO);

        let (_port, outcome) = spawn(dev, fixed_chunks(&[10; 5]), sink, options)
            .unwrap()
            .join()
            .unwrap();
        outcome.unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                Progress::Sent(10),
                Progress::Sent(20),
                Progress::Sent(30),
                Progress::Sent(40),
                Progress::Sent(50),
                Progress::Finished,
            ]
        );
    }

    #[test]
    fn test_sink_panic_surfaces_as_task_panic() {
        let dev = SimDevice::new();
        let sink = |p: Progress| {
            if p.is_finished() {
                panic!("sink exploded");
            }
        };

        let result = spawn(dev, fixed_chunks(&[10]), sink, UploadOptions::default())
            .unwrap()
            .join();
        assert!(matches!(result, Err(Error::TaskPanicked)));
    }
}
