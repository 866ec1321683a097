//! Media feeder: stream-channel ingest and decoder hand-off (spec.md §2
//! component H, §4.H, §5).
//!
//! Owns the UDP stream socket. Fragments are reassembled per sequence
//! number (spec.md §4.A: stream sample frames "carry a sequence number,
//! fragment index, and fragment total; feeders must reassemble"), decrypted
//! with the stream-direction session key, and handed to the decoder sink
//! through a bounded, oldest-drop queue so a slow decoder never blocks the
//! socket read loop.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::{oneshot, Notify};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::crypto::{self, SessionKeys, StreamId};
use crate::error::Error;
use crate::wire::stream::StreamSampleHeader;

/// Outcome of handing one reassembled sample to the decoder (spec.md §6
/// "Decoder sink").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Ok,
    Dropped,
    DecoderError,
}

/// In-process contract for the video/audio decoder (spec.md §1, §6).
///
/// Implementations must return promptly: the feeder calls this from its
/// consumer task, and a slow decoder only backs up the feeder's own bounded
/// queue, never the socket read loop.
pub trait DecoderSink: Send + Sync {
    fn process_packet(&self, bytes: &[u8], frames_lost: u32, recovered: u32) -> ProcessOutcome;
}

/// Point-in-time counters (spec.md §4.H).
#[derive(Debug, Clone, Copy, Default)]
pub struct FeederStats {
    pub received_bytes: u64,
    pub frames_lost: u64,
    pub frames_recovered: u64,
    pub frames_dropped: u64,
    pub queue_depth: usize,
}

struct ReassemblyState {
    fragments: Vec<Option<Vec<u8>>>,
    received: usize,
}

struct ReassemblyBuffer {
    pending: HashMap<u32, ReassemblyState>,
    last_complete_sequence: Option<u32>,
}

impl ReassemblyBuffer {
    fn new() -> Self {
        Self {
            pending: HashMap::new(),
            last_complete_sequence: None,
        }
    }

    /// Feeds one fragment; returns the completed sample payload and the
    /// number of frames lost since the previous completed sample (gap in
    /// sequence numbers), once every fragment of its sequence has arrived.
    fn feed(&mut self, header: StreamSampleHeader, fragment: &[u8]) -> Option<(Vec<u8>, u32)> {
        let entry = self.pending.entry(header.sequence).or_insert_with(|| ReassemblyState {
            fragments: vec![None; header.fragment_total as usize],
            received: 0,
        });

        let idx = header.fragment_index as usize;
        if idx >= entry.fragments.len() {
            return None;
        }
        if entry.fragments[idx].is_none() {
            entry.fragments[idx] = Some(fragment.to_vec());
            entry.received += 1;
        }

        if entry.received != entry.fragments.len() {
            return None;
        }

        let state = self.pending.remove(&header.sequence).unwrap();
        let mut sample = Vec::new();
        for part in state.fragments.into_iter().flatten() {
            sample.extend_from_slice(&part);
        }

        let lost = match self.last_complete_sequence {
            Some(prev) if header.sequence > prev => header.sequence - prev - 1,
            _ => 0,
        };
        self.last_complete_sequence = Some(header.sequence);

        // Any sequence still awaiting fragments older than the one we just
        // completed has no further chance of arriving usefully; drop it.
        self.pending.retain(|seq, _| *seq > header.sequence);

        Some((sample, lost))
    }
}

struct QueuedSample {
    bytes: Vec<u8>,
    frames_lost: u32,
}

struct BoundedQueue {
    items: Mutex<VecDeque<QueuedSample>>,
    capacity: usize,
    dropped: AtomicU64,
    notify: Notify,
}

impl BoundedQueue {
    fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            dropped: AtomicU64::new(0),
            notify: Notify::new(),
        }
    }

    /// Pushes a sample, evicting the oldest queued one if full (spec.md
    /// §4.H: "when full, drop the oldest...sample and count it as
    /// dropped").
    fn push(&self, bytes: Vec<u8>, frames_lost: u32) {
        let mut items = self.items.lock();
        if items.len() >= self.capacity {
            items.pop_front();
            self.dropped.fetch_add(1, Ordering::SeqCst);
        }
        items.push_back(QueuedSample { bytes, frames_lost });
        drop(items);
        self.notify.notify_one();
    }

    async fn pop(&self) -> QueuedSample {
        loop {
            if let Some(sample) = self.items.lock().pop_front() {
                return sample;
            }
            self.notify.notified().await;
        }
    }

    fn len(&self) -> usize {
        self.items.lock().len()
    }
}

struct Shared {
    stats: Mutex<FeederStats>,
    stop: AtomicBool,
}

/// Runtime media feeder bound to a stream-channel UDP socket.
pub struct MediaFeeder {
    socket: Arc<UdpSocket>,
    queue: Arc<BoundedQueue>,
    shared: Arc<Shared>,
    handles: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl MediaFeeder {
    /// Binds the stream-channel socket. Ingest is idle until the console
    /// pushes frames (spec.md §4.F step 9).
    pub async fn bind(local_addr: std::net::SocketAddr, queue_depth: usize) -> Result<Self, Error> {
        let socket = UdpSocket::bind(local_addr).await?;
        Ok(Self {
            socket: Arc::new(socket),
            queue: Arc::new(BoundedQueue::new(queue_depth.max(1))),
            shared: Arc::new(Shared {
                stats: Mutex::new(FeederStats::default()),
                stop: AtomicBool::new(false),
            }),
            handles: Mutex::new(Vec::new()),
        })
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr, Error> {
        Ok(self.socket.local_addr()?)
    }

    pub fn stats(&self) -> FeederStats {
        let mut stats = *self.shared.stats.lock();
        stats.queue_depth = self.queue.len();
        stats.frames_dropped = self.queue.dropped.load(Ordering::SeqCst);
        stats
    }

    /// Signals both the receive and consumer loops to exit at their next
    /// check (spec.md §5: "level-triggered...flag plus a wake").
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        self.queue.notify.notify_waiters();
    }

    /// Starts the receive-loop and decoder-consumer tasks. Returns a
    /// one-shot receiver that resolves the first time `decoder` accepts a
    /// sample (spec.md §4.F step 10, §4.H "one-shot `on_first_frame`").
    pub fn run<D>(
        &self,
        keys: SessionKeys,
        decoder: Arc<D>,
        tick_bound: Duration,
    ) -> oneshot::Receiver<()>
    where
        D: DecoderSink + 'static,
    {
        let (first_frame_tx, first_frame_rx) = oneshot::channel();

        let socket = Arc::clone(&self.socket);
        let queue = Arc::clone(&self.queue);
        let shared = Arc::clone(&self.shared);
        let recv_handle = tokio::spawn(receive_loop(socket, queue, shared, keys, tick_bound));

        let queue = Arc::clone(&self.queue);
        let shared = Arc::clone(&self.shared);
        let consume_handle = tokio::spawn(consume_loop(queue, shared, decoder, first_frame_tx));

        self.handles.lock().extend([recv_handle, consume_handle]);
        first_frame_rx
    }

    /// Signals both loop tasks to exit and waits for them, up to `bound`.
    /// A task still running past the bound is abandoned, not killed — it
    /// will observe the stop flag and unwind on its own (spec.md §5
    /// "bounded join").
    pub async fn join(&self, bound: Duration) {
        self.stop();
        let handles = std::mem::take(&mut *self.handles.lock());
        let _ = tokio::time::timeout(bound, futures_join(handles)).await;
    }
}

async fn futures_join(handles: Vec<tokio::task::JoinHandle<()>>) {
    for handle in handles {
        let _ = handle.await;
    }
}

async fn receive_loop(
    socket: Arc<UdpSocket>,
    queue: Arc<BoundedQueue>,
    shared: Arc<Shared>,
    keys: SessionKeys,
    tick_bound: Duration,
) {
    let mut reassembly = ReassemblyBuffer::new();
    let mut buf = vec![0u8; 65536];
    let mut counter: u64 = 0;

    while !shared.stop.load(Ordering::SeqCst) {
        let recv = timeout(tick_bound, socket.recv_from(&mut buf)).await;
        let (len, _from) = match recv {
            Ok(Ok(pair)) => pair,
            Ok(Err(err)) => {
                warn!(target: "rpsession::feeder", error = %err, "stream socket recv failed");
                break;
            }
            Err(_) => continue,
        };

        let datagram = &buf[..len];
        let (header, ciphertext) = match StreamSampleHeader::decode(datagram) {
            Ok(pair) => pair,
            Err(err) => {
                debug!(target: "rpsession::feeder", error = %err, "ignored malformed stream datagram");
                continue;
            }
        };

        let plaintext = match crypto::decrypt(&keys, StreamId::Stream, false, counter, ciphertext) {
            Ok(bytes) => bytes,
            Err(err) => {
                debug!(target: "rpsession::feeder", error = %err, "stream sample failed to decrypt");
                counter += 1;
                continue;
            }
        };
        counter += 1;

        {
            let mut stats = shared.stats.lock();
            stats.received_bytes += len as u64;
        }

        if let Some((sample, lost)) = reassembly.feed(header, &plaintext) {
            if lost > 0 {
                shared.stats.lock().frames_lost += lost as u64;
            }
            queue.push(sample, lost);
        }
    }
}

async fn consume_loop<D>(
    queue: Arc<BoundedQueue>,
    shared: Arc<Shared>,
    decoder: Arc<D>,
    first_frame_tx: oneshot::Sender<()>,
) where
    D: DecoderSink + 'static,
{
    let mut first_frame_tx = Some(first_frame_tx);
    loop {
        if shared.stop.load(Ordering::SeqCst) && queue.len() == 0 {
            return;
        }

        let sample = tokio::select! {
            sample = queue.pop() => sample,
            _ = tokio::time::sleep(Duration::from_millis(100)), if shared.stop.load(Ordering::SeqCst) => {
                continue;
            }
        };

        // Recovery signalling has no wire representation in this protocol
        // (see DESIGN.md); the feeder only ever reports 0 here.
        let recovered = 0;
        let outcome = decoder.process_packet(&sample.bytes, sample.frames_lost, recovered);

        match outcome {
            ProcessOutcome::Ok => {
                if let Some(tx) = first_frame_tx.take() {
                    let _ = tx.send(());
                }
            }
            ProcessOutcome::Dropped | ProcessOutcome::DecoderError => {}
        }
    }
}
