//! # Rate-Limited Packet Stream
//!
//! Per-connection buffering and throttling: one incoming FIFO, two outgoing
//! FIFOs (reliable, unreliable), and a dedicated writer task that drains the
//! outgoing side under a token-bucket rate limit.
//!
//! # Rate algorithm
//!
//! `out_remain` is the number of bytes currently sendable without delay. It
//! grows by `elapsed × current_out_rate` on every drain cycle, capped at
//! `current_out_rate` (a one-second burst allowance). The effective rate is
//! `min(requested_out, remote_granted)` where 0 on either side means that
//! side imposes no cap; 0 effective disables throttling entirely.
//!
//! # Locking
//!
//! The queues sit behind their own mutexes, separate from connection state,
//! so a slow application callback never blocks the I/O paths. Locks are
//! held only to move packets in or out; serialization and socket writes
//! happen outside them.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use gamewire_core::{EngineError, Result};
use gamewire_protocol::{wire_size, write_packet, Packet, RawBuffer, END_OF_PACKETS, RAW_BUFFER_SIZE};

use crate::event::EventDispatcher;
use crate::stats::ConnectionStats;
use crate::transport::FrameTransport;

/// Largest frame payload the writer will assemble: buffer capacity minus the
/// end-of-packets sentinel.
const MAX_FRAME_PAYLOAD: usize = RAW_BUFFER_SIZE - 1;

struct RateState {
    requested_out: u32,
    remote_granted: u32,
    current_out: u32,
    /// Bytes currently sendable without delay
    out_remain: f64,
    last_refill: Instant,
}

impl RateState {
    fn new() -> Self {
        Self {
            requested_out: 0,
            remote_granted: 0,
            current_out: 0,
            out_remain: 0.0,
            last_refill: Instant::now(),
        }
    }

    /// `min(requested, granted)` with 0 meaning "no cap from this side"
    fn recompute(&mut self) {
        self.current_out = match (self.requested_out, self.remote_granted) {
            (0, granted) => granted,
            (requested, 0) => requested,
            (requested, granted) => requested.min(granted),
        };
        // A shrunken rate also shrinks the stored burst.
        self.out_remain = self.out_remain.min(self.current_out as f64);
    }

    /// Add `elapsed × rate` to the bucket, capped at a one-second burst
    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        if self.current_out > 0 {
            let rate = self.current_out as f64;
            self.out_remain = (self.out_remain + elapsed * rate).min(rate);
        }
    }
}

struct Shared {
    incoming: Mutex<VecDeque<Box<dyn Packet>>>,
    out_reliable: Mutex<VecDeque<Box<dyn Packet>>>,
    out_unreliable: Mutex<VecDeque<Box<dyn Packet>>>,
    rates: Mutex<RateState>,
    /// Outgoing data exists, rates changed, or shutdown was requested
    wake: Notify,
    /// Outgoing queues just ran dry
    drained: Notify,
    /// A frame is being assembled or sent right now
    in_flight: AtomicBool,
    shutdown: AtomicBool,
}

impl Shared {
    fn out_pending(&self) -> usize {
        self.out_reliable.lock().len() + self.out_unreliable.lock().len()
    }

    fn fully_drained(&self) -> bool {
        self.out_pending() == 0 && !self.in_flight.load(Ordering::Acquire)
    }
}

/// Per-connection duplex queue with outbound throttling
///
/// Cheap to clone; all clones share the same queues and writer task.
#[derive(Clone)]
pub(crate) struct PacketStream {
    shared: Arc<Shared>,
    writer: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl PacketStream {
    pub(crate) fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                incoming: Mutex::new(VecDeque::new()),
                out_reliable: Mutex::new(VecDeque::new()),
                out_unreliable: Mutex::new(VecDeque::new()),
                rates: Mutex::new(RateState::new()),
                wake: Notify::new(),
                drained: Notify::new(),
                in_flight: AtomicBool::new(false),
                shutdown: AtomicBool::new(false),
            }),
            writer: Arc::new(Mutex::new(None)),
        }
    }

    /// Enqueue a clone of `packet` for sending
    ///
    /// # Panics
    /// A packet whose wire size cannot fit one frame is a contract
    /// violation and panics here, before it can wedge the writer.
    pub(crate) fn write_packet(&self, packet: &dyn Packet, reliable: bool) {
        assert!(
            wire_size(packet) <= MAX_FRAME_PAYLOAD,
            "packet tag {} reports {} wire bytes, frame limit is {}",
            packet.type_tag(),
            wire_size(packet),
            MAX_FRAME_PAYLOAD
        );
        let clone = packet.clone_packet();
        if reliable {
            self.shared.out_reliable.lock().push_back(clone);
        } else {
            self.shared.out_unreliable.lock().push_back(clone);
        }
        self.shared.wake.notify_one();
    }

    /// Dequeue the next received packet, transferring ownership to the caller
    pub(crate) fn next_packet(&self) -> Option<Box<dyn Packet>> {
        self.shared.incoming.lock().pop_front()
    }

    pub(crate) fn push_incoming(&self, packet: Box<dyn Packet>) {
        self.shared.incoming.lock().push_back(packet);
    }

    pub(crate) fn incoming_len(&self) -> usize {
        self.shared.incoming.lock().len()
    }

    pub(crate) fn outgoing_len(&self) -> usize {
        self.shared.out_pending()
    }

    /// Update our requested outbound cap (0 = unlimited)
    pub(crate) fn set_requested_out(&self, rate: u32) {
        let mut rates = self.shared.rates.lock();
        rates.requested_out = rate;
        rates.recompute();
        drop(rates);
        self.shared.wake.notify_one();
    }

    /// Update the cap the peer granted us (0 = unlimited)
    pub(crate) fn set_remote_granted(&self, rate: u32) {
        let mut rates = self.shared.rates.lock();
        rates.remote_granted = rate;
        rates.recompute();
        drop(rates);
        self.shared.wake.notify_one();
    }

    /// The effective outbound rate in bytes/sec, 0 = unthrottled
    pub(crate) fn current_out_rate(&self) -> u32 {
        self.shared.rates.lock().current_out
    }

    /// Block until the outgoing side is fully drained or `timeout` passes
    pub(crate) async fn wait_to_send_all(&self, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.shared.fully_drained() {
                return Ok(());
            }
            let notified = self.shared.drained.notified();
            if self.shared.fully_drained() {
                return Ok(());
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(EngineError::Timeout);
            }
        }
    }

    /// Stop the writer, discarding anything unsent, and wake all waiters
    pub(crate) fn shut_down(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.wake.notify_one();
        self.shared.drained.notify_waiters();
    }

    /// Spawn the output task
    ///
    /// The task drains reliable packets to the reliable transport and
    /// unreliable packets to the unreliable one (or the reliable one when no
    /// datagram channel was negotiated), reporting write failures to the
    /// event dispatcher as fatal.
    pub(crate) fn start_writer(
        &self,
        reliable: Arc<dyn FrameTransport>,
        unreliable: Option<Arc<dyn FrameTransport>>,
        events: EventDispatcher,
        stats: Arc<ConnectionStats>,
    ) {
        let shared = self.shared.clone();
        let task = tokio::spawn(async move {
            writer_loop(shared, reliable, unreliable, events, stats).await;
        });
        let mut writer = self.writer.lock();
        assert!(writer.is_none(), "packet stream writer started twice");
        *writer = Some(task);
    }

    pub(crate) fn abort_writer(&self) {
        if let Some(task) = self.writer.lock().take() {
            task.abort();
        }
    }
}

/// One assembled frame: serialized payload plus the packet count and byte
/// total it represents.
struct Frame {
    payload: RawBuffer,
    packets: u64,
    bytes: usize,
    reliable: bool,
}

async fn writer_loop(
    shared: Arc<Shared>,
    reliable: Arc<dyn FrameTransport>,
    unreliable: Option<Arc<dyn FrameTransport>>,
    events: EventDispatcher,
    stats: Arc<ConnectionStats>,
) {
    loop {
        if shared.shutdown.load(Ordering::Acquire) {
            return;
        }

        // Replenish the bucket before every drain cycle.
        let (budget, rate) = {
            let mut rates = shared.rates.lock();
            rates.refill(Instant::now());
            (rates.out_remain, rates.current_out)
        };

        shared.in_flight.store(true, Ordering::Release);
        let frame = assemble_frame(&shared, budget, rate);

        let Some(frame) = frame else {
            shared.in_flight.store(false, Ordering::Release);
            if shared.out_pending() == 0 {
                shared.drained.notify_waiters();
                shared.wake.notified().await;
            } else {
                // Head packet exists but the bucket cannot cover it yet:
                // sleep exactly until enough tokens accrue, unless a rate
                // change or shutdown wakes us earlier.
                let wait = {
                    let rates = shared.rates.lock();
                    let deficit = (head_wire_size(&shared).unwrap_or(0) as f64
                        - rates.out_remain)
                        .max(0.0);
                    if rates.current_out == 0 {
                        Duration::ZERO
                    } else {
                        Duration::from_secs_f64(deficit / rates.current_out as f64)
                    }
                };
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = shared.wake.notified() => {}
                }
            }
            continue;
        };

        let transport: &Arc<dyn FrameTransport> = if frame.reliable {
            &reliable
        } else {
            unreliable.as_ref().unwrap_or(&reliable)
        };

        let result = transport.send(frame.payload.as_slice()).await;
        shared.in_flight.store(false, Ordering::Release);

        match result {
            Ok(()) => {
                stats.add_sent(frame.packets, frame.payload.len() as u64);
                {
                    let mut rates = shared.rates.lock();
                    if rates.current_out > 0 {
                        rates.out_remain = (rates.out_remain - frame.bytes as f64).max(0.0);
                    }
                }
                if shared.out_pending() == 0 {
                    shared.drained.notify_waiters();
                    events.signal_done_writing();
                }
            }
            Err(error) => {
                if !shared.shutdown.load(Ordering::Acquire) {
                    tracing::error!("stream write failed: {}", error);
                    events.signal_failure(error);
                }
                return;
            }
        }
    }
}

fn head_wire_size(shared: &Shared) -> Option<usize> {
    if let Some(front) = shared.out_reliable.lock().front() {
        return Some(wire_size(front.as_ref()));
    }
    shared
        .out_unreliable
        .lock()
        .front()
        .map(|p| wire_size(p.as_ref()))
}

/// Pack as many head-of-queue packets as the frame and the bucket allow
///
/// Reliable packets drain first; a frame carries packets of one kind only.
/// Returns `None` when nothing can be sent right now (empty queues or an
/// exhausted bucket).
fn assemble_frame(shared: &Shared, budget: f64, rate: u32) -> Option<Frame> {
    let unlimited = rate == 0;
    let mut remaining_budget = if unlimited { f64::INFINITY } else { budget };

    for (queue, is_reliable) in [
        (&shared.out_reliable, true),
        (&shared.out_unreliable, false),
    ] {
        let mut queue = queue.lock();
        if queue.is_empty() {
            continue;
        }

        let mut payload = RawBuffer::new();
        let mut packets = 0u64;
        let mut bytes = 0usize;

        while let Some(front) = queue.front() {
            let size = wire_size(front.as_ref());
            if payload.len() + size > MAX_FRAME_PAYLOAD {
                break;
            }
            if (size as f64) > remaining_budget {
                break;
            }
            let packet = queue.pop_front().unwrap();
            write_packet(packet.as_ref(), &mut payload);
            remaining_budget -= size as f64;
            packets += 1;
            bytes += size;
        }

        if packets > 0 {
            payload.write_u8(END_OF_PACKETS);
            return Some(Frame {
                payload,
                packets,
                bytes: bytes + 1,
                reliable: is_reliable,
            });
        }
        // Head packet present but over budget: fall through so the caller
        // sleeps for replenishment instead of spinning.
        return None;
    }
    None
}
