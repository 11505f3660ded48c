//! Background bulk IN acquisition
//!
//! One thread per session keeps a bulk IN transfer pending at all times and
//! hands every completed transfer to the session through a bounded ring.
//! When the ring is full the thread stops reading, so the firmware buffers
//! further messages itself and nothing is dropped on the host side.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::clock::LocalClock;
use crate::constants::{
    RX_BUFFER_SIZE, RX_ERROR_BACKOFF, RX_PARK_INTERVAL, SHUTDOWN_ATTEMPTS, SHUTDOWN_INTERVAL,
};
use crate::transport::Transport;

/// One completed bulk IN transfer
#[derive(Debug)]
pub struct RxEntry {
    /// Received bytes or the transfer error
    pub payload: rusb::Result<Vec<u8>>,
    /// Local clock when the transfer completed
    pub captured_us: i64,
}

/// Result of waiting on the ring
#[derive(Debug)]
pub enum RxPoll {
    Item(RxEntry),
    /// The ring ran full since the last report and has been drained
    Overflow,
    /// Nothing arrived within the timeout
    Empty,
}

struct RingState {
    entries: VecDeque<RxEntry>,
    overflow: bool,
}

struct Ring {
    state: Mutex<RingState>,
    capacity: usize,
    /// Signalled when an entry was added
    filled: Condvar,
    /// Signalled when the consumer made room
    drained: Condvar,
    shutdown: AtomicBool,
}

impl Ring {
    fn lock(&self) -> MutexGuard<'_, RingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.drained.notify_all();
    }
}

/// Create a connected producer and consumer pair
pub fn rx_ring(capacity: usize) -> (RxProducer, RxConsumer) {
    let ring = Arc::new(Ring {
        state: Mutex::new(RingState {
            entries: VecDeque::with_capacity(capacity),
            overflow: false,
        }),
        capacity,
        filled: Condvar::new(),
        drained: Condvar::new(),
        shutdown: AtomicBool::new(false),
    });
    (RxProducer { ring: ring.clone() }, RxConsumer { ring })
}

/// Writing side, owned by the acquisition thread
pub struct RxProducer {
    ring: Arc<Ring>,
}

impl RxProducer {
    /// Block until the ring has a free slot
    ///
    /// Sets the overflow flag when the ring is found full and rechecks it
    /// periodically. Returns false if shutdown was requested meanwhile.
    pub fn wait_for_space(&self) -> bool {
        let mut state = self.ring.lock();
        while state.entries.len() >= self.ring.capacity {
            if self.is_shutdown() {
                return false;
            }
            if !state.overflow {
                log::debug!("rx ring full, holding back bulk IN");
            }
            state.overflow = true;
            state = self
                .ring
                .drained
                .wait_timeout(state, RX_PARK_INTERVAL)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        !self.is_shutdown()
    }

    /// Append an entry and wake the consumer
    pub fn push(&self, entry: RxEntry) {
        self.ring.lock().entries.push_back(entry);
        self.ring.filled.notify_one();
    }

    /// Shutdown was requested by the consumer side
    pub fn is_shutdown(&self) -> bool {
        self.ring.shutdown.load(Ordering::Acquire)
    }
}

/// Reading side, owned by the session
pub struct RxConsumer {
    ring: Arc<Ring>,
}

impl RxConsumer {
    /// Wait up to `timeout` for the next entry
    ///
    /// An overflow is reported once, after all entries buffered before it
    /// have been taken.
    pub fn pop(&self, timeout: Duration) -> RxPoll {
        let deadline = Instant::now() + timeout;
        let mut state = self.ring.lock();
        loop {
            if let Some(entry) = state.entries.pop_front() {
                drop(state);
                self.ring.drained.notify_one();
                return RxPoll::Item(entry);
            }
            if state.overflow {
                state.overflow = false;
                drop(state);
                self.ring.drained.notify_one();
                return RxPoll::Overflow;
            }

            let now = Instant::now();
            if now >= deadline {
                return RxPoll::Empty;
            }
            state = self
                .ring
                .filled
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Number of entries waiting
    pub fn len(&self) -> usize {
        self.ring.lock().entries.len()
    }

    /// No entries waiting
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The acquisition thread of one session
pub struct AcquisitionEngine {
    transport: Arc<dyn Transport>,
    ring: Arc<Ring>,
    worker: Option<JoinHandle<()>>,
}

impl AcquisitionEngine {
    /// Start reading `endpoint` into the ring behind `producer`
    pub fn spawn(
        transport: Arc<dyn Transport>,
        endpoint: u8,
        producer: RxProducer,
        clock: LocalClock,
    ) -> std::io::Result<Self> {
        let ring = producer.ring.clone();
        let worker = {
            let transport = transport.clone();
            thread::Builder::new()
                .name("candle-rx".into())
                .spawn(move || run(transport.as_ref(), endpoint, &producer, &clock))?
        };
        log::debug!("acquisition started on endpoint 0x{:02X}", endpoint);

        Ok(Self {
            transport,
            ring,
            worker: Some(worker),
        })
    }

    /// Stop the thread
    ///
    /// Waits a bounded time for the thread to finish. A thread stuck in the
    /// platform layer is detached and left behind.
    pub fn shutdown(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };

        self.ring.request_shutdown();
        self.transport.cancel_reads();

        for _ in 0..SHUTDOWN_ATTEMPTS {
            if worker.is_finished() {
                if worker.join().is_err() {
                    log::error!("acquisition thread panicked");
                }
                log::debug!("acquisition stopped");
                return;
            }
            thread::sleep(SHUTDOWN_INTERVAL);
        }
        log::warn!("acquisition thread did not stop in time, detaching it");
    }

    /// The thread is still running
    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }
}

impl Drop for AcquisitionEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(
    transport: &dyn Transport,
    endpoint: u8,
    producer: &RxProducer,
    clock: &LocalClock,
) {
    let mut buf = [0u8; RX_BUFFER_SIZE];

    while !producer.is_shutdown() {
        if !producer.wait_for_space() {
            break;
        }

        let result = transport.read_bulk(endpoint, &mut buf);
        if producer.is_shutdown() {
            break;
        }
        let captured_us = clock.now_us();

        match result {
            Ok(len) => producer.push(RxEntry {
                payload: Ok(buf[..len].to_vec()),
                captured_us,
            }),
            Err(e) => {
                log::warn!("bulk IN transfer failed: {}", e);
                producer.push(RxEntry {
                    payload: Err(e),
                    captured_us,
                });
                thread::sleep(RX_ERROR_BACKOFF);
            }
        }
    }
}
