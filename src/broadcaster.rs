/// Single-writer, many-reader fan-out of a job's output.
///
/// Every byte written is appended to an in-memory history and offered to all
/// live subscribers. A subscriber owns a bounded queue drained by its own
/// forwarding thread; a full queue means the subscriber cannot keep up and
/// it is evicted so the writer never blocks.
use crate::types::{Result, TelePilotError};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::collections::HashMap;
use std::io::Write;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

/// Chunks a subscriber may lag behind before being evicted.
const SUBSCRIBER_QUEUE_DEPTH: usize = 128;

/// How long to wait for a forwarder to drain on unsubscribe/close.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

pub type SubscriberId = u64;

/// The write half a subscriber's bytes are forwarded into.
pub type Sink = Box<dyn Write + Send>;

struct Subscriber {
    tx: Sender<Vec<u8>>,
    // Disconnects when the forwarding thread exits; the drain signal.
    done_rx: Receiver<()>,
}

#[derive(Default)]
struct Inner {
    history: Vec<u8>,
    subscribers: HashMap<SubscriberId, Subscriber>,
    next_id: SubscriberId,
    closed: bool,
}

pub struct Broadcaster {
    inner: Mutex<Inner>,
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl Broadcaster {
    pub fn new() -> Self {
        Broadcaster {
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Append a chunk to the history and offer it to every subscriber.
    ///
    /// Never blocks: a subscriber whose queue is full is evicted on the
    /// spot. No-op once the broadcaster is closed.
    pub fn write(&self, chunk: &[u8]) {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return;
        }
        inner.history.extend_from_slice(chunk);

        let mut evicted = Vec::new();
        for (id, sub) in &inner.subscribers {
            if sub.tx.try_send(chunk.to_vec()).is_err() {
                evicted.push(*id);
            }
        }
        for id in evicted {
            // Dropping the sender closes the queue; the forwarder drains
            // what it already has and exits. We don't wait for it here.
            if inner.subscribers.remove(&id).is_some() {
                log::warn!("Evicting slow log subscriber {}", id);
            }
        }
    }

    /// Copy of everything written so far. Valid on a closed broadcaster,
    /// which is how terminal jobs replay their output.
    pub fn snapshot(&self) -> Vec<u8> {
        self.inner.lock().unwrap().history.clone()
    }

    /// Atomically snapshot the history and register `sink` for everything
    /// written afterwards. The single critical section shared with `write`
    /// is what makes snapshot + live bytes gapless and duplicate-free.
    ///
    /// Returns `None` if the broadcaster is closed.
    pub fn subscribe_and_snapshot(&self, sink: Sink) -> Option<(SubscriberId, Vec<u8>)> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return None;
        }

        let id = inner.next_id;
        inner.next_id += 1;

        let (tx, rx) = bounded::<Vec<u8>>(SUBSCRIBER_QUEUE_DEPTH);
        let (done_tx, done_rx) = bounded::<()>(0);
        thread::spawn(move || forward(rx, sink, done_tx));

        inner.subscribers.insert(id, Subscriber { tx, done_rx });
        Some((id, inner.history.clone()))
    }

    /// Close the subscriber's queue and wait for its forwarder to drain.
    /// Idempotent; a no-op on a closed broadcaster or unknown id.
    pub fn unsubscribe(&self, id: SubscriberId) -> Result<()> {
        let sub = {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                return Ok(());
            }
            match inner.subscribers.remove(&id) {
                Some(sub) => sub,
                None => return Ok(()),
            }
        };
        drop(sub.tx);
        wait_drained(&sub.done_rx, id)
    }

    /// Close the broadcaster: evict every subscriber and reject all further
    /// writes and subscriptions.
    pub fn close(&self) {
        let subscribers = {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                return;
            }
            inner.closed = true;
            std::mem::take(&mut inner.subscribers)
        };

        // Drop every sender first so all forwarders drain concurrently,
        // then collect them; total wait is bounded by the slowest one.
        let draining: Vec<(SubscriberId, Receiver<()>)> = subscribers
            .into_iter()
            .map(|(id, sub)| (id, sub.done_rx))
            .collect();
        for (id, done_rx) in draining {
            if let Err(e) = wait_drained(&done_rx, id) {
                log::warn!("Subscriber did not drain on close: {}", e);
            }
        }
    }
}

/// Drain loop run by each subscriber's forwarding thread. A sink write
/// error terminates it silently; the broadcaster observes the exit through
/// the dropped `done_tx`.
fn forward(rx: Receiver<Vec<u8>>, mut sink: Sink, done_tx: Sender<()>) {
    let _done = done_tx;
    for chunk in rx {
        if sink.write_all(&chunk).is_err() {
            return;
        }
    }
}

fn wait_drained(done_rx: &Receiver<()>, id: SubscriberId) -> Result<()> {
    match done_rx.recv_timeout(DRAIN_TIMEOUT) {
        Ok(()) | Err(RecvTimeoutError::Disconnected) => Ok(()),
        Err(RecvTimeoutError::Timeout) => Err(TelePilotError::Broadcast(format!(
            "subscriber {} failed to drain within {:?}",
            id, DRAIN_TIMEOUT
        ))),
    }
}
