//! Domain-aware message queues feeding the tile render workers.
//!
//! The base [`MessageQueue`] is a plain blocking FIFO of byte payloads. The
//! tile variants trade strict FIFO for perceived responsiveness: redundant
//! tile requests are deduplicated and tiles under a view's cursor jump the
//! queue, while `canceltiles` purges work the user has scrolled away from.

mod tile;

pub use tile::{is_tile_message, tile_identity, CursorPosition, TileDescriptor};

use std::collections::{HashMap, VecDeque};
use std::sync::{Condvar, Mutex, PoisonError};
use tracing::{debug, trace};

/// An opaque queued message.
pub type Payload = Vec<u8>;

/// Insertion policy of a [`MessageQueue`].
///
/// The queue owns locking and blocking; a discipline only decides where (and
/// whether) a payload lands in the deque.
pub trait Discipline: Send {
    fn put(&mut self, queue: &mut VecDeque<Payload>, payload: Payload);
}

// ============================================================================
// MessageQueue
// ============================================================================

/// A blocking FIFO of opaque payloads, generic over its insertion policy.
///
/// `put` never blocks; [`get`](Self::get) waits until a payload is
/// available. Readers and writers may live on any thread.
pub struct MessageQueue<D: Discipline = Fifo> {
    inner: Mutex<Inner<D>>,
    cv: Condvar,
}

struct Inner<D> {
    queue: VecDeque<Payload>,
    discipline: D,
}

/// A [`MessageQueue`] that honours the `canceltiles` message.
pub type BasicTileQueue = MessageQueue<CancelTiles>;

/// A [`MessageQueue`] that deduplicates tile requests and serves tiles near
/// a cursor first.
pub type TileQueue = MessageQueue<TilePolicy>;

impl<D: Discipline + Default> MessageQueue<D> {
    pub fn new() -> MessageQueue<D> {
        MessageQueue {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                discipline: D::default(),
            }),
            cv: Condvar::new(),
        }
    }
}

impl<D: Discipline + Default> Default for MessageQueue<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: Discipline> MessageQueue<D> {
    /// Inserts a payload according to the queue's discipline and wakes one
    /// waiting reader.
    pub fn put(&self, payload: Payload) {
        {
            let mut guard = self.lock();
            let inner = &mut *guard;
            inner.discipline.put(&mut inner.queue, payload);
        }
        self.cv.notify_one();
    }

    /// Removes and returns the front payload, blocking while the queue is
    /// empty.
    ///
    /// There is no timeout; owners that shut down must wake readers through
    /// their own channels.
    pub fn get(&self) -> Payload {
        let mut inner = self
            .cv
            .wait_while(self.lock(), |inner| inner.queue.is_empty())
            .unwrap_or_else(PoisonError::into_inner);
        inner
            .queue
            .pop_front()
            .expect("queue is non-empty after wait")
    }

    /// Drops all pending payloads atomically.
    pub fn clear(&self) {
        self.lock().queue.clear();
    }

    /// Removes every queued payload matching the predicate.
    pub fn remove_if(&self, pred: impl Fn(&Payload) -> bool) {
        self.lock().queue.retain(|payload| !pred(payload));
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().queue.is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<D>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ============================================================================
// Disciplines
// ============================================================================

/// Plain first-in, first-out insertion.
#[derive(Debug, Default)]
pub struct Fifo;

impl Discipline for Fifo {
    fn put(&mut self, queue: &mut VecDeque<Payload>, payload: Payload) {
        queue.push_back(payload);
    }
}

/// FIFO insertion plus `canceltiles` handling.
#[derive(Debug, Default)]
pub struct CancelTiles;

impl Discipline for CancelTiles {
    fn put(&mut self, queue: &mut VecDeque<Payload>, payload: Payload) {
        cancel_aware_put(queue, payload);
    }
}

fn cancel_aware_put(queue: &mut VecDeque<Payload>, payload: Payload) {
    let msg = String::from_utf8_lossy(&payload);
    if msg == "canceltiles" {
        // Drop the pending plain tiles. Requests tagged with 'id=' are
        // special (previews etc.) and must survive cancellation.
        let before = queue.len();
        queue.retain(|queued| {
            let queued = String::from_utf8_lossy(queued);
            !(queued.starts_with("tile ") && !queued.contains("id="))
        });
        debug!(cancelled = before - queue.len(), "Cancelling queued tiles");

        // The cancellation itself goes ahead of everything else.
        queue.push_front(payload);
    } else {
        queue.push_back(payload);
    }
}

/// Tile deduplication and cursor-driven prioritization.
///
/// Tracks each view's cursor rectangle; a tile request whose rectangle
/// intersects any of them is a priority request.
#[derive(Debug, Default)]
pub struct TilePolicy {
    cursor_positions: HashMap<u32, CursorPosition>,
}

impl TilePolicy {
    fn is_priority(&self, msg: &str) -> bool {
        let Ok(tile) = TileDescriptor::parse(msg) else {
            return false;
        };

        self.cursor_positions
            .values()
            .any(|cursor| tile.intersects(cursor))
    }
}

impl Discipline for TilePolicy {
    fn put(&mut self, queue: &mut VecDeque<Payload>, payload: Payload) {
        let msg = String::from_utf8_lossy(&payload).into_owned();
        trace!(msg = %msg, "Putting payload");

        if !queue.is_empty() && is_tile_message(&msg) {
            let identity = tile_identity(&msg);
            for i in 0..queue.len() {
                let duplicate = {
                    let queued = String::from_utf8_lossy(&queue[i]);
                    tile_identity(&queued) == identity
                };
                if duplicate {
                    // A newer request for the same region supersedes the
                    // queued one in place.
                    debug!(identity, "Replacing duplicate tile");
                    queue[i] = payload;

                    if self.is_priority(&msg) {
                        debug!(msg = %msg, "Bumping tile to front");
                        let payload = queue.remove(i).expect("index is in bounds");
                        queue.push_front(payload);
                    }

                    return;
                }
            }
        }

        if self.is_priority(&msg) {
            debug!(msg = %msg, "Priority tile");
            queue.push_front(payload);
        } else {
            cancel_aware_put(queue, payload);
        }
    }
}

// ============================================================================
// TileQueue operations
// ============================================================================

impl MessageQueue<TilePolicy> {
    /// Records a view's cursor rectangle and bumps the queued tile under it,
    /// if any.
    pub fn update_cursor_position(&self, view_id: u32, cursor: CursorPosition) {
        let mut inner = self.lock();
        inner.discipline.cursor_positions.insert(view_id, cursor);
        reprioritize_locked(&mut inner.queue, &cursor);
    }

    /// Forgets a view's cursor, e.g. when the view disconnects.
    pub fn remove_cursor_position(&self, view_id: u32) {
        self.lock().discipline.cursor_positions.remove(&view_id);
    }

    /// Brings the queued tile intersecting the rectangle (if any) to the
    /// front. There should be at most one overlapping tile.
    pub fn reprioritize(&self, cursor: &CursorPosition) {
        reprioritize_locked(&mut self.lock().queue, cursor);
    }
}

fn reprioritize_locked(queue: &mut VecDeque<Payload>, cursor: &CursorPosition) {
    for i in 0..queue.len() {
        let intersects = {
            let msg = String::from_utf8_lossy(&queue[i]);
            TileDescriptor::parse(&msg)
                .map(|tile| tile.intersects(cursor))
                .unwrap_or(false)
        };

        if intersects {
            if i != 0 {
                trace!(index = i, "Bumping tile to front");
                let payload = queue.remove(i).expect("index is in bounds");
                queue.push_front(payload);
            }

            return;
        }
    }
}
