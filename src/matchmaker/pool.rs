use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, TryLockError};

use crate::plugin::MatchPlugin;
use crate::ticket::Ticket;

/// One matchmaking pool inside a matchmaker.
///
/// Two FIFOs feed each round: `priority_queue` holds residue from
/// failed rounds and drains first, `queue` holds freshly fetched
/// tickets. The round lock serializes whole rounds so at most one
/// worker processes a pool at a time; workers skip rather than wait.
pub struct TicketPool {
    pub name: String,

    queue: Mutex<VecDeque<Ticket>>,
    priority_queue: Mutex<VecDeque<Ticket>>,

    /// Whole-round lock; `try_begin_round` never blocks
    round_lock: AsyncMutex<()>,

    gathering: AtomicBool,
    has_failed_victims: AtomicBool,

    /// Cached match size from pool configuration, refreshed
    /// periodically; 2 until told otherwise
    last_match_size: AtomicUsize,

    /// Bound on first sighting, never rebound
    pub plugin: Option<Arc<dyn MatchPlugin>>,
}

impl TicketPool {
    pub fn new(name: String, plugin: Option<Arc<dyn MatchPlugin>>) -> Self {
        Self {
            name,
            queue: Mutex::new(VecDeque::new()),
            priority_queue: Mutex::new(VecDeque::new()),
            round_lock: AsyncMutex::new(()),
            gathering: AtomicBool::new(false),
            has_failed_victims: AtomicBool::new(false),
            last_match_size: AtomicUsize::new(2),
            plugin,
        }
    }

    pub fn enqueue(&self, ticket: Ticket) {
        self.queue.lock().push_back(ticket);
    }

    pub fn requeue_priority(&self, ticket: Ticket) {
        self.priority_queue.lock().push_back(ticket);
    }

    /// Next ticket for a round snapshot, residue first
    pub fn pop_next(&self) -> Option<Ticket> {
        if let Some(ticket) = self.priority_queue.lock().pop_front() {
            return Some(ticket);
        }
        self.queue.lock().pop_front()
    }

    /// Fresh-queue length only; the residue queue alone is not reason
    /// to start a round
    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn ticket_count(&self) -> usize {
        self.queue.lock().len() + self.priority_queue.lock().len()
    }

    pub fn try_begin_round(&self) -> Result<tokio::sync::MutexGuard<'_, ()>, TryLockError> {
        self.round_lock.try_lock()
    }

    pub fn is_gathering(&self) -> bool {
        self.gathering.load(Ordering::Relaxed)
    }

    pub fn set_gathering(&self, value: bool) {
        self.gathering.store(value, Ordering::Relaxed);
    }

    pub fn has_failed_victims(&self) -> bool {
        self.has_failed_victims.load(Ordering::Relaxed)
    }

    pub fn set_has_failed_victims(&self, value: bool) {
        self.has_failed_victims.store(value, Ordering::Relaxed);
    }

    pub fn last_match_size(&self) -> usize {
        self.last_match_size.load(Ordering::Relaxed)
    }

    /// Sizes below 2 are ignored
    pub fn set_last_match_size(&self, size: usize) {
        if size >= 2 {
            self.last_match_size.store(size, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn ticket(id: &str) -> Ticket {
        Ticket {
            global_id: id.into(),
            ..Default::default()
        }
    }

    #[test]
    fn residue_drains_before_fresh_tickets() {
        let pool = TicketPool::new(String::new(), None);
        pool.enqueue(ticket("fresh"));
        pool.requeue_priority(ticket("residue"));

        assert_eq!(pool.pop_next().unwrap().global_id, "residue");
        assert_eq!(pool.pop_next().unwrap().global_id, "fresh");
        assert!(pool.pop_next().is_none());
    }

    #[test]
    fn queue_len_ignores_residue() {
        let pool = TicketPool::new(String::new(), None);
        pool.requeue_priority(ticket("residue"));
        pool.requeue_priority(ticket("residue2"));
        assert_eq!(pool.queue_len(), 0);
        assert_eq!(pool.ticket_count(), 2);
    }

    #[test]
    fn round_lock_is_exclusive_and_non_blocking() {
        let pool = TicketPool::new(String::new(), None);
        let guard = pool.try_begin_round().unwrap();
        assert!(pool.try_begin_round().is_err());
        drop(guard);
        assert!(pool.try_begin_round().is_ok());
    }

    #[test]
    fn match_size_below_two_is_ignored() {
        let pool = TicketPool::new(String::new(), None);
        assert_eq!(pool.last_match_size(), 2);
        pool.set_last_match_size(1);
        assert_eq!(pool.last_match_size(), 2);
        pool.set_last_match_size(10);
        assert_eq!(pool.last_match_size(), 10);
    }
}
