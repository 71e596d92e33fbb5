mod assign;
mod cleanup;
mod matches;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::Utc;
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::MatchmakingError;
use crate::matchmaker::status::MatchmakerStatus;
use crate::state::{keys, State, StateId};
use crate::ticket::{Ticket, TicketMatch};
use crate::BATCH_LIMIT;

pub use matches::MatchReader;

/// Cadence of the ticket submitter timer
const SUBMIT_DELAY: Duration = Duration::from_millis(100);

/// Lost-ticket recovery runs on every Nth main-loop tick
const LOST_TICKET_EVERY: u64 = 5;

/// Samples kept for the emergency-loop estimate
const LOOP_TIME_SAMPLES: usize = 10;

pub(crate) struct DirectorShared {
    pub state: Arc<dyn State>,
    pub config: Arc<Config>,

    /// Matchmakers with a fresh, parsable status
    pub online_matchmakers: DashMap<String, MatchmakerStatus>,

    /// Tickets accepted on the surface, waiting for the submitter
    pub pending_submit: Mutex<VecDeque<Ticket>>,

    /// Stream ids of matches already pushed into the reader channel
    pub received_match_state_ids: DashSet<String>,

    /// Global ids that were valid participants of an invalid match and
    /// must re-enter the unassigned stream
    pub tickets_to_readd: DashSet<String>,

    /// Consumed-stream state id → whether the discard already fired
    pub discard_scheduled: DashMap<String, bool>,

    /// Tickets whose discard timer fired, ready for removal
    pub discarded_tickets: Mutex<VecDeque<Ticket>>,

    /// (stream key, payloads) whose move failed half-way; retried by
    /// the periodic lost-ticket processor
    pub lost_tickets: Mutex<VecDeque<(String, Vec<Bytes>)>>,

    pub match_tx: mpsc::UnboundedSender<TicketMatch>,
    pub match_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<TicketMatch>>,

    /// Matches delivered to a reader, to delete from the stream on the
    /// next tick
    pub matches_to_consume: Mutex<Vec<StateId>>,

    pub readers: AtomicUsize,

    /// Extra same-tick assignment passes the assigner may take
    pub emergency_loops: AtomicUsize,

    pub token: CancellationToken,
}

/// Director role: singleton leader that ingests submitted tickets,
/// routes them to matchmakers, validates completed matches and fans
/// them out to readers.
pub struct Director {
    shared: Arc<DirectorShared>,
    tracker: TaskTracker,
}

impl Director {
    pub fn new(state: Arc<dyn State>, config: Arc<Config>) -> Self {
        let (match_tx, match_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(DirectorShared {
            state,
            config,
            online_matchmakers: DashMap::new(),
            pending_submit: Mutex::new(VecDeque::new()),
            received_match_state_ids: DashSet::new(),
            tickets_to_readd: DashSet::new(),
            discard_scheduled: DashMap::new(),
            discarded_tickets: Mutex::new(VecDeque::new()),
            lost_tickets: Mutex::new(VecDeque::new()),
            match_tx,
            match_rx: tokio::sync::Mutex::new(match_rx),
            matches_to_consume: Mutex::new(Vec::new()),
            readers: AtomicUsize::new(0),
            emergency_loops: AtomicUsize::new(1),
            token: CancellationToken::new(),
        });
        Self {
            shared,
            tracker: TaskTracker::new(),
        }
    }

    /// Claim the leader lease and spawn the periodic loops.
    ///
    /// A present lease means another director may still be alive: wait
    /// out one downtime window, re-check once, and refuse to start if
    /// it is still there. No retry loop.
    pub async fn start(&self) -> Result<(), MatchmakingError> {
        let state = &self.shared.state;
        if state.get_string(keys::DIRECTOR_IS_ACTIVE).await?.is_some() {
            warn!("existing director lease found, waiting one downtime window");
            tokio::time::sleep(self.shared.config.max_downtime()).await;
            if state.get_string(keys::DIRECTOR_IS_ACTIVE).await?.is_some() {
                return Err(MatchmakingError::LeaderConflict);
            }
        }
        state
            .set_string(
                keys::DIRECTOR_IS_ACTIVE,
                Some("Active"),
                Some(self.shared.config.max_downtime()),
            )
            .await?;
        info!("director lease acquired");

        self.spawn(pinger_loop(self.shared.clone()));
        self.spawn(main_loop(self.shared.clone()));
        self.spawn(submitter_loop(self.shared.clone()));
        Ok(())
    }

    fn spawn(&self, task: impl std::future::Future<Output = ()> + Send + 'static) {
        let token = self.shared.token.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                () = task => {},
                () = token.cancelled() => {},
            }
        });
    }

    pub async fn shutdown(&self) {
        self.shared.token.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!("director stopped");
    }

    /// Accept a ticket onto the pending queue. Assigns the global id
    /// (client-supplied ids are only honored when not already live) and
    /// stamps the submit time.
    pub async fn submit_ticket(&self, mut ticket: Ticket) -> Result<String, MatchmakingError> {
        if !ticket.global_id.is_empty() {
            let pending_holds_id = self
                .shared
                .pending_submit
                .lock()
                .iter()
                .any(|t| t.global_id == ticket.global_id);
            if pending_holds_id
                || self
                    .shared
                    .state
                    .set_contains(keys::TICKETS_SUBMITTED, &ticket.global_id)
                    .await?
            {
                return Err(MatchmakingError::DuplicateId(ticket.global_id));
            }
        } else {
            ticket.global_id = Uuid::new_v4().to_string();
        }
        ticket.timestamp = Utc::now().timestamp_micros();
        ticket.state_id = String::new();
        ticket.timestamp_expiry_matchmaker = 0;
        ticket.matching_failure_count = 0;

        let global_id = ticket.global_id.clone();
        self.shared.pending_submit.lock().push_back(ticket);
        Ok(global_id)
    }

    /// Remove a live ticket by global id. The ticket is dropped at the
    /// next assignment or validation step that consults the set.
    pub async fn remove_ticket(&self, global_id: &str) -> Result<(), MatchmakingError> {
        if global_id.is_empty() {
            return Err(MatchmakingError::BadRequest("empty global id".into()));
        }
        if self
            .shared
            .state
            .set_remove(keys::TICKETS_SUBMITTED, global_id)
            .await?
        {
            Ok(())
        } else {
            Err(MatchmakingError::NotFound(global_id.to_string()))
        }
    }

    pub async fn pool_match_size(&self, pool_id: &str) -> Result<Option<usize>, MatchmakingError> {
        let raw = self
            .shared
            .state
            .get_string(&keys::pool_match_size(pool_id))
            .await?;
        Ok(raw.and_then(|raw| raw.trim().parse().ok()))
    }

    pub async fn set_pool_match_size(
        &self,
        pool_id: &str,
        match_size: usize,
    ) -> Result<(), MatchmakingError> {
        if match_size < 2 {
            return Err(MatchmakingError::BadRequest(format!(
                "match size {match_size} below 2"
            )));
        }
        self.shared
            .state
            .set_string(
                &keys::pool_match_size(pool_id),
                Some(&match_size.to_string()),
                None,
            )
            .await?;
        Ok(())
    }

    /// Open a reader over validated matches. Dropping the reader stops
    /// counting it towards the fan-out.
    pub fn reader(&self) -> MatchReader {
        MatchReader::open(self.shared.clone())
    }

    /// Deliver matches one-by-one through `callback` until cancelled.
    /// A successful callback consumes the match; a failing one returns
    /// it for another reader and stops this one.
    pub async fn read_incoming_matches<F, Fut>(&self, token: CancellationToken, mut callback: F)
    where
        F: FnMut(TicketMatch) -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<()>>,
    {
        let reader = self.reader();
        loop {
            let next = tokio::select! {
                next = reader.recv() => next,
                () = token.cancelled() => break,
            };
            let Some(m) = next else { break };
            match callback(m.clone()).await {
                Ok(()) => reader.consume(&m),
                Err(err) => {
                    warn!(%err, "match reader callback failed, returning match");
                    reader.return_match(m);
                    break;
                }
            }
        }
    }
}

async fn pinger_loop(shared: Arc<DirectorShared>) {
    let mut interval = tokio::time::interval(shared.config.director_update_delay());
    loop {
        interval.tick().await;
        if let Err(err) = shared
            .state
            .set_string(
                keys::DIRECTOR_IS_ACTIVE,
                Some("Active"),
                Some(shared.config.max_downtime()),
            )
            .await
        {
            warn!(%err, "refreshing director lease");
        }
    }
}

/// One tick: the four stages in parallel, then the emergency-loop
/// estimate from a small ring of recent loop times
async fn main_loop(shared: Arc<DirectorShared>) {
    let delay = shared.config.director_update_delay();
    let mut interval = tokio::time::interval(delay);
    let mut recent: VecDeque<Duration> = VecDeque::with_capacity(LOOP_TIME_SAMPLES);
    let mut iteration: u64 = 0;

    loop {
        interval.tick().await;
        iteration += 1;
        let started = Instant::now();

        let with_lost = iteration % LOST_TICKET_EVERY == 0;
        tokio::join!(
            assign::process_matchmakers(&shared),
            matches::process_matches(&shared),
            cleanup::clean_consumed_tickets(&shared),
            async {
                if with_lost {
                    cleanup::process_lost_tickets(&shared).await;
                }
            },
        );

        let elapsed = started.elapsed();
        if recent.len() == LOOP_TIME_SAMPLES {
            recent.pop_front();
        }
        recent.push_back(elapsed);

        if elapsed > delay.mul_f64(0.7) {
            warn!(?elapsed, ?delay, "director loop close to its update delay");
            shared.emergency_loops.store(0, Ordering::Relaxed);
        } else {
            let max = recent.iter().max().copied().unwrap_or_default();
            let avg = recent.iter().sum::<Duration>() / recent.len() as u32;
            let headroom = delay.saturating_sub(max).as_secs_f64();
            let emergency = if avg.is_zero() {
                1
            } else {
                ((headroom / avg.as_secs_f64()) as usize).max(1)
            };
            shared.emergency_loops.store(emergency, Ordering::Relaxed);
        }
    }
}

/// Drain pending tickets into the unassigned stream and the submitted
/// set; re-arms immediately while a full batch is still waiting
async fn submitter_loop(shared: Arc<DirectorShared>) {
    loop {
        let batch: Vec<Ticket> = {
            let mut pending = shared.pending_submit.lock();
            let take = pending.len().min(BATCH_LIMIT);
            pending.drain(..take).collect()
        };

        if !batch.is_empty() {
            let datas: Vec<Bytes> = batch.iter().map(Ticket::encode_to_bytes).collect();
            let ids: Vec<String> = batch.iter().map(|t| t.global_id.clone()).collect();

            match shared
                .state
                .stream_add_batch(keys::TICKETS_UNASSIGNED, &datas)
                .await
            {
                Ok(results) => {
                    for (ticket, result) in batch.iter().zip(&results) {
                        if result.is_none() {
                            warn!(global_id = %ticket.global_id, "ticket failed to enter the unassigned stream");
                        }
                    }
                }
                Err(err) => warn!(%err, "writing submitted tickets"),
            }
            if let Err(err) = shared
                .state
                .set_add_batch(keys::TICKETS_SUBMITTED, &ids)
                .await
            {
                warn!(%err, "registering submitted ticket ids");
            }
        }

        if shared.pending_submit.lock().len() < BATCH_LIMIT {
            tokio::time::sleep(SUBMIT_DELAY).await;
        }
    }
}
