pub mod pool;
pub mod status;
mod worker;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::plugin::PluginRegistry;
use crate::state::{keys, State, StateId};
use crate::ticket::Ticket;
use crate::BATCH_LIMIT;

use self::pool::TicketPool;
use self::status::{MatchmakerStatus, PoolStatus};

/// How often the cleaner flushes used tickets to the consumed stream
const CLEANER_DELAY: Duration = Duration::from_millis(500);

/// How long the cleaner waits after a successful flush before dropping
/// dedup entries, so a fetch that started before the delete cannot
/// re-admit the same tickets
const CLEANER_SETTLE: Duration = Duration::from_millis(100);

/// How often every pool re-reads its match-size configuration
const POOL_CONFIG_REFRESH: Duration = Duration::from_secs(10);

/// A ticket this matchmaker is done with, waiting for the cleaner
pub struct ConsumedTicket {
    pub ticket: Ticket,
    pub consumed_for_match: bool,
}

pub(crate) struct MatchmakerShared {
    pub id: String,
    pub state: Arc<dyn State>,
    pub config: Arc<Config>,

    pub pools: DashMap<String, Arc<TicketPool>>,

    /// Global ids fetched and not yet fully cleaned; dedups re-reads of
    /// the assigned stream and counts as "processing" in the status
    pub assigned_tickets: DashMap<String, ()>,

    pub consumed: Mutex<VecDeque<ConsumedTicket>>,

    pub plugins: PluginRegistry,
    pub token: CancellationToken,
}

impl MatchmakerShared {
    pub fn push_consumed(&self, ticket: Ticket, consumed_for_match: bool) {
        self.consumed.lock().push_back(ConsumedTicket {
            ticket,
            consumed_for_match,
        });
    }

    pub fn build_status(&self) -> MatchmakerStatus {
        let mut pools: Vec<PoolStatus> = self
            .pools
            .iter()
            .map(|entry| PoolStatus {
                name: entry.key().clone(),
                in_queue: entry.value().ticket_count(),
                gathering: entry.value().is_gathering(),
            })
            .collect();
        pools.sort_by(|a, b| a.name.cmp(&b.name));
        MatchmakerStatus {
            processing_tickets: self.assigned_tickets.len(),
            pools,
            local_time: Utc::now(),
        }
    }

    /// Pool for this ticket, created lazily; a new pool gets its
    /// match-size configuration fetched right away
    async fn route_to_pool(&self, ticket: Ticket) {
        let pool_id = ticket.pool_id().to_string();
        let pool = match self.pools.get(&pool_id) {
            Some(pool) => pool.clone(),
            None => {
                let created = Arc::new(TicketPool::new(
                    pool_id.clone(),
                    self.plugins.bind_for_pool(&pool_id),
                ));
                let pool = self
                    .pools
                    .entry(pool_id.clone())
                    .or_insert(created)
                    .clone();
                info!(pool = %pool_id, "created matchmaking pool");
                self.refresh_pool_match_size(&pool).await;
                pool
            }
        };
        pool.enqueue(ticket);
    }

    async fn refresh_pool_match_size(&self, pool: &TicketPool) {
        match self.state.get_string(&keys::pool_match_size(&pool.name)).await {
            Ok(Some(raw)) => match raw.trim().parse::<usize>() {
                Ok(size) => pool.set_last_match_size(size),
                Err(_) => warn!(pool = %pool.name, %raw, "unparsable pool match size"),
            },
            Ok(None) => {}
            Err(err) => warn!(pool = %pool.name, %err, "reading pool match size"),
        }
    }
}

/// Matchmaker role: registers itself, fetches assigned tickets, runs
/// per-pool worker rounds and parks used tickets for the director.
pub struct Matchmaker {
    shared: Arc<MatchmakerShared>,
    tracker: TaskTracker,
}

impl Matchmaker {
    pub fn new(state: Arc<dyn State>, config: Arc<Config>, plugins: PluginRegistry) -> Self {
        let shared = Arc::new(MatchmakerShared {
            id: format!("mm_{}", Uuid::new_v4()),
            state,
            config,
            pools: DashMap::new(),
            assigned_tickets: DashMap::new(),
            consumed: Mutex::new(VecDeque::new()),
            plugins,
            token: CancellationToken::new(),
        });
        Self {
            shared,
            tracker: TaskTracker::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn status(&self) -> MatchmakerStatus {
        self.shared.build_status()
    }

    /// Spawn the pinger, fetcher, config refresher, cleaner and the
    /// worker pool
    pub fn start(&self) {
        let worker_count = self.shared.config.matchmaker_threads;
        info!(id = %self.shared.id, workers = worker_count, "starting matchmaker");

        self.spawn(pinger_loop(self.shared.clone()));
        self.spawn(fetcher_loop(self.shared.clone()));
        self.spawn(pool_config_loop(self.shared.clone()));
        self.spawn(cleaner_loop(self.shared.clone()));
        for index in 0..worker_count {
            self.spawn(worker::worker_loop(self.shared.clone(), index));
        }
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

    /// Cancel every loop and wait for them to wind down
    pub async fn shutdown(&self) {
        self.shared.token.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!(id = %self.shared.id, "matchmaker stopped");
    }
}

/// Write the status blob, then register. Status goes first so the
/// director never observes a registered but statusless matchmaker.
async fn pinger_loop(shared: Arc<MatchmakerShared>) {
    let mut interval = tokio::time::interval(shared.config.matchmaker_update_delay());
    loop {
        interval.tick().await;
        let status = shared.build_status().to_text();
        if let Err(err) = shared
            .state
            .set_string(&shared.id, Some(&status), Some(shared.config.max_downtime()))
            .await
        {
            warn!(%err, "writing matchmaker status");
            continue;
        }
        if let Err(err) = shared.state.set_add(keys::MATCHMAKERS, &shared.id).await {
            warn!(%err, "registering matchmaker");
        }
    }
}

/// Pull everything from the assigned stream; the director controls the
/// batch size on its side. Entries stay in the stream until the cleaner
/// removes them, so re-reads are expected and dedup by global id.
async fn fetcher_loop(shared: Arc<MatchmakerShared>) {
    let stream_key = keys::assigned_stream(&shared.id);
    let mut interval = tokio::time::interval(shared.config.matchmaker_update_delay());
    loop {
        interval.tick().await;
        let entries = match shared.state.stream_read(&stream_key, None).await {
            Ok(entries) => entries,
            Err(err) => {
                warn!(%err, "reading assigned stream");
                continue;
            }
        };

        let mut unparsable: Vec<StateId> = Vec::new();
        for (state_id, data) in entries {
            let mut ticket = match Ticket::decode_from(&data) {
                Ok(ticket) => ticket,
                Err(err) => {
                    warn!(%err, %state_id, "dropping unparsable assigned ticket");
                    unparsable.push(state_id);
                    continue;
                }
            };
            ticket.state_id = state_id.0;
            if shared
                .assigned_tickets
                .insert(ticket.global_id.clone(), ())
                .is_some()
            {
                continue;
            }
            shared.route_to_pool(ticket).await;
        }

        if !unparsable.is_empty() {
            if let Err(err) = shared
                .state
                .stream_delete_messages(&stream_key, &unparsable)
                .await
            {
                warn!(%err, "deleting unparsable assigned tickets");
            }
        }
    }
}

async fn pool_config_loop(shared: Arc<MatchmakerShared>) {
    let mut interval = tokio::time::interval(POOL_CONFIG_REFRESH);
    loop {
        interval.tick().await;
        let pools: Vec<Arc<TicketPool>> =
            shared.pools.iter().map(|entry| entry.value().clone()).collect();
        for pool in pools {
            shared.refresh_pool_match_size(&pool).await;
        }
    }
}

/// Flush used tickets: delete from the own assigned stream first, then
/// park them on the consumed stream for the director
async fn cleaner_loop(shared: Arc<MatchmakerShared>) {
    let stream_key = keys::assigned_stream(&shared.id);
    let mut interval = tokio::time::interval(CLEANER_DELAY);
    loop {
        interval.tick().await;

        let batch: Vec<ConsumedTicket> = {
            let mut consumed = shared.consumed.lock();
            let take = consumed.len().min(BATCH_LIMIT);
            consumed.drain(..take).collect()
        };
        if batch.is_empty() {
            continue;
        }

        let state_ids: Vec<StateId> = batch
            .iter()
            .map(|c| StateId(c.ticket.state_id.clone()))
            .collect();
        let datas: Vec<Bytes> = batch.iter().map(|c| c.ticket.encode_to_bytes()).collect();

        let moved = async {
            shared
                .state
                .stream_delete_messages(&stream_key, &state_ids)
                .await?;
            shared
                .state
                .stream_add_batch(keys::CONSUMED_TICKETS, &datas)
                .await
        }
        .await;

        match moved {
            Err(err) => {
                warn!(%err, "flushing consumed tickets, requeueing");
                let mut consumed = shared.consumed.lock();
                for entry in batch.into_iter().rev() {
                    consumed.push_front(entry);
                }
            }
            Ok(_) => {
                tokio::time::sleep(CLEANER_SETTLE).await;
                for entry in &batch {
                    shared.assigned_tickets.remove(&entry.ticket.global_id);
                }
            }
        }
    }
}
