use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use tracing::{debug, warn};

use crate::matching::match_tickets;
use crate::state::keys;
use crate::ticket::Ticket;
use crate::BATCH_LIMIT;

use super::pool::TicketPool;
use super::MatchmakerShared;

/// One worker: cycle over pools round-robin from the last used index,
/// skip pools another worker holds or that have too little fresh work,
/// and run a full round on the first pool acquired.
pub(super) async fn worker_loop(shared: Arc<MatchmakerShared>, worker_index: usize) {
    let mut last_pool_index = 0usize;
    loop {
        let mut names: Vec<String> = shared.pools.iter().map(|e| e.key().clone()).collect();
        names.sort();

        let mut ran_round = false;
        for offset in 0..names.len() {
            let index = (last_pool_index + offset) % names.len();
            let Some(pool) = shared.pools.get(&names[index]).map(|e| e.value().clone())
            else {
                continue;
            };
            if pool.queue_len() < 2 {
                continue;
            }
            let Ok(_round) = pool.try_begin_round() else {
                continue;
            };
            last_pool_index = index + 1;
            debug!(worker = worker_index, pool = %pool.name, "starting round");
            run_pool_round(&shared, &pool).await;
            ran_round = true;
            break;
        }

        if !ran_round {
            tokio::time::sleep(shared.config.matchmaker_update_delay()).await;
        }
    }
}

/// Gather → snapshot → match → publish → residue, with the pool's
/// round lock held by the caller
async fn run_pool_round(shared: &MatchmakerShared, pool: &TicketPool) {
    let config = &shared.config;
    let capacity = config.matchmaker_pool_capacity;

    // Withhold matching while the pool is underfull so the director
    // routes more tickets here; skipped when a previous round left
    // victims that deserve an immediate retry
    if pool.ticket_count() < capacity && !pool.has_failed_victims() {
        pool.set_gathering(true);
        tokio::time::sleep(config.min_gather_time()).await;
        pool.set_gathering(false);
        // Two update delays so the cleared flag reaches the director
        tokio::time::sleep(config.matchmaker_update_delay() * 2).await;
    }

    let target = capacity.min(pool.ticket_count());
    let now_micros = Utc::now().timestamp_micros();
    let tolerance_micros = (config.matchmaker_update_delay * 1_000_000.0) as i64;

    let mut snapshot: Vec<Ticket> = Vec::with_capacity(target);
    while snapshot.len() < target {
        let Some(ticket) = pool.pop_next() else {
            break;
        };
        if ticket.is_expired_on_matchmaker(now_micros, tolerance_micros) {
            debug!(global_id = %ticket.global_id, "ticket expired before matching");
            shared.push_consumed(ticket, false);
            continue;
        }
        snapshot.push(ticket);
    }

    if snapshot.len() < 2 {
        for ticket in snapshot {
            pool.requeue_priority(ticket);
        }
        return;
    }

    // Plugin says how big a match is, if it has an opinion worth taking
    let mut match_size = pool.last_match_size();
    if let Some(plugin) = &pool.plugin {
        let plugin_size = plugin.match_size(snapshot.len());
        if plugin_size >= 2 {
            match_size = plugin_size;
        }
    }

    let outcome = match_tickets(&snapshot, match_size, pool.plugin.as_deref(), false);

    // Matches reach the stream before any participant reaches the
    // consumed stream
    let mut publish_failed = false;
    for chunk in outcome.matches.chunks(BATCH_LIMIT) {
        let datas: Vec<Bytes> = chunk.iter().map(|m| m.encode_to_bytes()).collect();
        if let Err(err) = shared.state.stream_add_batch(keys::MATCHES, &datas).await {
            warn!(%err, pool = %pool.name, "publishing matches failed, requeueing round");
            publish_failed = true;
            break;
        }
    }
    if publish_failed {
        for ticket in snapshot {
            pool.requeue_priority(ticket);
        }
        return;
    }
    if !outcome.matches.is_empty() {
        debug!(pool = %pool.name, matches = outcome.matches.len(), "published matches");
    }

    pool.set_has_failed_victims(!outcome.matched_all_it_could);

    let matched_ids: HashSet<&str> = outcome
        .matches
        .iter()
        .flat_map(|m| m.matched_ticket_global_ids.iter().map(String::as_str))
        .collect();

    for mut ticket in snapshot {
        if matched_ids.contains(ticket.global_id.as_str()) {
            shared.push_consumed(ticket, true);
            continue;
        }
        ticket.matching_failure_count += 1;
        if ticket.matching_failure_count > shared.config.max_match_failures {
            debug!(global_id = %ticket.global_id, "ticket exceeded match failures");
            shared.push_consumed(ticket, false);
        } else {
            pool.requeue_priority(ticket);
        }
    }
}
