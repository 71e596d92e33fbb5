use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use itertools::Itertools;
use tracing::{debug, info, warn};

use crate::matchmaker::status::{MatchmakerStatus, PoolStatus};
use crate::state::{keys, StateId};
use crate::ticket::Ticket;
use crate::BATCH_LIMIT;

use super::DirectorShared;

/// Refresh the online-matchmaker cache from the registry set, then run
/// the assigner; extra same-tick passes are allowed while full batches
/// keep coming and the loop-time headroom permits.
pub(super) async fn process_matchmakers(shared: &Arc<DirectorShared>) {
    let ids = match shared.state.get_set_values(keys::MATCHMAKERS).await {
        Ok(ids) => ids,
        Err(err) => {
            warn!(%err, "reading matchmaker registry");
            return;
        }
    };

    for id in ids {
        match shared.state.get_string(&id).await {
            Ok(Some(text)) => match MatchmakerStatus::from_text(&text) {
                Some(status) => {
                    shared.online_matchmakers.insert(id, status);
                }
                None => {
                    warn!(matchmaker = %id, "unparsable matchmaker status, unregistering");
                    unregister_matchmaker(shared, &id).await;
                }
            },
            // Status expired or never written: the matchmaker is gone
            Ok(None) => unregister_matchmaker(shared, &id).await,
            Err(err) => warn!(matchmaker = %id, %err, "reading matchmaker status"),
        }
    }

    let max_rounds = shared.emergency_loops.load(Ordering::Relaxed) + 1;
    for _ in 0..max_rounds {
        if assign_tickets(shared).await < BATCH_LIMIT {
            break;
        }
    }
}

/// One assignment pass over the unassigned stream. Returns how many
/// entries the pass read, full batches being the signal that more are
/// waiting.
pub(super) async fn assign_tickets(shared: &Arc<DirectorShared>) -> usize {
    if shared.online_matchmakers.is_empty() {
        return 0;
    }

    let entries = match shared
        .state
        .stream_read(keys::TICKETS_UNASSIGNED, Some(BATCH_LIMIT))
        .await
    {
        Ok(entries) => entries,
        Err(err) => {
            warn!(%err, "reading unassigned tickets");
            return 0;
        }
    };
    if entries.is_empty() {
        return 0;
    }
    let read_count = entries.len();

    let mut unparsable: Vec<StateId> = Vec::new();
    let mut parsed: Vec<(StateId, Ticket)> = Vec::with_capacity(entries.len());
    for (state_id, data) in entries {
        match Ticket::decode_from(&data) {
            Ok(mut ticket) => {
                ticket.state_id = state_id.0.clone();
                parsed.push((state_id, ticket));
            }
            Err(err) => {
                warn!(%err, %state_id, "dropping unparsable unassigned ticket");
                unparsable.push(state_id);
            }
        }
    }
    if !unparsable.is_empty() {
        if let Err(err) = shared
            .state
            .stream_delete_messages(keys::TICKETS_UNASSIGNED, &unparsable)
            .await
        {
            warn!(%err, "deleting unparsable unassigned tickets");
        }
    }

    let global_ids: Vec<String> = parsed.iter().map(|(_, t)| t.global_id.clone()).collect();
    let live = match shared
        .state
        .set_contains_batch(keys::TICKETS_SUBMITTED, &global_ids)
        .await
    {
        Ok(live) => live,
        Err(err) => {
            warn!(%err, "checking submitted set");
            return 0;
        }
    };

    // Cancelled tickets and those past their max age leave together
    let now = Utc::now();
    let mut expired_ids: Vec<StateId> = Vec::new();
    let mut expired_globals: Vec<String> = Vec::new();
    let mut to_assign: Vec<(StateId, Ticket)> = Vec::new();
    for ((state_id, ticket), live) in parsed.into_iter().zip(live) {
        if !live || ticket.is_past_max_age(now) {
            expired_globals.push(ticket.global_id);
            expired_ids.push(state_id);
        } else {
            to_assign.push((state_id, ticket));
        }
    }
    if !expired_ids.is_empty() {
        debug!(count = expired_ids.len(), "dropping cancelled or expired tickets");
        if let Err(err) = shared
            .state
            .stream_delete_messages(keys::TICKETS_UNASSIGNED, &expired_ids)
            .await
        {
            warn!(%err, "deleting expired tickets from the unassigned stream");
        }
        if let Err(err) = shared
            .state
            .set_remove_batch(keys::TICKETS_SUBMITTED, &expired_globals)
            .await
        {
            warn!(%err, "removing expired tickets from the submitted set");
        }
    }

    // Route each ticket, grouped by target stream for one move per
    // matchmaker
    let mut routed: Vec<(String, (StateId, Bytes))> = Vec::with_capacity(to_assign.len());
    for (state_id, mut ticket) in to_assign {
        let Some(matchmaker_id) = pick_matchmaker(shared, ticket.pool_id()) else {
            // Nobody suitable right now; the ticket stays unassigned
            continue;
        };

        apply_clock_compensation(shared, &matchmaker_id, &mut ticket);
        note_assignment(shared, &matchmaker_id, ticket.pool_id());

        routed.push((
            keys::assigned_stream(&matchmaker_id),
            (state_id, ticket.encode_to_bytes()),
        ));
    }

    for (stream_key, entries) in routed.into_iter().into_group_map() {
        let (state_ids, datas): (Vec<StateId>, Vec<Bytes>) = entries.into_iter().unzip();
        // Delete before add: a crash in between loses the ticket to the
        // recovery path instead of duplicating it
        if let Err(err) = shared
            .state
            .stream_delete_messages(keys::TICKETS_UNASSIGNED, &state_ids)
            .await
        {
            warn!(%err, "removing assigned tickets from the unassigned stream");
            continue;
        }
        if let Err(err) = shared.state.stream_add_batch(&stream_key, &datas).await {
            warn!(%err, %stream_key, "assigned-stream write failed, queueing for recovery");
            shared
                .lost_tickets
                .lock()
                .push_back((stream_key, datas));
        }
    }

    read_count
}

/// Matchmaker selection for one pool:
///  1. first one gathering that pool with room wins immediately
///  2. otherwise one with room and a non-empty queue, kept while the
///     scan continues in case a gathering one appears
///  3. otherwise whoever is least busy overall
fn pick_matchmaker(shared: &DirectorShared, pool_id: &str) -> Option<String> {
    let capacity = shared.config.matchmaker_pool_capacity;
    let mut least_busy: Option<(String, usize)> = None;
    let mut with_room: Option<String> = None;

    for entry in shared.online_matchmakers.iter() {
        let (id, status) = (entry.key(), entry.value());

        let busy = status.processing_tickets;
        if least_busy.as_ref().is_none_or(|(_, best)| busy < *best) {
            least_busy = Some((id.clone(), busy));
        }

        if let Some(pool) = status.pools.iter().find(|p| p.name == pool_id) {
            if pool.in_queue < capacity && pool.gathering {
                return Some(id.clone());
            }
            if pool.in_queue < capacity && pool.in_queue > 0 && with_room.is_none() {
                with_room = Some(id.clone());
            }
        }
    }

    with_room.or(least_busy.map(|(id, _)| id))
}

/// Expiry in the matchmaker's own clock: shift the submit time by the
/// observed clock difference, then add the ticket's max age
fn apply_clock_compensation(shared: &DirectorShared, matchmaker_id: &str, ticket: &mut Ticket) {
    if ticket.max_age_seconds == 0 {
        ticket.timestamp_expiry_matchmaker = 0;
        return;
    }
    let Some(status) = shared.online_matchmakers.get(matchmaker_id) else {
        return;
    };
    let time_difference = Utc::now().timestamp_micros() - status.local_time.timestamp_micros();
    ticket.timestamp_expiry_matchmaker = (ticket.timestamp - time_difference)
        + i64::from(ticket.max_age_seconds) * 1_000_000;
}

/// Keep the cached status honest within the pass so later picks in the
/// same batch see the queue growth
fn note_assignment(shared: &DirectorShared, matchmaker_id: &str, pool_id: &str) {
    if let Some(mut status) = shared.online_matchmakers.get_mut(matchmaker_id) {
        status.processing_tickets += 1;
        match status.pools.iter_mut().find(|p| p.name == pool_id) {
            Some(pool) => pool.in_queue += 1,
            None => status.pools.push(PoolStatus {
                name: pool_id.to_string(),
                in_queue: 1,
                gathering: false,
            }),
        }
    }
}

/// Drain a gone matchmaker's assigned stream back to unassigned, then
/// drop the stream and the registry entry
pub(super) async fn unregister_matchmaker(shared: &Arc<DirectorShared>, matchmaker_id: &str) {
    shared.online_matchmakers.remove(matchmaker_id);
    let stream_key = keys::assigned_stream(matchmaker_id);

    loop {
        let entries = match shared.state.stream_read(&stream_key, Some(BATCH_LIMIT)).await {
            Ok(entries) => entries,
            Err(err) => {
                warn!(%err, matchmaker = %matchmaker_id, "reading orphaned assigned stream");
                return;
            }
        };
        if entries.is_empty() {
            break;
        }

        let (state_ids, datas): (Vec<StateId>, Vec<Bytes>) = entries.into_iter().unzip();
        if let Err(err) = shared
            .state
            .stream_delete_messages(&stream_key, &state_ids)
            .await
        {
            warn!(%err, "clearing orphaned assigned stream");
            return;
        }
        if let Err(err) = shared
            .state
            .stream_add_batch(keys::TICKETS_UNASSIGNED, &datas)
            .await
        {
            warn!(%err, "returning orphaned tickets, queueing for recovery");
            shared
                .lost_tickets
                .lock()
                .push_back((keys::TICKETS_UNASSIGNED.to_string(), datas));
        }
    }

    if let Err(err) = shared.state.stream_delete(&stream_key).await {
        warn!(%err, "deleting orphaned assigned stream");
    }
    if let Err(err) = shared
        .state
        .set_remove(keys::MATCHMAKERS, matchmaker_id)
        .await
    {
        warn!(%err, "removing matchmaker from the registry");
    }
    info!(matchmaker = %matchmaker_id, "unregistered offline matchmaker");
}
