use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::state::{keys, StateId};
use crate::ticket::Ticket;
use crate::BATCH_LIMIT;

use super::DirectorShared;

/// Reconcile the consumed stream against the re-add intentions left by
/// match validation.
///
/// Tickets marked for re-add go straight back to the unassigned stream
/// (their global ids never left the submitted set). Everything else
/// gets a delayed discard: the delay gives a match posted shortly after
/// its tickets hit the consumed stream time to flip them to re-add.
pub(super) async fn clean_consumed_tickets(shared: &Arc<DirectorShared>) {
    let entries = match shared
        .state
        .stream_read(keys::CONSUMED_TICKETS, Some(BATCH_LIMIT))
        .await
    {
        Ok(entries) => entries,
        Err(err) => {
            warn!(%err, "reading the consumed stream");
            return;
        }
    };

    let mut unparsable: Vec<StateId> = Vec::new();
    let mut readd_ids: Vec<StateId> = Vec::new();
    let mut readd_datas: Vec<Bytes> = Vec::new();
    let mut readd_globals: Vec<String> = Vec::new();
    for (state_id, data) in entries {
        let mut ticket = match Ticket::decode_from(&data) {
            Ok(ticket) => ticket,
            Err(err) => {
                warn!(%err, %state_id, "dropping unparsable consumed ticket");
                unparsable.push(state_id);
                continue;
            }
        };
        ticket.state_id = state_id.0.clone();

        if shared.tickets_to_readd.contains(&ticket.global_id) {
            // Cancel a scheduled discard unless its timer already fired
            match shared.discard_scheduled.get(&state_id.0).map(|v| *v) {
                Some(true) => continue,
                Some(false) => {
                    shared.discard_scheduled.remove(&state_id.0);
                }
                None => {}
            }
            shared.tickets_to_readd.remove(&ticket.global_id);
            readd_globals.push(ticket.global_id.clone());
            readd_ids.push(state_id);
            readd_datas.push(ticket.encode_to_bytes());
        } else if shared.discard_scheduled.get(&state_id.0).is_none() {
            shared.discard_scheduled.insert(state_id.0.clone(), false);
            schedule_discard(shared.clone(), state_id.0, ticket);
        }
    }

    if !unparsable.is_empty() {
        if let Err(err) = shared
            .state
            .stream_delete_messages(keys::CONSUMED_TICKETS, &unparsable)
            .await
        {
            warn!(%err, "deleting unparsable consumed tickets");
        }
    }

    // Re-adds: global ids are still in the submitted set, only the
    // stream entry moves
    if !readd_datas.is_empty() {
        match shared
            .state
            .stream_add_batch(keys::TICKETS_UNASSIGNED, &readd_datas)
            .await
        {
            Ok(_) => {
                debug!(count = readd_datas.len(), "re-added valid participants");
                if let Err(err) = shared
                    .state
                    .stream_delete_messages(keys::CONSUMED_TICKETS, &readd_ids)
                    .await
                {
                    warn!(%err, "deleting re-added tickets from the consumed stream");
                }
            }
            Err(err) => {
                // Restore the intent so the next tick tries again
                warn!(%err, "re-adding tickets");
                for global_id in readd_globals {
                    shared.tickets_to_readd.insert(global_id);
                }
            }
        }
    }

    // Discards whose timers fired since the last tick
    let discards: Vec<Ticket> = {
        let mut discarded = shared.discarded_tickets.lock();
        let take = discarded.len().min(BATCH_LIMIT);
        discarded.drain(..take).collect()
    };
    if discards.is_empty() {
        return;
    }

    let global_ids: Vec<String> = discards.iter().map(|t| t.global_id.clone()).collect();
    let state_ids: Vec<StateId> = discards
        .iter()
        .map(|t| StateId(t.state_id.clone()))
        .collect();

    let removed = async {
        shared
            .state
            .set_remove_batch(keys::TICKETS_SUBMITTED, &global_ids)
            .await?;
        shared
            .state
            .stream_delete_messages(keys::CONSUMED_TICKETS, &state_ids)
            .await
    }
    .await;

    match removed {
        Ok(_) => {
            debug!(count = discards.len(), "discarded consumed tickets");
            for state_id in &state_ids {
                shared.discard_scheduled.remove(&state_id.0);
            }
        }
        Err(err) => {
            warn!(%err, "discarding consumed tickets, requeueing");
            let mut discarded = shared.discarded_tickets.lock();
            for ticket in discards.into_iter().rev() {
                discarded.push_front(ticket);
            }
        }
    }
}

/// Two update delays later, if nothing cancelled it, the entry flips to
/// discarded and joins the removal queue
fn schedule_discard(shared: Arc<DirectorShared>, state_id: String, ticket: Ticket) {
    let delay = shared.config.director_update_delay() * 2;
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let Some(mut scheduled) = shared.discard_scheduled.get_mut(&state_id) else {
            return;
        };
        if !*scheduled {
            *scheduled = true;
            drop(scheduled);
            shared.discarded_tickets.lock().push_back(ticket);
        }
    });
}

/// Retry stream writes that failed half-way through a move; runs every
/// fifth director tick
pub(super) async fn process_lost_tickets(shared: &Arc<DirectorShared>) {
    loop {
        let next = shared.lost_tickets.lock().pop_front();
        let Some((stream_key, datas)) = next else {
            break;
        };
        if let Err(err) = shared.state.stream_add_batch(&stream_key, &datas).await {
            warn!(%err, %stream_key, "lost-ticket retry failed, keeping queued");
            shared.lost_tickets.lock().push_front((stream_key, datas));
            break;
        }
        debug!(%stream_key, count = datas.len(), "recovered lost tickets");
    }
}
