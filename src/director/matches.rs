use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::state::{keys, StateId};
use crate::ticket::TicketMatch;
use crate::BATCH_LIMIT;

use super::DirectorShared;

/// Validate freshly posted matches and feed them to the reader channel.
/// Runs only while somebody is reading; consumed matches from the last
/// tick are deleted from the stream first.
pub(super) async fn process_matches(shared: &Arc<DirectorShared>) {
    let to_delete: Vec<StateId> = {
        let mut consume = shared.matches_to_consume.lock();
        std::mem::take(&mut *consume)
    };
    if !to_delete.is_empty() {
        match shared
            .state
            .stream_delete_messages(keys::MATCHES, &to_delete)
            .await
        {
            Ok(_) => {
                for state_id in &to_delete {
                    shared.received_match_state_ids.remove(&state_id.0);
                }
            }
            Err(err) => {
                warn!(%err, "deleting consumed matches, keeping them queued");
                shared.matches_to_consume.lock().extend(to_delete);
            }
        }
    }

    if shared.readers.load(Ordering::Relaxed) == 0 {
        return;
    }

    let entries = match shared.state.stream_read(keys::MATCHES, Some(BATCH_LIMIT)).await {
        Ok(entries) => entries,
        Err(err) => {
            warn!(%err, "reading the match stream");
            return;
        }
    };

    let mut unparsable: Vec<StateId> = Vec::new();
    for (state_id, data) in entries {
        if shared.received_match_state_ids.contains(&state_id.0) {
            continue;
        }
        let mut m = match TicketMatch::decode_from(&data) {
            Ok(m) => m,
            Err(err) => {
                warn!(%err, %state_id, "dropping unparsable match");
                unparsable.push(state_id);
                continue;
            }
        };
        m.state_id = state_id.0.clone();
        shared.received_match_state_ids.insert(state_id.0.clone());

        let participants = m.matched_ticket_global_ids.clone();
        let live = match shared
            .state
            .set_contains_batch(keys::TICKETS_SUBMITTED, &participants)
            .await
        {
            Ok(live) => live,
            Err(err) => {
                // Undo the dedup mark so the match is reprocessed next
                // tick
                warn!(%err, "validating match participants");
                shared.received_match_state_ids.remove(&state_id.0);
                continue;
            }
        };

        if live.iter().all(|live| *live) {
            if let Err(err) = shared
                .state
                .set_remove_batch(keys::TICKETS_SUBMITTED, &participants)
                .await
            {
                warn!(%err, "retiring matched tickets from the submitted set");
            }
        } else {
            // Cancelled participants leave; the rest were spent on a
            // match that will never be delivered whole, so they go
            // around again
            let mut gone: Vec<String> = Vec::new();
            for (id, live) in participants.iter().zip(&live) {
                if *live {
                    shared.tickets_to_readd.insert(id.clone());
                } else {
                    gone.push(id.clone());
                }
            }
            debug!(
                match_id = %m.global_id,
                invalid = gone.len(),
                "match with missing participants"
            );
            if let Err(err) = shared
                .state
                .set_remove_batch(keys::TICKETS_SUBMITTED, &gone)
                .await
            {
                warn!(%err, "removing invalid participants");
            }
        }

        // Unbounded channel: the send only fails when the director is
        // shutting down
        let _ = shared.match_tx.send(m);
    }

    if !unparsable.is_empty() {
        if let Err(err) = shared
            .state
            .stream_delete_messages(keys::MATCHES, &unparsable)
            .await
        {
            warn!(%err, "deleting unparsable matches");
        }
    }
}

/// Handle for one consumer of validated matches.
///
/// Matches arrive in director-reception order; each one stays in the
/// match stream until `consume` is called for it, so an undelivered
/// match survives a director restart.
pub struct MatchReader {
    shared: Arc<DirectorShared>,
}

impl MatchReader {
    pub(super) fn open(shared: Arc<DirectorShared>) -> Self {
        shared.readers.fetch_add(1, Ordering::Relaxed);
        Self { shared }
    }

    /// Next validated match; `None` when the director shut down.
    /// Readers take turns: each match goes to exactly one of them.
    pub async fn recv(&self) -> Option<TicketMatch> {
        self.shared.match_rx.lock().await.recv().await
    }

    /// Mark a delivered match for deletion from the match stream on the
    /// next director tick
    pub fn consume(&self, m: &TicketMatch) {
        self.shared
            .matches_to_consume
            .lock()
            .push(StateId(m.state_id.clone()));
    }

    /// Hand a match back for another reader
    pub fn return_match(&self, m: TicketMatch) {
        let _ = self.shared.match_tx.send(m);
    }
}

impl Drop for MatchReader {
    fn drop(&mut self) {
        self.shared.readers.fetch_sub(1, Ordering::Relaxed);
    }
}
