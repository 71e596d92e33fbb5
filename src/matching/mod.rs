pub mod algorithm;
pub mod view;

use tracing::debug;

use crate::plugin::MatchPlugin;
use crate::ticket::{Ticket, TicketMatch};
use crate::MAX_FOR_RELIABLE;

use self::algorithm::{assemble_matches, find_candidates, preprocess};
use self::view::TicketView;

/// Result of one matching round over a pool snapshot
pub struct MatchOutcome {
    pub matches: Vec<TicketMatch>,
    /// False when victims of theft overflowed the retry buffer, i.e.
    /// another round over the residue is worth running immediately
    pub matched_all_it_could: bool,
}

/// Default candidate slot count for a given match size
pub fn candidates_size_for(match_size: usize) -> usize {
    8 * match_size.saturating_sub(1)
}

/// Run one matching round.
///
/// The fast (unreliable) pass works on bounded candidate slots and
/// usage pruning, trading completeness for memory. When that strands
/// enough victims of theft to fill a match, a reliable pass reruns just
/// the victims with unbounded candidate lists; that pass cannot strand
/// anyone new.
pub fn match_tickets(
    tickets: &[Ticket],
    match_size: usize,
    plugin: Option<&dyn MatchPlugin>,
    unreliable_only: bool,
) -> MatchOutcome {
    if tickets.len() < 2 || match_size < 2 {
        return MatchOutcome {
            matches: Vec::new(),
            matched_all_it_could: true,
        };
    }

    let candidates_size = candidates_size_for(match_size);
    let mut views: Vec<TicketView> = tickets
        .iter()
        .map(|ticket| TicketView::from_ticket(ticket, candidates_size))
        .collect();

    let priority_span = preprocess(&mut views);
    find_candidates(&views, candidates_size, priority_span, true);
    let unreliable = assemble_matches(&views, match_size, plugin, MAX_FOR_RELIABLE);

    let mut matches = unreliable.matches;

    if !unreliable_only && unreliable.victims.len() >= match_size {
        debug!(
            victims = unreliable.victims.len(),
            "rerunning victims of theft in reliable mode"
        );
        let mut reliable_views: Vec<TicketView> = unreliable
            .victims
            .iter()
            .map(|&index| TicketView::from_ticket(&tickets[index], 0))
            .collect();
        let span = preprocess(&mut reliable_views);
        find_candidates(&reliable_views, 0, span, false);
        let reliable = assemble_matches(&reliable_views, match_size, plugin, 0);
        matches.extend(reliable.matches);
    }

    MatchOutcome {
        matches,
        matched_all_it_could: unreliable.victims_out_of_buffer == 0,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ticket::Affinity;
    use std::collections::HashSet;
    use uuid::Uuid;

    fn plain_ticket() -> Ticket {
        Ticket {
            global_id: Uuid::new_v4().to_string(),
            ..Default::default()
        }
    }

    fn affinity_ticket(value: f32, max_margin: f32, soft: bool) -> Ticket {
        Ticket {
            global_id: Uuid::new_v4().to_string(),
            affinities: vec![Affinity {
                value,
                max_margin,
                prefer_disimilar: false,
                soft_margin: soft,
                priority_factor: 1.0,
            }],
            ..Default::default()
        }
    }

    fn pairs_of(outcome: &MatchOutcome) -> Vec<HashSet<String>> {
        outcome
            .matches
            .iter()
            .map(|m| m.matched_ticket_global_ids.iter().cloned().collect())
            .collect()
    }

    #[test]
    fn soft_affinity_pairs_by_similarity() {
        // 1200 with 1100, 1000 with 1000, fifty rounds for stability
        for _ in 0..50 {
            let t1200 = affinity_ticket(1200.0, 1000.0, true);
            let t1000a = affinity_ticket(1000.0, 1000.0, true);
            let t1000b = affinity_ticket(1000.0, 1000.0, true);
            let t1100 = affinity_ticket(1100.0, 1000.0, true);
            let id_1200 = t1200.global_id.clone();
            let id_1100 = t1100.global_id.clone();
            let id_1000a = t1000a.global_id.clone();
            let id_1000b = t1000b.global_id.clone();

            let outcome =
                match_tickets(&[t1200, t1000a, t1000b, t1100], 2, None, false);
            assert_eq!(outcome.matches.len(), 2);
            assert!(outcome.matched_all_it_could);

            let pairs = pairs_of(&outcome);
            let expected_a: HashSet<String> = [id_1200, id_1100].into_iter().collect();
            let expected_b: HashSet<String> = [id_1000a, id_1000b].into_iter().collect();
            assert!(pairs.contains(&expected_a), "1200 should pair with 1100");
            assert!(pairs.contains(&expected_b), "the 1000s should pair up");
        }
    }

    #[test]
    fn hard_margin_excludes_outlier() {
        let strict = affinity_ticket(1200.0, 100.0, false);
        let a = affinity_ticket(1000.0, 1000.0, true);
        let b = affinity_ticket(1000.0, 1000.0, true);
        let c = affinity_ticket(1050.0, 1000.0, true);
        let strict_id = strict.global_id.clone();
        let a_id = a.global_id.clone();
        let b_id = b.global_id.clone();

        let outcome = match_tickets(&[strict, a, b, c], 2, None, false);
        assert_eq!(outcome.matches.len(), 1);
        let pair: HashSet<String> = outcome.matches[0]
            .matched_ticket_global_ids
            .iter()
            .cloned()
            .collect();
        let expected: HashSet<String> = [a_id, b_id].into_iter().collect();
        assert_eq!(pair, expected);
        assert!(!pair.contains(&strict_id));
    }

    #[test]
    fn returns_nothing_below_two_tickets() {
        let outcome = match_tickets(&[plain_ticket()], 2, None, false);
        assert!(outcome.matches.is_empty());
        assert!(outcome.matched_all_it_could);
    }

    #[test]
    fn every_match_has_exactly_match_size_ids() {
        let tickets: Vec<Ticket> = (0..20).map(|_| plain_ticket()).collect();
        let outcome = match_tickets(&tickets, 4, None, false);
        assert_eq!(outcome.matches.len(), 5);
        for m in &outcome.matches {
            assert_eq!(m.matched_ticket_global_ids.len(), 4);
        }
    }

    #[test]
    fn matches_cover_disjoint_tickets() {
        let tickets: Vec<Ticket> = (0..50).map(|_| plain_ticket()).collect();
        let outcome = match_tickets(&tickets, 5, None, false);
        let mut seen = HashSet::new();
        for m in &outcome.matches {
            for id in &m.matched_ticket_global_ids {
                assert!(seen.insert(id.clone()));
            }
        }
    }

    #[test]
    fn parallel_round_matches_sequential_counts() {
        // Above MIN_FOR_PARALLEL the pair scan partitions across
        // threads; outcomes must agree in count and validity, not id
        let tickets: Vec<Ticket> = (0..1200).map(|_| plain_ticket()).collect();
        let outcome = match_tickets(&tickets, 2, None, false);
        assert_eq!(outcome.matches.len(), 600);
        let mut seen = HashSet::new();
        for m in &outcome.matches {
            assert_eq!(m.matched_ticket_global_ids.len(), 2);
            for id in &m.matched_ticket_global_ids {
                assert!(seen.insert(id.clone()));
            }
        }
    }
}
