use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;

use crate::ticket::Ticket;

/// A candidate stored in another ticket's slots: an index into the
/// round's view table plus the rating it scored. Index pairs instead of
/// references keep the ticket↔candidate graph acyclic.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub index: usize,
    pub rating: f32,
}

pub struct AffinityView {
    pub value: f32,
    /// Precomputed 1/max_margin; 0 when the margin is non-positive
    pub max_margin_inverted: f32,
    pub prefer_disimilar: bool,
    pub soft_margin: bool,
    pub priority_factor: f32,
}

pub struct RequirementView {
    pub key: i32,
    pub ranged: bool,
    /// Ranged requirements always carry exactly two values here
    pub values: Vec<f32>,
}

pub struct RequirementGroupView {
    pub any: Vec<RequirementView>,
}

/// Matching-optimized rendition of a ticket for one round.
///
/// Built per round from the immutable `Ticket`, padded and priority-
/// annotated by preprocessing, then shared read-only across the pair
/// scan (candidate slots and the usage counter are the only mutable
/// parts, and both are thread-safe).
pub struct TicketView {
    pub global_id: String,
    pub expiry: i64,
    pub priority_base: i32,
    pub age_priority_factor: f32,

    /// Padded to the round-wide max state size; missing slots are empty
    pub state: Vec<Vec<f32>>,

    pub affinities: Vec<AffinityView>,
    pub requirements: Vec<RequirementGroupView>,

    /// Filled during preprocessing, before the views are shared
    pub base_priority: f32,

    /// How many other tickets currently hold this one as a candidate
    pub candidate_usage_by: AtomicU32,

    /// Descending by rating, leftmost = best. Fixed length when bounded.
    slots: Mutex<Vec<Option<Candidate>>>,

    /// Rating bits of the worst slot while the array is full, or
    /// NEG_INFINITY bits otherwise. Read without the lock as a
    /// short-circuit before locking.
    worst_full_rating: AtomicU32,

    /// 0 = unbounded (reliable mode)
    slot_capacity: usize,
}

impl TicketView {
    /// `slot_capacity` of 0 builds the unbounded (reliable mode) view
    pub fn from_ticket(ticket: &Ticket, slot_capacity: usize) -> Self {
        let affinities = ticket
            .affinities
            .iter()
            .map(|a| AffinityView {
                value: a.value,
                max_margin_inverted: if a.max_margin > 0.0 {
                    1.0 / a.max_margin
                } else {
                    0.0
                },
                prefer_disimilar: a.prefer_disimilar,
                soft_margin: a.soft_margin,
                priority_factor: a.priority_factor,
            })
            .collect();

        let requirements = ticket
            .requirements
            .iter()
            .map(|group| RequirementGroupView {
                any: group
                    .any
                    .iter()
                    .map(|req| {
                        let mut values = req.values.clone();
                        if req.ranged {
                            // Ranged must carry [lo, hi]; a single value
                            // becomes a point range, none becomes [0, 0]
                            match values.len() {
                                0 => values = vec![0.0, 0.0],
                                1 => values.push(values[0]),
                                _ => values.truncate(2),
                            }
                        }
                        RequirementView {
                            key: req.key,
                            ranged: req.ranged,
                            values,
                        }
                    })
                    .collect(),
            })
            .collect();

        Self {
            global_id: ticket.global_id.clone(),
            expiry: ticket.timestamp_expiry_matchmaker,
            priority_base: ticket.priority_base,
            age_priority_factor: ticket.age_priority_factor,
            state: ticket.state.iter().map(|fa| fa.values.clone()).collect(),
            affinities,
            requirements,
            base_priority: 0.0,
            candidate_usage_by: AtomicU32::new(0),
            slots: Mutex::new(vec![None; slot_capacity]),
            worst_full_rating: AtomicU32::new(f32::NEG_INFINITY.to_bits()),
            slot_capacity,
        }
    }

    /// Stored candidates, best first
    pub fn candidates_snapshot(&self) -> Vec<Candidate> {
        self.slots.lock().iter().flatten().copied().collect()
    }
}

/// Offer `candidate` to `views[owner]`'s slot array.
///
/// Keeps the array sorted descending by rating. A candidate that rates
/// no better than the worst stored slot of a full array is dropped. On
/// insert the new candidate's target gets `candidate_usage_by + 1`; a
/// bumped-off tail gets its target's counter decremented, exactly once
/// each. Safe to call from multiple threads: the owner's slot array is
/// guarded by its mutex and the counters are atomic.
pub fn add_candidate(views: &[TicketView], owner: usize, candidate: Candidate) -> bool {
    let view = &views[owner];

    // Relaxed pre-check against the worst slot of a full array, without
    // taking the lock
    if view.slot_capacity > 0 {
        let worst = f32::from_bits(view.worst_full_rating.load(Ordering::Relaxed));
        if candidate.rating <= worst {
            return false;
        }
    }

    let mut slots = view.slots.lock();

    if view.slot_capacity > 0 {
        if let Some(last) = slots.last().and_then(|s| s.as_ref()) {
            if candidate.rating <= last.rating {
                return false;
            }
        }
    }

    // First slot rated strictly less than the newcomer, or empty
    let position = slots
        .iter()
        .position(|slot| match slot {
            None => true,
            Some(stored) => stored.rating < candidate.rating,
        })
        .unwrap_or(slots.len());

    if view.slot_capacity > 0 && position >= slots.len() {
        return false;
    }

    slots.insert(position, Some(candidate));

    if view.slot_capacity > 0 {
        // Shift the rest down by one; the bumped-off tail releases its
        // hold on its target
        if let Some(bumped) = slots.pop().flatten() {
            views[bumped.index]
                .candidate_usage_by
                .fetch_sub(1, Ordering::Relaxed);
        }
        let worst = match slots.last().and_then(|s| s.as_ref()) {
            Some(stored) => stored.rating,
            None => f32::NEG_INFINITY,
        };
        view.worst_full_rating
            .store(worst.to_bits(), Ordering::Relaxed);
    }

    views[candidate.index]
        .candidate_usage_by
        .fetch_add(1, Ordering::Relaxed);
    true
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ticket::{Requirement, RequirementGroup, Ticket};

    fn blank_views(count: usize, slot_capacity: usize) -> Vec<TicketView> {
        (0..count)
            .map(|i| {
                let ticket = Ticket {
                    global_id: format!("t{i}"),
                    ..Default::default()
                };
                TicketView::from_ticket(&ticket, slot_capacity)
            })
            .collect()
    }

    fn usage(views: &[TicketView], i: usize) -> u32 {
        views[i].candidate_usage_by.load(Ordering::Relaxed)
    }

    #[test]
    fn keeps_descending_order() {
        let views = blank_views(5, 3);
        assert!(add_candidate(&views, 0, Candidate { index: 1, rating: 1.0 }));
        assert!(add_candidate(&views, 0, Candidate { index: 2, rating: 3.0 }));
        assert!(add_candidate(&views, 0, Candidate { index: 3, rating: 2.0 }));

        let ratings: Vec<f32> = views[0]
            .candidates_snapshot()
            .iter()
            .map(|c| c.rating)
            .collect();
        assert_eq!(ratings, vec![3.0, 2.0, 1.0]);
    }

    #[test]
    fn overflow_bumps_tail_and_adjusts_usage_once() {
        let views = blank_views(6, 2);
        add_candidate(&views, 0, Candidate { index: 1, rating: 1.0 });
        add_candidate(&views, 0, Candidate { index: 2, rating: 2.0 });
        assert_eq!(usage(&views, 1), 1);
        assert_eq!(usage(&views, 2), 1);

        // 3 bumps 1 off the tail
        assert!(add_candidate(&views, 0, Candidate { index: 3, rating: 5.0 }));
        assert_eq!(usage(&views, 1), 0);
        assert_eq!(usage(&views, 3), 1);

        let stored: Vec<usize> = views[0]
            .candidates_snapshot()
            .iter()
            .map(|c| c.index)
            .collect();
        assert_eq!(stored, vec![3, 2]);
    }

    #[test]
    fn rejection_leaves_counters_unchanged() {
        let views = blank_views(5, 2);
        add_candidate(&views, 0, Candidate { index: 1, rating: 2.0 });
        add_candidate(&views, 0, Candidate { index: 2, rating: 3.0 });

        // Equal to the worst stored slot of a full array = dropped
        assert!(!add_candidate(&views, 0, Candidate { index: 3, rating: 2.0 }));
        assert!(!add_candidate(&views, 0, Candidate { index: 4, rating: 1.0 }));
        assert_eq!(usage(&views, 3), 0);
        assert_eq!(usage(&views, 4), 0);
        assert_eq!(usage(&views, 1), 1);
        assert_eq!(usage(&views, 2), 1);
    }

    #[test]
    fn equal_rating_keeps_earlier_candidate_ahead() {
        let views = blank_views(4, 3);
        add_candidate(&views, 0, Candidate { index: 1, rating: 2.0 });
        add_candidate(&views, 0, Candidate { index: 2, rating: 2.0 });

        let stored: Vec<usize> = views[0]
            .candidates_snapshot()
            .iter()
            .map(|c| c.index)
            .collect();
        assert_eq!(stored, vec![1, 2]);
    }

    #[test]
    fn unbounded_view_never_drops() {
        let views = blank_views(5, 0);
        for i in 1..5 {
            assert!(add_candidate(&views, 0, Candidate { index: i, rating: -(i as f32) }));
        }
        assert_eq!(views[0].candidates_snapshot().len(), 4);
    }

    #[test]
    fn ranged_requirement_normalized_to_two_values() {
        let ticket = Ticket {
            requirements: vec![RequirementGroup {
                any: vec![
                    Requirement {
                        key: 0,
                        ranged: true,
                        values: vec![3.0],
                    },
                    Requirement {
                        key: 1,
                        ranged: true,
                        values: vec![],
                    },
                ],
            }],
            ..Default::default()
        };
        let view = TicketView::from_ticket(&ticket, 4);
        assert_eq!(view.requirements[0].any[0].values, vec![3.0, 3.0]);
        assert_eq!(view.requirements[0].any[1].values, vec![0.0, 0.0]);
    }

    #[test]
    fn zero_margin_inverts_to_zero() {
        let ticket = Ticket {
            affinities: vec![crate::ticket::Affinity {
                value: 1.0,
                max_margin: 0.0,
                prefer_disimilar: false,
                soft_margin: true,
                priority_factor: 1.0,
            }],
            ..Default::default()
        };
        let view = TicketView::from_ticket(&ticket, 4);
        assert_eq!(view.affinities[0].max_margin_inverted, 0.0);
    }
}
