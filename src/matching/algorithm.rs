use rand::Rng;
use rayon::prelude::*;
use tracing::warn;
use uuid::Uuid;

use crate::plugin::{MatchPlugin, PluginCandidate};
use crate::ticket::TicketMatch;
use crate::MIN_FOR_PARALLEL;

use super::view::{add_candidate, Candidate, RequirementView, TicketView};

/// Scan once for expiry extremes, pad every state matrix to the
/// round-wide max, and fill in per-ticket base priorities. Returns the
/// priority span (max − min base priority) used to scale tie-break noise.
pub fn preprocess(views: &mut [TicketView]) -> f32 {
    if views.is_empty() {
        return 0.0;
    }

    let mut min_expire = i64::MAX;
    let mut max_expire = i64::MIN;
    let mut max_state_size = 0;
    for view in views.iter() {
        min_expire = min_expire.min(view.expiry);
        max_expire = max_expire.max(view.expiry);
        max_state_size = max_state_size.max(view.state.len());
    }

    let expire_range = (max_expire - min_expire) as f64;

    let mut min_priority = f64::MAX;
    let mut max_priority = f64::MIN;
    for view in views.iter_mut() {
        view.state.resize(max_state_size, Vec::new());

        // Oldest expiry normalizes to 1, newest to 0; a degenerate range
        // contributes nothing
        let age_normalized = if expire_range == 0.0 {
            0.0
        } else {
            1.0 - (view.expiry - min_expire) as f64 / expire_range
        };
        let base = f64::from(view.priority_base)
            + age_normalized * f64::from(view.age_priority_factor);
        view.base_priority = base as f32;
        min_priority = min_priority.min(base);
        max_priority = max_priority.max(base);
    }

    (max_priority - min_priority) as f32
}

fn requirement_satisfied(req: &RequirementView, state: &[Vec<f32>]) -> bool {
    // A key beyond the other side's (padded) state vector fails this
    // individual requirement; the enclosing group may still pass
    let Ok(key) = usize::try_from(req.key) else {
        return false;
    };
    let Some(entry) = state.get(key) else {
        return false;
    };
    if req.ranged {
        let (lo, hi) = (req.values[0], req.values[1]);
        entry.first().is_some_and(|v| *v >= lo && *v <= hi)
    } else {
        req.values
            .iter()
            .any(|want| entry.iter().any(|have| have == want))
    }
}

/// Every group of `of` must be satisfied by `against`'s state; a group
/// passes if any of its entries does
pub fn check_requirements(of: &TicketView, against: &TicketView) -> bool {
    of.requirements.iter().all(|group| {
        group
            .any
            .iter()
            .any(|req| requirement_satisfied(req, &against.state))
    })
}

/// Pairwise affinity comparison, truncating to the shorter list.
/// `None` is a hard-margin veto; otherwise the per-side priority
/// contributions to add to the pair's ratings.
pub fn compare_affinities(a: &TicketView, b: &TicketView) -> Option<(f32, f32)> {
    let count = a.affinities.len().min(b.affinities.len());
    let mut priority_for_a = 0.0;
    let mut priority_for_b = 0.0;
    for i in 0..count {
        let fa = &a.affinities[i];
        let fb = &b.affinities[i];
        let diff = (fa.value - fb.value).abs();

        let mut norm_a = (diff * fa.max_margin_inverted).clamp(0.0, 1.0);
        let mut norm_b = (diff * fb.max_margin_inverted).clamp(0.0, 1.0);
        if !fa.prefer_disimilar {
            norm_a = 1.0 - norm_a;
        }
        if !fb.prefer_disimilar {
            norm_b = 1.0 - norm_b;
        }

        if !fa.soft_margin && norm_a == 0.0 {
            return None;
        }
        if !fb.soft_margin && norm_b == 0.0 {
            return None;
        }

        priority_for_a += norm_a * fa.priority_factor;
        priority_for_b += norm_b * fb.priority_factor;
    }
    Some((priority_for_a, priority_for_b))
}

/// Pair scan for one outer index: rate `a` against every later `b` and
/// offer each to the other's slots. The same noise is used for both
/// directions of a pair.
fn scan_pairs_for<R: Rng>(
    views: &[TicketView],
    a: usize,
    candidates_size: usize,
    noise_span: f32,
    unreliable: bool,
    rng: &mut R,
) {
    for b in (a + 1)..views.len() {
        // Pile-up guard: a ticket already held by 3x more tickets than
        // fit in a slot array is not worth another slot (unreliable only)
        if unreliable
            && views[b]
                .candidate_usage_by
                .load(std::sync::atomic::Ordering::Relaxed) as usize
                > candidates_size * 3
        {
            continue;
        }

        if !check_requirements(&views[a], &views[b])
            || !check_requirements(&views[b], &views[a])
        {
            continue;
        }

        let Some((priority_for_a, priority_for_b)) = compare_affinities(&views[a], &views[b])
        else {
            continue;
        };

        let noise: f32 = rng.random_range(0.0..noise_span);
        add_candidate(
            views,
            a,
            Candidate {
                index: b,
                rating: noise + views[b].base_priority + priority_for_a,
            },
        );
        add_candidate(
            views,
            b,
            Candidate {
                index: a,
                rating: noise + views[a].base_priority + priority_for_b,
            },
        );
    }
}

/// Fill candidate slots for every unordered pair. Partitions the outer
/// index range across threads for large rounds; the slot arrays and
/// usage counters are safe to mutate concurrently.
pub fn find_candidates(
    views: &[TicketView],
    candidates_size: usize,
    priority_span: f32,
    unreliable: bool,
) {
    if views.len() < 2 {
        return;
    }
    // Non-zero noise breaks identical-priority ties; too small is worse
    // than none at dissimilar priorities
    let noise_span = (priority_span * 0.05).max(0.001);

    if views.len() >= MIN_FOR_PARALLEL {
        (0..views.len() - 1).into_par_iter().for_each(|a| {
            let mut rng = rand::rng();
            scan_pairs_for(views, a, candidates_size, noise_span, unreliable, &mut rng);
        });
    } else {
        let mut rng = rand::rng();
        for a in 0..views.len() - 1 {
            scan_pairs_for(views, a, candidates_size, noise_span, unreliable, &mut rng);
        }
    }
}

pub struct AssembleResult {
    pub matches: Vec<TicketMatch>,
    /// View indices tagged as victims of theft, up to the buffer capacity
    pub victims: Vec<usize>,
    /// Victims there was no buffer room for
    pub victims_out_of_buffer: usize,
}

/// Greedy assembly in input order: each unconsumed ticket takes its best
/// still-available candidates. `victims_capacity` of 0 disables victim
/// tagging (reliable mode cannot produce victims).
pub fn assemble_matches(
    views: &[TicketView],
    match_size: usize,
    plugin: Option<&dyn MatchPlugin>,
    victims_capacity: usize,
) -> AssembleResult {
    let want = match_size.saturating_sub(1);
    let mut consumed = vec![false; views.len()];
    let mut matches = Vec::new();
    let mut victims = Vec::new();
    let mut victims_out_of_buffer = 0;

    let picking_plugin = plugin.filter(|p| p.override_candidate_picking());

    for owner in 0..views.len() {
        if consumed[owner] || want == 0 {
            continue;
        }
        consumed[owner] = true;

        let slots = views[owner].candidates_snapshot();

        // Walk best-to-worst, collecting available candidates and
        // counting how many were already taken by earlier matches
        let mut picked: Vec<usize> = Vec::with_capacity(want);
        let mut candidates_stolen = 0;
        for candidate in &slots {
            if picked.len() == want {
                break;
            }
            if consumed[candidate.index] {
                candidates_stolen += 1;
                continue;
            }
            picked.push(candidate.index);
        }

        let group = if picked.len() < want {
            None
        } else if let Some(plugin) = picking_plugin {
            pick_with_plugin(views, owner, &slots, &picked, &consumed, plugin)
        } else {
            Some(picked.clone())
        };

        match group {
            Some(group) => {
                for &index in &group {
                    consumed[index] = true;
                }
                let mut ids = Vec::with_capacity(match_size);
                ids.push(views[owner].global_id.clone());
                ids.extend(group.iter().map(|&i| views[i].global_id.clone()));
                matches.push(TicketMatch {
                    state_id: String::new(),
                    global_id: Uuid::new_v4().to_string(),
                    matched_ticket_global_ids: ids,
                });
            }
            None => {
                // Not filled (or the plugin spoiled it): nobody in the
                // tentative group stays held
                if candidates_stolen > want {
                    if victims.len() < victims_capacity {
                        victims.push(owner);
                    } else if victims_capacity > 0 {
                        victims_out_of_buffer += 1;
                    }
                }
            }
        }
    }

    AssembleResult {
        matches,
        victims,
        victims_out_of_buffer,
    }
}

/// Give the pool plugin a chance to rewrite the default (best-rated)
/// picks. Returns the validated group of view indices, or `None` when
/// the plugin's picks invalidate the match.
fn pick_with_plugin(
    views: &[TicketView],
    owner: usize,
    slots: &[Candidate],
    default_picked: &[usize],
    consumed: &[bool],
    plugin: &dyn MatchPlugin,
) -> Option<Vec<usize>> {
    // Candidates array: owner first, then every stored candidate
    let mut candidates = Vec::with_capacity(slots.len() + 1);
    candidates.push(PluginCandidate {
        global_id: &views[owner].global_id,
        rating: 0.0,
        state: &views[owner].state,
    });
    for candidate in slots {
        candidates.push(PluginCandidate {
            global_id: &views[candidate.index].global_id,
            rating: candidate.rating,
            state: &views[candidate.index].state,
        });
    }

    // Defaults are the best-rated available candidates, as indices into
    // the candidates array
    let mut picks: Vec<usize> = default_picked
        .iter()
        .map(|&view_index| {
            1 + slots
                .iter()
                .position(|c| c.index == view_index)
                .expect("picked view came from these slots")
        })
        .collect();

    if !plugin.pick_match_candidates(&candidates, &mut picks) {
        // Plugin declined; keep the defaults
        return Some(default_picked.to_vec());
    }

    // Owner pick, out of range, duplicate, or an already-consumed
    // candidate invalidates the whole match
    let mut group = Vec::with_capacity(picks.len());
    for &pick in &picks {
        if pick == 0 || pick > slots.len() {
            warn!(plugin = plugin.name(), pick, "plugin pick out of range");
            return None;
        }
        let view_index = slots[pick - 1].index;
        if consumed[view_index] || group.contains(&view_index) {
            warn!(plugin = plugin.name(), pick, "plugin picked an unavailable candidate");
            return None;
        }
        group.push(view_index);
    }
    Some(group)
}
