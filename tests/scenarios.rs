//! End-to-end scenarios: a director and a matchmaker wired through the
//! in-memory state, driven with shortened delays.

use std::sync::Arc;
use std::time::Duration;

use crymatch::config::Config;
use crymatch::director::Director;
use crymatch::matchmaker::status::MatchmakerStatus;
use crymatch::matchmaker::Matchmaker;
use crymatch::plugin::PluginRegistry;
use crymatch::state::{keys, MemoryState, State};
use crymatch::ticket::{Affinity, Requirement, RequirementGroup, Ticket, TicketMatch};

fn fast_config() -> Config {
    let mut config = Config {
        matchmaker_update_delay: 0.05,
        director_update_delay: 0.05,
        max_downtime_before_offline: 2.0,
        matchmaker_min_gather_time: 0.0,
        matchmaker_threads: 2,
        max_match_failures: 1000,
        ..Default::default()
    };
    config.validate().unwrap();
    config
}

async fn start_roles(config: Config) -> (Arc<dyn State>, Arc<Director>, Arc<Matchmaker>) {
    let state: Arc<dyn State> = Arc::new(MemoryState::new());
    let config = Arc::new(config);
    let director = Arc::new(Director::new(state.clone(), config.clone()));
    director.start().await.unwrap();
    let matchmaker = Arc::new(Matchmaker::new(
        state.clone(),
        config.clone(),
        PluginRegistry::new(),
    ));
    matchmaker.start();
    (state, director, matchmaker)
}

fn affinity_ticket(pool: &str, value: f32, max_margin: f32, soft: bool) -> Ticket {
    Ticket {
        matchmaking_pool_id: pool.into(),
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

async fn collect_matches(
    director: &Director,
    count: usize,
    within: Duration,
) -> Vec<TicketMatch> {
    let reader = director.reader();
    let deadline = tokio::time::Instant::now() + within;
    let mut out = Vec::new();
    while out.len() < count {
        let now = tokio::time::Instant::now();
        if now >= deadline {
            break;
        }
        match tokio::time::timeout(deadline - now, reader.recv()).await {
            Ok(Some(m)) => {
                reader.consume(&m);
                out.push(m);
            }
            _ => break,
        }
    }
    out
}

#[tokio::test(flavor = "multi_thread")]
async fn one_v_one_soft_affinity_prefers_similar() {
    let (_state, director, matchmaker) = start_roles(fast_config()).await;

    let mut ids = Vec::new();
    for value in [1200.0, 1000.0, 1000.0, 1100.0] {
        let ticket = affinity_ticket("", value, 1000.0, true);
        ids.push(director.submit_ticket(ticket).await.unwrap());
    }

    let matches = collect_matches(&director, 2, Duration::from_secs(10)).await;
    assert_eq!(matches.len(), 2, "expected both pairs to match");

    let pair_of = |m: &TicketMatch| -> Vec<String> {
        let mut pair = m.matched_ticket_global_ids.clone();
        pair.sort();
        pair
    };
    let mut expected_a = vec![ids[0].clone(), ids[3].clone()];
    expected_a.sort();
    let mut expected_b = vec![ids[1].clone(), ids[2].clone()];
    expected_b.sort();

    let pairs: Vec<Vec<String>> = matches.iter().map(pair_of).collect();
    assert!(pairs.contains(&expected_a), "1200 should pair with 1100");
    assert!(pairs.contains(&expected_b), "the two 1000s should pair");

    matchmaker.shutdown().await;
    director.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn hard_margin_leaves_outlier_unmatched() {
    let (_state, director, matchmaker) = start_roles(fast_config()).await;

    let strict = affinity_ticket("", 1200.0, 100.0, false);
    let strict_id = director.submit_ticket(strict).await.unwrap();
    let mut soft_ids = Vec::new();
    for value in [1000.0, 1000.0, 1050.0] {
        let ticket = affinity_ticket("", value, 1000.0, true);
        soft_ids.push(director.submit_ticket(ticket).await.unwrap());
    }

    let matches = collect_matches(&director, 1, Duration::from_secs(10)).await;
    assert_eq!(matches.len(), 1);
    let mut pair = matches[0].matched_ticket_global_ids.clone();
    pair.sort();
    let mut expected = vec![soft_ids[0].clone(), soft_ids[1].clone()];
    expected.sort();
    assert_eq!(pair, expected, "only the two 1000s may match");
    assert!(!pair.contains(&strict_id));

    // Nothing else should ever form
    let extra = collect_matches(&director, 1, Duration::from_millis(500)).await;
    assert!(extra.is_empty());

    matchmaker.shutdown().await;
    director.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn ten_v_ten_groups_by_gamemode() {
    let mut config = fast_config();
    config.matchmaker_pool_capacity = 100;
    let (_state, director, matchmaker) = start_roles(config).await;

    director.set_pool_match_size("gamemodes", 10).await.unwrap();

    // 10 + 10 full cohorts, 5 + 5 that cannot fill a match
    let mut gamemode_of = std::collections::HashMap::new();
    for (gamemode, count) in [(2.0f32, 10), (3.0, 10), (4.0, 5), (5.0, 5)] {
        for _ in 0..count {
            let ticket = Ticket {
                matchmaking_pool_id: "gamemodes".into(),
                state: vec![crymatch::ticket::FloatArray {
                    values: vec![gamemode],
                }],
                requirements: vec![RequirementGroup {
                    any: vec![Requirement {
                        key: 0,
                        ranged: false,
                        values: vec![gamemode],
                    }],
                }],
                ..Default::default()
            };
            let id = director.submit_ticket(ticket).await.unwrap();
            gamemode_of.insert(id, gamemode as i32);
        }
    }

    let matches = collect_matches(&director, 2, Duration::from_secs(15)).await;
    assert_eq!(matches.len(), 2, "one match per full cohort");
    for m in &matches {
        assert_eq!(m.matched_ticket_global_ids.len(), 10);
        let modes: std::collections::HashSet<i32> = m
            .matched_ticket_global_ids
            .iter()
            .map(|id| gamemode_of[id])
            .collect();
        assert_eq!(modes.len(), 1, "a match never mixes gamemodes");
    }

    matchmaker.shutdown().await;
    director.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn assignment_routes_two_pools_and_gathers() {
    let mut config = fast_config();
    config.matchmaker_min_gather_time = 2.0;
    let (state, director, matchmaker) = start_roles(config).await;

    director.submit_ticket(Ticket::default()).await.unwrap();
    director
        .submit_ticket(Ticket {
            matchmaking_pool_id: "test_pool".into(),
            ..Default::default()
        })
        .await
        .unwrap();
    // Impossible requirement: nothing carries state key 0
    director
        .submit_ticket(Ticket {
            requirements: vec![RequirementGroup {
                any: vec![Requirement {
                    key: 0,
                    ranged: false,
                    values: vec![99.0],
                }],
            }],
            ..Default::default()
        })
        .await
        .unwrap();

    // Let submission, assignment, fetch and the gather start land
    tokio::time::sleep(Duration::from_millis(800)).await;

    let status = MatchmakerStatus::from_text(
        &state.get_string(matchmaker.id()).await.unwrap().unwrap(),
    )
    .unwrap();
    assert_eq!(status.processing_tickets, 3);
    assert_eq!(status.pools.len(), 2);
    let default_pool = status.pools.iter().find(|p| p.name.is_empty()).unwrap();
    assert_eq!(default_pool.in_queue, 2);
    assert!(default_pool.gathering, "default pool should be gathering");
    let test_pool = status.pools.iter().find(|p| p.name == "test_pool").unwrap();
    assert_eq!(test_pool.in_queue, 1);
    assert!(!test_pool.gathering, "a single ticket is no reason to wake");

    // After the gather window and the failed round, both residues are
    // queued again and nothing gathers
    tokio::time::sleep(Duration::from_secs(3)).await;
    let status = MatchmakerStatus::from_text(
        &state.get_string(matchmaker.id()).await.unwrap().unwrap(),
    )
    .unwrap();
    let default_pool = status.pools.iter().find(|p| p.name.is_empty()).unwrap();
    assert_eq!(default_pool.in_queue, 2);
    assert!(!default_pool.gathering);
    let test_pool = status.pools.iter().find(|p| p.name == "test_pool").unwrap();
    assert_eq!(test_pool.in_queue, 1);

    matchmaker.shutdown().await;
    director.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn expired_tickets_leave_without_matching() {
    let mut config = fast_config();
    config.matchmaker_min_gather_time = 2.0;
    let (state, director, matchmaker) = start_roles(config).await;

    let mut ticket = Ticket::default();
    ticket.max_age_seconds = 2;
    director.submit_ticket(ticket.clone()).await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    director.submit_ticket(ticket).await.unwrap();

    tokio::time::sleep(Duration::from_secs(5)).await;

    assert!(
        state
            .get_set_values(keys::TICKETS_SUBMITTED)
            .await
            .unwrap()
            .is_empty(),
        "expired tickets must leave the submitted set"
    );
    assert!(
        state
            .stream_read(keys::MATCHES, None)
            .await
            .unwrap()
            .is_empty(),
        "expired tickets must not match"
    );

    matchmaker.shutdown().await;
    director.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn bulk_submit_is_fast_and_fully_assigned() {
    let mut config = fast_config();
    config.matchmaker_pool_capacity = 500;
    let (_state, director, matchmaker) = start_roles(config).await;

    // Unmatchable tickets stay assigned, which keeps the count stable
    let ticket = Ticket {
        requirements: vec![RequirementGroup {
            any: vec![Requirement {
                key: 0,
                ranged: false,
                values: vec![99.0],
            }],
        }],
        ..Default::default()
    };

    const COUNT: usize = 2000;
    let started = std::time::Instant::now();
    for _ in 0..COUNT {
        director.submit_ticket(ticket.clone()).await.unwrap();
    }
    assert!(
        started.elapsed() < Duration::from_secs(3),
        "bulk submit took {:?}",
        started.elapsed()
    );

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let processing = matchmaker.status().processing_tickets;
        if processing == COUNT {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "only {processing}/{COUNT} tickets reached the matchmaker"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    matchmaker.shutdown().await;
    director.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn second_director_refuses_to_start() {
    let state: Arc<dyn State> = Arc::new(MemoryState::new());
    let config = Arc::new(fast_config());

    let first = Director::new(state.clone(), config.clone());
    first.start().await.unwrap();

    // The running pinger keeps the lease alive through the wait window
    let second = Director::new(state.clone(), config.clone());
    let err = second.start().await.unwrap_err();
    assert!(matches!(
        err,
        crymatch::error::MatchmakingError::LeaderConflict
    ));

    first.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn removed_ticket_is_dropped_at_assignment() {
    // No matchmaker yet: the first ticket has to wait unassigned
    let state: Arc<dyn State> = Arc::new(MemoryState::new());
    let config = Arc::new(fast_config());
    let director = Arc::new(Director::new(state.clone(), config.clone()));
    director.start().await.unwrap();

    let first = director.submit_ticket(Ticket::default()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    director.remove_ticket(&first).await.unwrap();

    // Now a matchmaker comes up and a partner arrives; the cancelled
    // ticket is dropped at assignment so the pair can never form
    let matchmaker = Arc::new(Matchmaker::new(
        state.clone(),
        config.clone(),
        PluginRegistry::new(),
    ));
    matchmaker.start();
    director.submit_ticket(Ticket::default()).await.unwrap();

    let matches = collect_matches(&director, 1, Duration::from_secs(2)).await;
    assert!(matches.is_empty(), "a removed ticket must not match");
    assert!(!state
        .set_contains(keys::TICKETS_SUBMITTED, &first)
        .await
        .unwrap());

    matchmaker.shutdown().await;
    director.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_global_id_is_rejected() {
    let (_state, director, _matchmaker) = start_roles(fast_config()).await;

    let ticket = Ticket {
        global_id: "11111111-2222-3333-4444-555555555555".into(),
        ..Default::default()
    };
    director.submit_ticket(ticket.clone()).await.unwrap();
    let err = director.submit_ticket(ticket).await.unwrap_err();
    assert!(matches!(
        err,
        crymatch::error::MatchmakingError::DuplicateId(_)
    ));
}
