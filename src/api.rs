use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::header::CONTENT_TYPE;
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::director::Director;
use crate::error::TicketStatus;
use crate::ticket::Ticket;
use crate::BATCH_LIMIT;

/// Shared handler context
#[derive(Clone)]
pub struct ApiContext {
    pub director: Arc<Director>,
}

pub fn router(ctx: ApiContext) -> Router {
    Router::new()
        .route("/tickets", post(submit_ticket))
        .route("/tickets/{global_id}", axum::routing::delete(remove_ticket))
        .route("/matches", get(stream_matches))
        .route(
            "/pools/{pool_id}/configuration",
            get(get_pool_configuration).put(set_pool_configuration),
        )
        .with_state(ctx)
}

#[derive(Debug, Serialize)]
struct TicketResponse {
    status: TicketStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    global_id: Option<String>,
}

async fn submit_ticket(
    State(ctx): State<ApiContext>,
    Json(ticket): Json<Ticket>,
) -> Json<TicketResponse> {
    match ctx.director.submit_ticket(ticket).await {
        Ok(global_id) => Json(TicketResponse {
            status: TicketStatus::Ok,
            global_id: Some(global_id),
        }),
        Err(err) => {
            warn!(%err, "ticket submit rejected");
            Json(TicketResponse {
                status: (&err).into(),
                global_id: None,
            })
        }
    }
}

async fn remove_ticket(
    State(ctx): State<ApiContext>,
    Path(global_id): Path<String>,
) -> Json<TicketResponse> {
    match ctx.director.remove_ticket(&global_id).await {
        Ok(()) => Json(TicketResponse {
            status: TicketStatus::Ok,
            global_id: Some(global_id),
        }),
        Err(err) => Json(TicketResponse {
            status: (&err).into(),
            global_id: None,
        }),
    }
}

/// Run the reader loop into a bounded byte channel. A match is consumed
/// only after its line is accepted by the channel; once the consumer is
/// gone the pending send fails and the in-flight match goes back for
/// the next reader.
fn spawn_match_feed(director: Arc<Director>) -> mpsc::Receiver<Bytes> {
    let (tx, rx) = mpsc::channel::<Bytes>(BATCH_LIMIT);
    tokio::spawn(async move {
        director
            .read_incoming_matches(CancellationToken::new(), move |m| {
                let tx = tx.clone();
                async move {
                    let mut line = serde_json::to_vec(&m)?;
                    line.push(b'\n');
                    tx.send(Bytes::from(line))
                        .await
                        .map_err(|_| anyhow::anyhow!("match consumer went away"))
                }
            })
            .await;
    });
    rx
}

/// Long-lived NDJSON stream of validated matches, driven by the reader
/// loop so delivery and consumption stay tied together
async fn stream_matches(State(ctx): State<ApiContext>) -> Response {
    let feed = spawn_match_feed(ctx.director.clone());
    let stream = futures::stream::unfold(feed, |mut feed| async move {
        let line = feed.recv().await?;
        Some((Ok::<_, Infallible>(line), feed))
    });

    Response::builder()
        .header(CONTENT_TYPE, "application/x-ndjson")
        .body(Body::from_stream(stream))
        .expect("static response parts")
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PoolConfiguration {
    pub pool_id: String,
    pub match_size: usize,
}

async fn get_pool_configuration(
    State(ctx): State<ApiContext>,
    Path(pool_id): Path<String>,
) -> Json<PoolConfiguration> {
    let match_size = ctx
        .director
        .pool_match_size(&pool_id)
        .await
        .ok()
        .flatten()
        .unwrap_or(2);
    Json(PoolConfiguration {
        pool_id,
        match_size,
    })
}

async fn set_pool_configuration(
    State(ctx): State<ApiContext>,
    Path(pool_id): Path<String>,
    Json(configuration): Json<PoolConfiguration>,
) -> Json<TicketResponse> {
    match ctx
        .director
        .set_pool_match_size(&pool_id, configuration.match_size)
        .await
    {
        Ok(()) => Json(TicketResponse {
            status: TicketStatus::Ok,
            global_id: None,
        }),
        Err(err) => Json(TicketResponse {
            status: (&err).into(),
            global_id: None,
        }),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::Config;
    use crate::state::{keys, MemoryState, State as _};
    use crate::ticket::TicketMatch;
    use std::time::Duration;

    fn fast_config() -> Arc<Config> {
        let mut config = Config {
            matchmaker_update_delay: 0.05,
            director_update_delay: 0.05,
            max_downtime_before_offline: 2.0,
            ..Default::default()
        };
        config.validate().unwrap();
        Arc::new(config)
    }

    async fn seeded_match(state: &MemoryState) -> TicketMatch {
        let m = TicketMatch {
            state_id: String::new(),
            global_id: uuid::Uuid::new_v4().to_string(),
            matched_ticket_global_ids: vec![
                uuid::Uuid::new_v4().to_string(),
                uuid::Uuid::new_v4().to_string(),
            ],
        };
        state
            .set_add_batch(keys::TICKETS_SUBMITTED, &m.matched_ticket_global_ids)
            .await
            .unwrap();
        state
            .stream_add(keys::MATCHES, m.encode_to_bytes())
            .await
            .unwrap();
        m
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn feed_delivers_ndjson_and_consumes_after_send() {
        let state = Arc::new(MemoryState::new());
        let director = Arc::new(Director::new(state.clone(), fast_config()));
        director.start().await.unwrap();

        let seeded = seeded_match(&state).await;
        let mut feed = spawn_match_feed(director.clone());

        let line = tokio::time::timeout(Duration::from_secs(5), feed.recv())
            .await
            .unwrap()
            .unwrap();
        let delivered: TicketMatch = serde_json::from_slice(&line).unwrap();
        assert_eq!(delivered.global_id, seeded.global_id);
        assert_eq!(
            delivered.matched_ticket_global_ids,
            seeded.matched_ticket_global_ids
        );

        // The send succeeded, so the match leaves the stream on a
        // following tick
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(state
            .stream_read(keys::MATCHES, None)
            .await
            .unwrap()
            .is_empty());

        director.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn dropped_feed_returns_match_for_the_next_reader() {
        let state = Arc::new(MemoryState::new());
        let director = Arc::new(Director::new(state.clone(), fast_config()));
        director.start().await.unwrap();

        // Consumer disappears before anything arrives; the first send
        // must fail and hand the match back
        let feed = spawn_match_feed(director.clone());
        drop(feed);
        let seeded = seeded_match(&state).await;

        tokio::time::sleep(Duration::from_millis(500)).await;
        let reader = director.reader();
        let returned = tokio::time::timeout(Duration::from_secs(5), reader.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(returned.global_id, seeded.global_id);

        // Never consumed, so it is still in the stream
        assert_eq!(
            state.stream_read(keys::MATCHES, None).await.unwrap().len(),
            1
        );

        director.shutdown().await;
    }
}
