// =============================================================================
// Client WebSocket — push stream for chain and commodity snapshots
// =============================================================================
//
// Clients connect to `/api/v1/ws?token=<token>` and receive a full snapshot
// immediately, then periodic snapshots whenever the state version moved:
// roughly 1 Hz while any market is open, 0.5 Hz otherwise. Ping frames are
// answered; anything else from the client is treated as a heartbeat.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};

use crate::api::auth::token_matches;
use crate::app_state::CoreContext;
use crate::types::Exchange;

#[derive(Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(ctx): State<Arc<CoreContext>>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    let token = query.token.unwrap_or_default();
    if !token_matches(&token) {
        warn!("client WebSocket rejected: invalid token");
        return (
            axum::http::StatusCode::FORBIDDEN,
            "Invalid or missing token",
        )
            .into_response();
    }

    info!("client WebSocket accepted");
    ws.on_upgrade(move |socket| handle_connection(socket, ctx))
        .into_response()
}

/// Cadence: ~1 Hz while NSE or MCX trades, ~0.5 Hz off-hours.
fn push_period(ctx: &CoreContext) -> Duration {
    let any_open = ctx.clock.is_open(Exchange::Nse) || ctx.clock.is_open(Exchange::Mcx);
    if any_open {
        Duration::from_millis(1_000)
    } else {
        Duration::from_millis(2_000)
    }
}

async fn handle_connection(socket: WebSocket, ctx: Arc<CoreContext>) {
    let (mut sender, mut receiver) = socket.split();

    if send_snapshot(&mut sender, &ctx).await.is_err() {
        info!("client WebSocket closed before first snapshot");
        return;
    }
    let mut last_sent_version = ctx.current_state_version();

    let mut push_interval = interval(push_period(&ctx));

    loop {
        tokio::select! {
            _ = push_interval.tick() => {
                // Re-evaluate cadence as sessions open and close.
                push_interval = interval(push_period(&ctx));
                push_interval.reset();

                let current = ctx.current_state_version();
                if current != last_sent_version {
                    match send_snapshot(&mut sender, &ctx).await {
                        Ok(()) => last_sent_version = current,
                        Err(e) => {
                            debug!(error = %e, "client WebSocket send failed");
                            break;
                        }
                    }
                }
            }
            message = receiver.next() => {
                match message {
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        debug!(msg = %text, "client heartbeat");
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("client WebSocket closed");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "client WebSocket receive error");
                        break;
                    }
                }
            }
        }
    }
}

async fn send_snapshot<S>(sender: &mut S, ctx: &Arc<CoreContext>) -> Result<(), axum::Error>
where
    S: futures_util::Sink<Message, Error = axum::Error> + Unpin,
{
    let snapshot = ctx.build_snapshot();
    match serde_json::to_string(&snapshot) {
        Ok(json) => {
            sender.send(Message::Text(json)).await?;
            debug!(version = snapshot.state_version, "snapshot pushed");
            Ok(())
        }
        Err(e) => {
            warn!(error = %e, "failed to serialise snapshot");
            // Serialisation trouble is not a transport error.
            Ok(())
        }
    }
}
