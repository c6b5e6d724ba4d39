//! Live event endpoints. Every connection registers one sink on the
//! broadcast registry and drops it when the client goes away.

use std::{convert::Infallible, time::Duration};

use axum::{
    Router,
    extract::{
        Path, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::{
        Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::get,
};
use deployment::Deployment;
use futures::{SinkExt, Stream, StreamExt};
use workflow::relay::{MONITORING_CHANNEL, RelayMessage, Subscription, workflow_channel};

use crate::{DeploymentImpl, error::ApiError};

fn sse_event(message: &RelayMessage, with_channel: bool) -> Event {
    let data = if with_channel {
        serde_json::to_string(message)
    } else {
        serde_json::to_string(&message.event)
    };
    match data {
        Ok(data) => Event::default().event(message.event.name()).data(data),
        Err(e) => {
            tracing::error!("[RELAY] Failed to serialize {}: {}", message.event.name(), e);
            Event::default().comment("error")
        }
    }
}

fn sse_for(
    subscription: Subscription,
    with_channel: bool,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = subscription
        .into_stream()
        .map(move |message| Ok(sse_event(&message, with_channel)));

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keepalive"),
    )
}

async fn subscribe(deployment: &DeploymentImpl, channel: &str) -> Subscription {
    let buffer = deployment.config().read().await.sink_buffer;
    deployment.broadcasts().subscribe(channel, buffer)
}

/// Workflows started with a stream key publish there instead of
/// `workflow-{id}`; ids that do not exist yet use the default channel.
async fn channel_for_workflow(
    deployment: &DeploymentImpl,
    workflow_id: &str,
) -> Result<String, ApiError> {
    Ok(match deployment.store().get_workflow(workflow_id).await? {
        Some(workflow) => workflow.channel_key(),
        None => workflow_channel(workflow_id),
    })
}

fn check_stream_key(key: &str) -> Result<(), ApiError> {
    if key.trim().is_empty() || key == MONITORING_CHANNEL {
        return Err(ApiError::BadRequest(format!("invalid stream key: {key}")));
    }
    Ok(())
}

pub async fn workflow_events(
    State(deployment): State<DeploymentImpl>,
    Path(workflow_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let channel = channel_for_workflow(&deployment, &workflow_id).await?;
    Ok(sse_for(subscribe(&deployment, &channel).await, false))
}

pub async fn stream_events(
    State(deployment): State<DeploymentImpl>,
    Path(key): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    check_stream_key(&key)?;
    Ok(sse_for(subscribe(&deployment, &key).await, false))
}

/// Every event on every channel, tagged with the channel it was routed to.
pub async fn monitoring_events(
    State(deployment): State<DeploymentImpl>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    sse_for(subscribe(&deployment, MONITORING_CHANNEL).await, true)
}

pub async fn workflow_ws(
    ws: WebSocketUpgrade,
    State(deployment): State<DeploymentImpl>,
    Path(workflow_id): Path<String>,
) -> Result<Response, ApiError> {
    let channel = channel_for_workflow(&deployment, &workflow_id).await?;
    let subscription = subscribe(&deployment, &channel).await;
    Ok(ws.on_upgrade(move |socket| handle_relay_socket(socket, subscription)))
}

pub async fn stream_ws(
    ws: WebSocketUpgrade,
    State(deployment): State<DeploymentImpl>,
    Path(key): Path<String>,
) -> Result<Response, ApiError> {
    check_stream_key(&key)?;
    let subscription = subscribe(&deployment, &key).await;
    Ok(ws.on_upgrade(move |socket| handle_relay_socket(socket, subscription)))
}

/// Push relayed messages to the socket until either side closes. Inbound
/// frames other than close are ignored.
async fn handle_relay_socket(socket: WebSocket, mut subscription: Subscription) {
    let (mut sender, mut receiver) = socket.split();
    let channel = subscription.channel().to_string();
    tracing::debug!("[RELAY] WebSocket subscribed to {}", channel);

    loop {
        tokio::select! {
            message = subscription.recv() => {
                let Some(message) = message else { break };
                let text = match serde_json::to_string(&message) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::error!("[RELAY] Failed to serialize relay message: {}", e);
                        continue;
                    }
                };
                if sender.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            inbound = receiver.next() => match inbound {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    tracing::warn!("[RELAY] WebSocket receive error on {}: {}", channel, e);
                    break;
                }
            },
        }
    }

    tracing::debug!("[RELAY] WebSocket on {} closed", channel);
}

pub fn router(_deployment: &DeploymentImpl) -> Router<DeploymentImpl> {
    Router::new()
        .route("/workflows/{workflow_id}/events", get(workflow_events))
        .route("/workflows/{workflow_id}/ws", get(workflow_ws))
        .route("/streams/{key}/events", get(stream_events))
        .route("/streams/{key}/ws", get(stream_ws))
        .route("/monitoring/events", get(monitoring_events))
}
