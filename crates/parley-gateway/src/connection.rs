//! Media-stream connection lifecycle: handshake, read/write loops, teardown.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use parley_core::transcript::Role;
use parley_pipeline::{PipelineState, TransportEvent};

use crate::serializer::{InboundEvent, TwilioSerializer};
use crate::state::{GatewayState, SessionHandle};

/// Identifiers from the stream's `start` message.
#[derive(Debug)]
struct StreamStart {
    stream_sid: String,
    call_sid: String,
}

/// Read until Twilio announces the stream. Media before `start` is dropped.
async fn wait_for_start(
    ws_rx: &mut SplitStream<WebSocket>,
    serializer: &mut TwilioSerializer,
) -> Result<StreamStart, String> {
    while let Some(msg) = ws_rx.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => return Err("closed before start".into()),
            Ok(_) => continue,
            Err(e) => return Err(e.to_string()),
        };
        match serializer.decode(text.as_str()) {
            Ok(InboundEvent::Start {
                stream_sid,
                call_sid,
            }) => {
                return Ok(StreamStart {
                    stream_sid,
                    call_sid,
                });
            }
            Ok(InboundEvent::Connected) => debug!("Stream connected, waiting for start"),
            Ok(other) => debug!(?other, "Ignoring message before start"),
            Err(e) => warn!("Malformed message during handshake: {e}"),
        }
    }
    Err("closed before start".into())
}

fn outcome_label(state: PipelineState) -> &'static str {
    match state {
        PipelineState::Created => "created",
        PipelineState::Running => "running",
        PipelineState::Completed => "completed",
        PipelineState::Cancelled => "cancelled",
        PipelineState::Failed => "failed",
    }
}

/// Handle one Twilio media-stream WebSocket for the life of the call.
pub async fn handle_media_stream(state: Arc<GatewayState>, ws: WebSocket) {
    let conn_id = Uuid::new_v4().to_string();
    info!(conn_id = %conn_id, "New media stream connection");

    let (mut ws_tx, mut ws_rx) = ws.split();
    let mut serializer = TwilioSerializer::new();

    let handshake = timeout(
        state.config.handshake_timeout(),
        wait_for_start(&mut ws_rx, &mut serializer),
    )
    .await;
    let start = match handshake {
        Ok(Ok(start)) => start,
        Ok(Err(reason)) => {
            warn!(conn_id = %conn_id, "Handshake failed: {reason}");
            let _ = ws_tx.send(Message::Close(None)).await;
            return;
        }
        Err(_) => {
            warn!(conn_id = %conn_id, "No start message within handshake timeout");
            #[cfg(feature = "metrics")]
            crate::metrics::record_error("handshake_timeout");
            let _ = ws_tx.send(Message::Close(None)).await;
            return;
        }
    };
    let stream_sid = start.stream_sid;
    info!(conn_id = %conn_id, stream_sid = %stream_sid, call_sid = %start.call_sid, "Stream started");

    let mut session = match state.pool.session(stream_sid.clone()).await {
        Ok(session) => session,
        Err(e) => {
            error!(stream_sid = %stream_sid, "Failed to assemble session: {e}");
            #[cfg(feature = "metrics")]
            crate::metrics::record_error("session_setup");
            let _ = ws_tx.send(Message::Close(None)).await;
            return;
        }
    };
    let Some(mut outbound) = session.take_outbound() else {
        error!(stream_sid = %stream_sid, "Session outbound already taken");
        return;
    };
    let transport = session.transport();
    let started_at = Utc::now();

    state
        .register(
            &stream_sid,
            SessionHandle {
                conn_id: conn_id.clone(),
                call_sid: start.call_sid,
                pipeline: Arc::clone(session.pipeline()),
                started_at,
            },
        )
        .await;
    #[cfg(feature = "metrics")]
    crate::metrics::record_session_start();

    let mut runner = session.spawn();
    if transport
        .send(TransportEvent::Connected {
            session_key: stream_sid.clone(),
        })
        .await
        .is_err()
    {
        warn!(stream_sid = %stream_sid, "Pipeline stopped before the call connected");
    }

    // Outbound audio and clear commands go out on their own task
    let writer_serializer = serializer.clone();
    let writer_sid = stream_sid.clone();
    let mut writer = tokio::spawn(async move {
        while let Some(event) = outbound.recv().await {
            match writer_serializer.encode(&event) {
                Ok(text) => {
                    if ws_tx.send(Message::Text(text.into())).await.is_err() {
                        debug!(stream_sid = %writer_sid, "Socket closed while writing");
                        break;
                    }
                }
                Err(e) => warn!(stream_sid = %writer_sid, "Failed to encode outbound event: {e}"),
            }
        }
        let _ = ws_tx.send(Message::Close(None)).await;
    });

    let finished = loop {
        tokio::select! {
            result = &mut runner => break Some(result),
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Text(text))) => match serializer.decode(text.as_str()) {
                    Ok(InboundEvent::Audio(pcm)) => {
                        if pcm.is_empty() {
                            continue;
                        }
                        if transport.send(TransportEvent::Audio(pcm)).await.is_err() {
                            debug!(stream_sid = %stream_sid, "Pipeline no longer accepting audio");
                        }
                    }
                    Ok(InboundEvent::Stop) => {
                        info!(stream_sid = %stream_sid, "Stream stopped by remote");
                        break None;
                    }
                    Ok(InboundEvent::Dtmf(digit)) => debug!(stream_sid = %stream_sid, digit = %digit, "DTMF"),
                    Ok(InboundEvent::Mark(name)) => debug!(stream_sid = %stream_sid, mark = %name, "Mark"),
                    Ok(other) => debug!(stream_sid = %stream_sid, ?other, "Ignoring message"),
                    Err(e) => warn!(stream_sid = %stream_sid, "Malformed stream message: {e}"),
                },
                Some(Ok(Message::Close(_))) | None => {
                    info!(stream_sid = %stream_sid, "Socket closed by remote");
                    break None;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(stream_sid = %stream_sid, "Socket error: {e}");
                    break None;
                }
            }
        }
    };

    // The pipeline queues the session end and recording stop, then cancels itself
    let grace = state.config.teardown_grace();
    let result = match finished {
        Some(result) => result,
        None => {
            let delivered = transport
                .send_timeout(TransportEvent::Disconnected, grace)
                .await
                .is_ok();
            if !delivered {
                warn!(stream_sid = %stream_sid, "Disconnect not delivered, cancelling session");
                session.cancel();
            }
            match timeout(grace, &mut runner).await {
                Ok(result) => result,
                Err(_) => {
                    info!(stream_sid = %stream_sid, "Teardown grace elapsed, cancelling session");
                    session.cancel();
                    (&mut runner).await
                }
            }
        }
    };
    drop(transport);

    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            error!(stream_sid = %stream_sid, "Session failed: {e}");
            #[cfg(feature = "metrics")]
            crate::metrics::record_error("pipeline");
        }
        Err(e) => {
            error!(stream_sid = %stream_sid, "Session task failed: {e}");
            #[cfg(feature = "metrics")]
            crate::metrics::record_error("panic");
        }
    }

    if timeout(grace, &mut writer).await.is_err() {
        writer.abort();
    }

    state.unregister(&stream_sid).await;
    let outcome = outcome_label(session.state());
    let duration = Utc::now() - started_at;
    let transcript = session.transcript();
    info!(
        stream_sid = %stream_sid,
        outcome,
        duration_ms = duration.num_milliseconds(),
        user_turns = transcript.count(Role::User),
        assistant_turns = transcript.count(Role::Assistant),
        interruptions = session.pipeline().interruptions(),
        "Session ended"
    );
    #[cfg(feature = "metrics")]
    crate::metrics::record_session_end(
        outcome,
        duration.num_milliseconds() as f64 / 1000.0,
        session.pipeline().interruptions(),
    );
}
