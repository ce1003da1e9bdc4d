//! Per-connection state machine: `AUTH_WAIT` → `AUTHORIZED` → `CLOSED`.
//!
//! Grounded on `umbra-relay::handler::handle_websocket` — split the socket,
//! spawn a writer task draining an unbounded channel, loop over inbound
//! frames dispatching by kind, clean up the registry entry on exit. The
//! auth-wait deadline reuses the `tokio::select!`-around-a-timer shape the
//! relay uses for its periodic cleanup interval in `main.rs`.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::error::CtProtoError;
use crate::protocol::{self, NewMessage};

use super::reassembler::{ReassemblerEvent, UploadReassembler};
use super::registry::{ClientRegistry, ServerFrame};
use super::{ServerConfig, ServerHooks};

enum AuthOutcome {
    Authorized { envelope: NewMessage },
    Timeout,
    ParseFailure(String),
    WrongFirstMessage,
    Disconnected,
}

/// Drives one WebSocket connection end to end. Returns once the
/// connection is closed, for any reason.
pub async fn run_connection<H: ServerHooks>(
    socket: WebSocket,
    registry: ClientRegistry,
    config: Arc<ServerConfig<H>>,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<ServerFrame>();

    let writer_task = tokio::spawn(async move {
        while let Some(frame) = frame_rx.recv().await {
            match frame {
                ServerFrame::Text(text) => {
                    if ws_tx.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                ServerFrame::Close(code, reason) => {
                    let _ = ws_tx
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    let reassembler = Arc::new(UploadReassembler::new(config.upload_idle_timeout));
    let sweep_handle = spawn_idle_sweep(reassembler.clone(), config.upload_idle_timeout);

    let outcome = wait_for_auth(&mut ws_rx, &frame_tx, config.auth_timeout, &config).await;

    let (client_id, auth_data) = match outcome {
        AuthOutcome::Authorized { envelope } => {
            match config.hooks.on_auth(envelope.payload.clone()).await {
                Ok(auth_data) => {
                    let id = registry.add(auth_data.clone(), frame_tx.clone());
                    let response = protocol::build_response(envelope.message_id, auth_data.clone());
                    send_text(&frame_tx, &response);
                    if !config.disable_logs {
                        tracing::info!(client_id = %id, "connection authorized");
                    }
                    (id, auth_data)
                }
                Err(e) => {
                    close(&frame_tx, 1008, format!("Authorization failed: {e}"));
                    sweep_handle.abort();
                    let _ = writer_task.await;
                    return;
                }
            }
        }
        AuthOutcome::Timeout => {
            close(&frame_tx, 1013, "Authorization required");
            sweep_handle.abort();
            let _ = writer_task.await;
            return;
        }
        AuthOutcome::ParseFailure(msg) => {
            close(&frame_tx, 1003, msg);
            sweep_handle.abort();
            let _ = writer_task.await;
            return;
        }
        AuthOutcome::WrongFirstMessage => {
            close(&frame_tx, 1008, "Unauthorized");
            sweep_handle.abort();
            let _ = writer_task.await;
            return;
        }
        AuthOutcome::Disconnected => {
            sweep_handle.abort();
            let _ = writer_task.await;
            return;
        }
    };

    run_authorized(
        &mut ws_rx,
        &frame_tx,
        &config,
        &auth_data,
        reassembler.as_ref(),
    )
    .await;

    registry.remove(&client_id);
    sweep_handle.abort();
    writer_task.abort();
    if !config.disable_logs {
        tracing::info!(client_id = %client_id, "connection closed");
    }
}

async fn wait_for_auth<H: ServerHooks>(
    ws_rx: &mut (impl StreamExt<Item = Result<Message, axum::Error>> + Unpin),
    frame_tx: &mpsc::UnboundedSender<ServerFrame>,
    auth_timeout: Duration,
    config: &ServerConfig<H>,
) -> AuthOutcome {
    let mut deadline = Some(Box::pin(tokio::time::sleep(auth_timeout)));

    loop {
        let next = ws_rx.next();
        let received = if let Some(timer) = deadline.as_mut() {
            tokio::select! {
                _ = timer.as_mut() => return AuthOutcome::Timeout,
                msg = next => msg,
            }
        } else {
            next.await
        };
        // First inbound frame of any kind cancels the auth-wait deadline.
        deadline = None;

        match received {
            None => return AuthOutcome::Disconnected,
            Some(Err(_)) => return AuthOutcome::Disconnected,
            Some(Ok(Message::Close(_))) => return AuthOutcome::Disconnected,
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
            Some(Ok(Message::Binary(_))) => {
                return AuthOutcome::ParseFailure("Unsupported data".to_string());
            }
            Some(Ok(Message::Text(text))) => match protocol::validate_text(&text) {
                Err(CtProtoError::Parse(msg)) => return AuthOutcome::ParseFailure(msg),
                Err(CtProtoError::Format(msg)) => {
                    let err = protocol::build_error(
                        config.id_gen.as_ref(),
                        format!("Message Format Error: {msg}"),
                    );
                    send_text(frame_tx, &err);
                    continue;
                }
                Err(_) => unreachable!("validator only raises Parse/Format"),
                Ok(envelope) => {
                    if envelope.kind != "authorize" {
                        return AuthOutcome::WrongFirstMessage;
                    }
                    return AuthOutcome::Authorized { envelope };
                }
            },
        }
    }
}

async fn run_authorized<H: ServerHooks>(
    ws_rx: &mut (impl StreamExt<Item = Result<Message, axum::Error>> + Unpin),
    frame_tx: &mpsc::UnboundedSender<ServerFrame>,
    config: &Arc<ServerConfig<H>>,
    auth_data: &serde_json::Value,
    reassembler: &UploadReassembler,
) {
    loop {
        match ws_rx.next().await {
            None | Some(Err(_)) | Some(Ok(Message::Close(_))) => return,
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
            Some(Ok(Message::Text(text))) => match protocol::validate_text(&text) {
                Err(CtProtoError::Parse(msg)) => {
                    close(frame_tx, 1003, msg);
                    return;
                }
                Err(CtProtoError::Format(msg)) => {
                    let err = protocol::build_error(
                        config.id_gen.as_ref(),
                        format!("Message Format Error: {msg}"),
                    );
                    send_text(frame_tx, &err);
                }
                Err(_) => unreachable!("validator only raises Parse/Format"),
                Ok(envelope) => {
                    if envelope.kind == "authorize" {
                        // Duplicate authorize after authorization: silently
                        // ignored.
                        continue;
                    }
                    match config.hooks.on_message(auth_data, &envelope).await {
                        Ok(Some(result)) => {
                            let response = protocol::build_response(envelope.message_id, result);
                            send_text(frame_tx, &response);
                        }
                        Ok(None) => {}
                        Err(e) => {
                            tracing::warn!(error = %e, "onMessage handler failed");
                        }
                    }
                }
            },
            Some(Ok(Message::Binary(bytes))) => match protocol::validate_binary(&bytes) {
                Err(CtProtoError::Parse(msg)) => {
                    close(frame_tx, 1003, msg);
                    return;
                }
                Err(CtProtoError::Format(msg)) => {
                    let err = protocol::build_error(
                        config.id_gen.as_ref(),
                        format!("Message Format Error: {msg}"),
                    );
                    send_text(frame_tx, &err);
                }
                Err(_) => unreachable!("validator only raises Parse/Format"),
                Ok(frame) => match reassembler.handle_chunk(frame) {
                    // The per-chunk ack is unconditional; `complete` rides
                    // alongside it on the chunk that finishes the transfer
                    // rather than replacing it (§4.3 steps 6-7).
                    Ok(outcome) => {
                        if let ReassemblerEvent::ChunkAck {
                            message_id,
                            chunk_number,
                            file_id,
                            kind,
                        } = &outcome.ack
                        {
                            let payload = serde_json::json!({
                                "chunkNumber": chunk_number,
                                "type": kind,
                                "fileId": file_id,
                            });
                            let response = protocol::build_response(message_id.clone(), payload);
                            send_text(frame_tx, &response);
                        }

                        if let Some(ReassemblerEvent::Complete {
                            file_id,
                            kind,
                            payload,
                            file,
                        }) = outcome.complete
                        {
                            match config
                                .hooks
                                .on_upload_message(auth_data, &kind, &payload, file)
                                .await
                            {
                                Ok(Some(result)) => {
                                    let response = protocol::build_response(file_id, result);
                                    send_text(frame_tx, &response);
                                }
                                Ok(None) => {}
                                Err(e) => {
                                    tracing::warn!(error = %e, "onUploadMessage handler failed");
                                }
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "chunk reassembly failed");
                    }
                },
            },
        }
    }
}

fn spawn_idle_sweep(
    reassembler: Arc<UploadReassembler>,
    idle_timeout: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        // Ticking at a fraction of `idle_timeout` keeps a stale slot's actual
        // lifetime close to the per-slot deadline; a slot can still outlive
        // it by up to one tick, never by a full extra `idle_timeout`.
        let tick = (idle_timeout / 4).max(Duration::from_secs(1));
        let mut interval = tokio::time::interval(tick);
        loop {
            interval.tick().await;
            reassembler.sweep_idle();
        }
    })
}

fn send_text<T: serde::Serialize>(frame_tx: &mpsc::UnboundedSender<ServerFrame>, msg: &T) {
    let json = serde_json::to_string(msg).expect("envelope must serialize");
    let _ = frame_tx.send(ServerFrame::Text(json));
}

fn close(frame_tx: &mpsc::UnboundedSender<ServerFrame>, code: u16, reason: impl Into<String>) {
    let _ = frame_tx.send(ServerFrame::Close(code, reason.into()));
}
