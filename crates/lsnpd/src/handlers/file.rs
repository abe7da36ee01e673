//! Chunked file transfer — offer/accept, windowed reliable chunks,
//! completion and cancellation.
//!
//! The sender owns one task per outgoing transfer: it waits for the
//! accept, then pumps FILE_DATA chunks with at most `file_window` unacked
//! at a time, each on its own reliable lane under the composite
//! MESSAGE_ID `transfer_id:chunk_index`. Any chunk exhausting its retries
//! fails the whole transfer and the peer is told with FILE_CANCEL.
//! Receiving is driven entirely by the dispatch task: chunks land in the
//! incoming table and the blob is finalized when the last index arrives.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::oneshot;
use tokio::task::JoinSet;

use lsnp_core::token::Scope;
use lsnp_core::wire::{Frame, FrameType};
use lsnp_core::UserId;
use lsnp_services::events::UiEvent;
use lsnp_services::file_transfer::{IncomingTransfer, OutgoingTransfer, TransferState};

use crate::engine::{EngineCtx, FileControl};
use crate::handlers::new_id;
use crate::transport::Delivery;

/// An unanswered offer expires after this long.
const OFFER_TIMEOUT: Duration = Duration::from_secs(30);

// ── Outbound ──────────────────────────────────────────────────────────────────

pub async fn offer_file(ctx: &Arc<EngineCtx>, peer: UserId, path: PathBuf) {
    let transfer_id = new_id();
    let data = match tokio::fs::read(&path).await {
        Ok(data) => Bytes::from(data),
        Err(e) => {
            ctx.emit(UiEvent::FileFailed {
                transfer_id,
                state: TransferState::Failed,
                reason: format!("cannot read {}: {e}", path.display()),
            });
            return;
        }
    };
    let filename = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unknown")
        .to_string();

    let chunk_size = ctx.config.file.chunk_size;
    let transfer = OutgoingTransfer::new(
        transfer_id.clone(),
        peer.clone(),
        filename,
        data,
        chunk_size,
    );

    let offer = Frame::new(FrameType::FileOffer)
        .with("MESSAGE_ID", new_id())
        .with("TRANSFER_ID", &transfer_id)
        .with("FROM", ctx.me())
        .with("TO", &peer)
        .with("FILENAME", &transfer.filename)
        .with("SIZE", transfer.data.len())
        .with("CHUNK_SIZE", chunk_size)
        .with("CHUNK_COUNT", transfer.chunk_count)
        .with("TOKEN", ctx.mint_token(Scope::File));

    let (accept_tx, accept_rx) = oneshot::channel();
    let control = Arc::new(FileControl {
        accept: Mutex::new(Some(accept_tx)),
        cancelled: Arc::new(AtomicBool::new(false)),
    });
    ctx.outgoing_files.insert(transfer_id.clone(), control.clone());

    let dest = ctx.peer_addr(&peer);
    let offer_delivery = ctx.transport.send_reliable(&offer, dest);

    let ctx = ctx.clone();
    tokio::spawn(async move {
        run_outgoing(ctx, transfer, dest, offer_delivery, accept_rx, control).await;
    });
}

async fn run_outgoing(
    ctx: Arc<EngineCtx>,
    mut transfer: OutgoingTransfer,
    dest: SocketAddr,
    offer_delivery: oneshot::Receiver<Delivery>,
    accept_rx: oneshot::Receiver<bool>,
    control: Arc<FileControl>,
) {
    let transfer_id = transfer.transfer_id.clone();

    let finish = |state: TransferState, reason: String| {
        ctx.outgoing_files.remove(&transfer_id);
        tracing::info!(transfer_id, ?state, reason, "outgoing transfer over");
        ctx.emit(UiEvent::FileFailed {
            transfer_id: transfer_id.clone(),
            state,
            reason,
        });
    };

    if !matches!(offer_delivery.await, Ok(Delivery::Acked)) {
        finish(TransferState::Failed, "offer undeliverable".into());
        return;
    }

    match tokio::time::timeout(OFFER_TIMEOUT, accept_rx).await {
        Err(_) => {
            finish(TransferState::Failed, "offer unanswered".into());
            return;
        }
        Ok(Err(_)) => return,
        Ok(Ok(false)) => {
            finish(TransferState::Cancelled, "offer rejected".into());
            return;
        }
        Ok(Ok(true)) => {}
    }

    transfer.state = TransferState::Transferring;
    tracing::info!(
        transfer_id,
        chunks = transfer.chunk_count,
        "offer accepted, sending chunks"
    );

    let window = ctx.config.file.window.max(1);
    let mut next: u32 = 0;
    let mut in_flight: JoinSet<(u32, Delivery)> = JoinSet::new();

    loop {
        if control.cancelled.load(Ordering::Relaxed) {
            send_cancel(&ctx, &transfer_id, dest).await;
            finish(TransferState::Cancelled, "cancelled locally".into());
            return;
        }

        while next < transfer.chunk_count && in_flight.len() < window {
            let chunk = match transfer.chunk(next) {
                Ok(chunk) => chunk,
                Err(e) => {
                    finish(TransferState::Failed, e.to_string());
                    return;
                }
            };
            let frame = Frame::new(FrameType::FileData)
                .with("MESSAGE_ID", format!("{transfer_id}:{next}"))
                .with("TRANSFER_ID", &transfer_id)
                .with("CHUNK_INDEX", next)
                .with("TOKEN", ctx.mint_token(Scope::File))
                .with_body(chunk);
            let delivery = ctx.transport.send_reliable(&frame, dest);
            let index = next;
            in_flight.spawn(async move { (index, delivery.await.unwrap_or(Delivery::Failed)) });
            next += 1;
        }

        match in_flight.join_next().await {
            Some(Ok((index, Delivery::Acked))) => {
                let done = transfer.mark_acked(index);
                ctx.emit(UiEvent::FileProgress {
                    transfer_id: transfer_id.clone(),
                    done: transfer.acked.len() as u32,
                    total: transfer.chunk_count,
                });
                if done {
                    break;
                }
            }
            Some(Ok((index, Delivery::Failed))) => {
                send_cancel(&ctx, &transfer_id, dest).await;
                finish(
                    TransferState::Failed,
                    format!("chunk {index} exhausted retries"),
                );
                return;
            }
            Some(Err(e)) => {
                tracing::warn!(error = %e, "chunk send task panicked");
            }
            None => break,
        }
    }

    transfer.state = TransferState::Completed;
    let complete = Frame::new(FrameType::FileComplete)
        .with("MESSAGE_ID", new_id())
        .with("TRANSFER_ID", &transfer_id)
        .with("TOKEN", ctx.mint_token(Scope::File));
    // Best effort with retries; the receiver already finalized on the last
    // chunk, COMPLETE is closure.
    let _ = ctx.transport.send_reliable(&complete, dest);

    ctx.outgoing_files.remove(&transfer_id);
    tracing::info!(transfer_id, "file transfer completed");
    ctx.emit(UiEvent::FileCompleted {
        transfer_id,
        filename: transfer.filename,
        path: None,
        blob: None,
    });
}

async fn send_cancel(ctx: &EngineCtx, transfer_id: &str, dest: SocketAddr) {
    let frame = Frame::new(FrameType::FileCancel)
        .with("MESSAGE_ID", new_id())
        .with("TRANSFER_ID", transfer_id)
        .with("TOKEN", ctx.mint_token(Scope::File));
    let _ = ctx.transport.send_reliable(&frame, dest);
}

// ── Commands on incoming offers ───────────────────────────────────────────────

pub async fn accept_file(ctx: &Arc<EngineCtx>, transfer_id: String) {
    let Some((peer, _filename)) = ctx.incoming_files.accept(&transfer_id) else {
        ctx.verbose(format!("no pending offer {transfer_id}"));
        return;
    };
    let frame = Frame::new(FrameType::FileAccept)
        .with("MESSAGE_ID", new_id())
        .with("TRANSFER_ID", &transfer_id)
        .with("FROM", ctx.me())
        .with("TO", &peer)
        .with("TOKEN", ctx.mint_token(Scope::File));
    let _ = ctx.transport.send_reliable(&frame, ctx.peer_addr(&peer));
}

pub async fn reject_file(ctx: &Arc<EngineCtx>, transfer_id: String) {
    let Some(peer) = ctx.incoming_files.reject(&transfer_id) else {
        ctx.verbose(format!("no pending offer {transfer_id}"));
        return;
    };
    let frame = Frame::new(FrameType::FileReject)
        .with("MESSAGE_ID", new_id())
        .with("TRANSFER_ID", &transfer_id)
        .with("FROM", ctx.me())
        .with("TO", &peer)
        .with("TOKEN", ctx.mint_token(Scope::File));
    let _ = ctx.transport.send_reliable(&frame, ctx.peer_addr(&peer));
}

pub async fn cancel_file(ctx: &Arc<EngineCtx>, transfer_id: String) {
    // Outgoing: flag it, the pump task notifies the peer.
    if let Some(control) = ctx.outgoing_files.get(&transfer_id) {
        control.cancelled.store(true, Ordering::Relaxed);
        return;
    }
    // Incoming: drop the session and tell the sender.
    if let Some(transfer) = ctx.incoming_files.cancel(&transfer_id) {
        send_cancel(ctx, &transfer_id, ctx.peer_addr(&transfer.peer)).await;
        ctx.emit(UiEvent::FileFailed {
            transfer_id,
            state: TransferState::Cancelled,
            reason: "cancelled locally".into(),
        });
    }
}

// ── Inbound ───────────────────────────────────────────────────────────────────

pub async fn handle_frame(
    ctx: &Arc<EngineCtx>,
    frame_type: FrameType,
    frame: &Frame,
    sender: &UserId,
) {
    match frame_type {
        FrameType::FileOffer => handle_offer(ctx, frame, sender),
        FrameType::FileAccept => resolve_accept(ctx, frame, true),
        FrameType::FileReject => resolve_accept(ctx, frame, false),
        FrameType::FileData => handle_data(ctx, frame).await,
        FrameType::FileComplete => {
            tracing::debug!(
                transfer_id = frame.get("TRANSFER_ID").unwrap_or_default(),
                "transfer complete (sender closure)"
            );
        }
        FrameType::FileCancel => handle_cancel(ctx, frame),
        _ => unreachable!("not a file frame"),
    }
}

fn handle_offer(ctx: &EngineCtx, frame: &Frame, sender: &UserId) {
    let transfer_id = frame.get("TRANSFER_ID").unwrap_or_default().to_string();
    let filename = frame.get("FILENAME").unwrap_or("unknown").to_string();
    let size: u64 = frame.get("SIZE").and_then(|v| v.parse().ok()).unwrap_or(0);
    let chunk_size: usize = frame
        .get("CHUNK_SIZE")
        .and_then(|v| v.parse().ok())
        .unwrap_or(lsnp_core::wire::DEFAULT_CHUNK_SIZE);
    let chunk_count: u32 = frame
        .get("CHUNK_COUNT")
        .and_then(|v| v.parse().ok())
        .unwrap_or(1);

    ctx.incoming_files.insert(IncomingTransfer::from_offer(
        transfer_id.clone(),
        sender.clone(),
        filename.clone(),
        size,
        chunk_size,
        chunk_count,
    ));
    tracing::info!(transfer_id, filename, size, from = %sender, "file offered");
    ctx.emit(UiEvent::FileOffered {
        transfer_id,
        from: sender.clone(),
        filename,
        size,
    });
}

/// ACCEPT/REJECT land on the sender: wake the waiting transfer task.
fn resolve_accept(ctx: &EngineCtx, frame: &Frame, accepted: bool) {
    let transfer_id = frame.get("TRANSFER_ID").unwrap_or_default();
    let Some(control) = ctx.outgoing_files.get(transfer_id) else {
        ctx.verbose(format!("accept/reject for unknown transfer {transfer_id}"));
        return;
    };
    let taken = control.accept.lock().expect("accept lock poisoned").take();
    if let Some(tx) = taken {
        let _ = tx.send(accepted);
    }
}

async fn handle_data(ctx: &Arc<EngineCtx>, frame: &Frame) {
    let transfer_id = frame.get("TRANSFER_ID").unwrap_or_default().to_string();
    let Some(index) = frame.get("CHUNK_INDEX").and_then(|v| v.parse::<u32>().ok()) else {
        ctx.verbose(format!("chunk with bad index for {transfer_id}"));
        return;
    };
    let body = frame.body().cloned().unwrap_or_default();

    match ctx.incoming_files.insert_chunk(&transfer_id, index, body) {
        Ok(None) => {
            if let Some((done, total)) = ctx.incoming_files.progress(&transfer_id) {
                ctx.emit(UiEvent::FileProgress {
                    transfer_id,
                    done,
                    total,
                });
            }
        }
        Ok(Some((transfer, blob))) => {
            finalize_incoming(ctx, transfer, blob).await;
        }
        Err(e) => {
            ctx.verbose(format!("chunk {index} for {transfer_id} refused: {e}"));
        }
    }
}

/// Write the assembled blob into the download directory and tell the UI.
async fn finalize_incoming(ctx: &Arc<EngineCtx>, transfer: IncomingTransfer, blob: Bytes) {
    let dir = ctx.config.file.download_dir.clone();
    // Strip any path the sender smuggled into the filename.
    let safe_name = Path::new(&transfer.filename)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unnamed")
        .to_string();

    let path = dir.join(&safe_name);
    let written = async {
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(&path, &blob).await
    }
    .await;

    match written {
        Ok(()) => {
            tracing::info!(
                transfer_id = transfer.transfer_id,
                path = %path.display(),
                bytes = blob.len(),
                "file received"
            );
            ctx.emit(UiEvent::FileCompleted {
                transfer_id: transfer.transfer_id,
                filename: safe_name,
                path: Some(path),
                blob: Some(blob),
            });
        }
        Err(e) => {
            tracing::warn!(error = %e, "failed to write received file");
            ctx.emit(UiEvent::FileFailed {
                transfer_id: transfer.transfer_id,
                state: TransferState::Failed,
                reason: format!("write failed: {e}"),
            });
        }
    }
}

fn handle_cancel(ctx: &EngineCtx, frame: &Frame) {
    let transfer_id = frame.get("TRANSFER_ID").unwrap_or_default().to_string();

    // Receiving side of an incoming transfer.
    if let Some(transfer) = ctx.incoming_files.cancel(&transfer_id) {
        tracing::info!(transfer_id, from = %transfer.peer, "transfer cancelled by peer");
        ctx.emit(UiEvent::FileFailed {
            transfer_id,
            state: TransferState::Cancelled,
            reason: "cancelled by peer".into(),
        });
        return;
    }

    // Sending side: stop the pump; a pre-accept cancel reads as a reject.
    if let Some(control) = ctx.outgoing_files.get(&transfer_id) {
        control.cancelled.store(true, Ordering::Relaxed);
        if let Some(tx) = control.accept.lock().expect("accept lock poisoned").take() {
            let _ = tx.send(false);
        }
    }
}
