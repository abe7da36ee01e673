//! The receive pump — decode, gate, dispatch.
//!
//! One task owns the inbound side of the socket. Every datagram runs the
//! same gauntlet: codec → ACK/REVOKE fast paths → ACK emission → dedupe →
//! token scope check → registry touch → typed handler. Any failure drops
//! the frame (verbose-logged) and the pump keeps running; nothing received
//! off the wire can kill it.
//!
//! The ACK for an ack-required frame is emitted before the dedupe gate: a
//! retransmission whose original ACK was lost must still discharge the
//! sender's retry lane, while the handler behind the gate still runs at
//! most once per fingerprint.

use std::net::SocketAddr;
use std::sync::Arc;

use lsnp_core::token::{now_epoch, Token, TokenStatus};
use lsnp_core::wire::{Frame, FrameType, WireError, MAX_DATAGRAM};
use lsnp_core::UserId;
use lsnp_services::dedupe::Fingerprint;
use lsnp_services::events::UiEvent;

use crate::engine::EngineCtx;
use crate::handlers;

/// Why an inbound frame was not dispatched. Dropped frames are silent on
/// the wire; under verbose they surface as `verbose_log` events.
#[derive(Debug, thiserror::Error)]
pub enum DropReason {
    #[error("malformed frame: {0}")]
    Malformed(#[from] WireError),

    #[error("no parseable sender identity")]
    NoSender,

    #[error("duplicate fingerprint")]
    Duplicate,

    #[error("unauthorized: token {0:?}")]
    Unauthorized(TokenStatus),

    #[error("unauthorized: malformed token")]
    BadToken,

    #[error("unauthorized: token names {token_user}, frame claims {claimed}")]
    TokenSenderMismatch { token_user: UserId, claimed: UserId },
}

/// Run the inbound pump until the socket dies.
pub async fn pump(ctx: Arc<EngineCtx>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (len, addr) = match ctx.transport.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "recv_from failed");
                continue;
            }
        };

        if let Err(reason) = handle_datagram(&ctx, &buf[..len], addr).await {
            ctx.verbose(format!("dropped frame from {addr}: {reason}"));
        }
    }
}

async fn handle_datagram(
    ctx: &Arc<EngineCtx>,
    datagram: &[u8],
    addr: SocketAddr,
) -> Result<(), DropReason> {
    let frame = Frame::decode(datagram)?;
    let frame_type = frame.frame_type();

    // ACK discharges a retry lane and carries nothing else.
    if frame_type == FrameType::Ack {
        if let Some(id) = frame.message_id() {
            if !ctx.transport.note_ack(id, addr) {
                tracing::trace!(message_id = id, %addr, "ack without a waiting lane");
            }
        }
        return Ok(());
    }

    let sender: UserId = frame
        .sender()
        .and_then(|s| s.parse().ok())
        .ok_or(DropReason::NoSender)?;

    // Our own broadcasts loop back; ignore them silently.
    if sender == ctx.me() {
        return Ok(());
    }

    // REVOKE carries no token: it only ever narrows access.
    if frame_type == FrameType::Revoke {
        handlers::presence::handle_revoke(ctx, &sender);
        return Ok(());
    }

    // ACK duty comes before the dedupe gate (see module docs).
    if frame_type.requires_ack() {
        if let Some(id) = frame.message_id() {
            let ack = Frame::new(FrameType::Ack).with("MESSAGE_ID", id);
            ctx.transport.send_unicast(&ack, addr).await;
        }
    }

    // PING/PONG are idempotent by content and carry no MESSAGE_ID; every
    // other frame is fingerprinted and acted on at most once.
    if !matches!(frame_type, FrameType::Ping | FrameType::Pong) {
        if let Some(id) = frame.message_id() {
            let fp = Fingerprint::new(sender.clone(), id);
            if !ctx.dedupe.observe(fp) {
                return Err(DropReason::Duplicate);
            }
        }
    }

    if let Some(required) = frame_type.scope() {
        let raw = frame.token().ok_or(DropReason::BadToken)?;
        let token: Token = raw.parse().map_err(|_| DropReason::BadToken)?;
        if token.user_id != sender {
            return Err(DropReason::TokenSenderMismatch {
                token_user: token.user_id,
                claimed: sender,
            });
        }
        let status = token.check(required, now_epoch(), &ctx.revoked);
        if status != TokenStatus::Valid {
            return Err(DropReason::Unauthorized(status));
        }
    }

    // Any authentic frame proves liveness. Unknown unicast targets are
    // accepted — this is where the registry learns them.
    if ctx.registry.observe(&sender, addr) {
        ctx.emit(UiEvent::PeerAdded {
            user_id: sender.clone(),
        });
    }

    match frame_type {
        FrameType::Profile => handlers::presence::handle_profile(ctx, &frame, &sender),
        FrameType::Ping => handlers::presence::handle_ping(ctx, &sender, addr).await,
        // The registry touch above is all a PONG is for.
        FrameType::Pong => {}
        FrameType::Chat => handlers::messaging::handle_chat(ctx, &frame, &sender),
        FrameType::Post => handlers::messaging::handle_post(ctx, &frame, &sender),
        FrameType::Like => handlers::messaging::handle_like(ctx, &frame, &sender),
        FrameType::GroupUpdate => handlers::group::handle_group_update(ctx, &frame, &sender),
        FrameType::GroupChat => handlers::group::handle_group_chat(ctx, &frame, &sender),
        FrameType::FileOffer
        | FrameType::FileAccept
        | FrameType::FileReject
        | FrameType::FileData
        | FrameType::FileComplete
        | FrameType::FileCancel => {
            handlers::file::handle_frame(ctx, frame_type, &frame, &sender).await;
        }
        FrameType::GameInvite
        | FrameType::GameInviteAck
        | FrameType::GameMove
        | FrameType::GameResult
        | FrameType::GameResign
        | FrameType::GameResync => {
            handlers::game::handle_frame(ctx, frame_type, &frame, &sender).await;
        }
        FrameType::Ack | FrameType::Revoke => unreachable!("handled above"),
    }

    Ok(())
}
