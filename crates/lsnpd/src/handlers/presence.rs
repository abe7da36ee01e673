//! PROFILE / PING / REVOKE handling.

use std::net::SocketAddr;

use lsnp_core::token::Scope;
use lsnp_core::wire::{Frame, FrameType};
use lsnp_core::UserId;
use lsnp_services::events::UiEvent;

use crate::engine::EngineCtx;

pub fn handle_profile(ctx: &EngineCtx, frame: &Frame, sender: &UserId) {
    let display_name = frame.get("DISPLAY_NAME").unwrap_or(sender.name());
    let status = frame.get("STATUS").unwrap_or("");
    let avatar = frame.get("AVATAR");

    if ctx
        .registry
        .apply_profile(sender, display_name, status, avatar)
    {
        ctx.emit(UiEvent::PeerUpdated {
            user_id: sender.clone(),
            display_name: display_name.to_string(),
            status: status.to_string(),
        });
    }
}

/// A PING gets a unicast PONG straight back to the source address.
pub async fn handle_ping(ctx: &EngineCtx, sender: &UserId, addr: SocketAddr) {
    let pong = Frame::new(FrameType::Pong)
        .with("USER_ID", ctx.me())
        .with("TO", sender)
        .with("TOKEN", ctx.mint_token(Scope::Presence));
    ctx.transport.send_unicast(&pong, addr).await;
}

/// REVOKE: the peer is leaving. Mark it inactive now and stop honoring its
/// tokens — a replay of its captured traffic must die at the token gate.
pub fn handle_revoke(ctx: &EngineCtx, sender: &UserId) {
    ctx.revoked.revoke(sender.clone());
    if ctx.registry.mark_inactive(sender) {
        tracing::info!(peer = %sender, "peer revoked");
        ctx.emit(UiEvent::PeerInactive {
            user_id: sender.clone(),
        });
    }
}
