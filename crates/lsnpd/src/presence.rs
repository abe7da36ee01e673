//! Presence — periodic PROFILE and PING broadcasts, the staleness sweep,
//! and the REVOKE farewell.
//!
//! The first tick of a tokio interval fires immediately, which doubles as
//! the startup burst: a fresh engine announces itself without waiting a
//! full period.

use std::sync::Arc;
use std::time::Duration;

use lsnp_core::token::Scope;
use lsnp_core::wire::{Frame, FrameType};
use lsnp_services::events::UiEvent;
use lsnp_services::game::GameOutcome;

use crate::engine::EngineCtx;

/// Seconds between sweep passes. The thresholds are config; the cadence
/// only bounds detection latency.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// An unanswered game invite is cancelled after this long.
const INVITE_TIMEOUT: Duration = Duration::from_secs(30);

pub async fn profile_loop(ctx: Arc<EngineCtx>) {
    let mut interval =
        tokio::time::interval(Duration::from_secs(ctx.config.presence.profile_interval_secs));
    loop {
        interval.tick().await;
        send_profile(&ctx).await;
    }
}

pub async fn ping_loop(ctx: Arc<EngineCtx>) {
    let mut interval =
        tokio::time::interval(Duration::from_secs(ctx.config.presence.ping_interval_secs));
    loop {
        interval.tick().await;
        send_ping(&ctx).await;
    }
}

pub async fn send_profile(ctx: &EngineCtx) {
    let (user_id, display_name, status) = {
        let profile = ctx.profile.read().expect("profile lock poisoned");
        (
            profile.user_id.clone(),
            profile.display_name.clone(),
            profile.status.clone(),
        )
    };
    let frame = Frame::new(FrameType::Profile)
        .with("USER_ID", &user_id)
        .with("DISPLAY_NAME", &display_name)
        .with("STATUS", &status)
        .with("TOKEN", ctx.mint_token(Scope::Broadcast));
    ctx.transport.send_broadcast(&frame).await;
    tracing::trace!("profile broadcast sent");
}

pub async fn send_ping(ctx: &EngineCtx) {
    let frame = Frame::new(FrameType::Ping)
        .with("USER_ID", ctx.me())
        .with("TOKEN", ctx.mint_token(Scope::Presence));
    ctx.transport.send_broadcast(&frame).await;
}

/// Flag stale peers, evict dead ones, time out invites, abandon games
/// whose opponent has gone quiet.
pub async fn sweep_loop(ctx: Arc<EngineCtx>) {
    let stale = Duration::from_secs(ctx.config.presence.stale_threshold_secs);
    let evict = Duration::from_secs(ctx.config.presence.evict_threshold_secs);
    let abandon_after = stale * 2;

    let mut interval = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        interval.tick().await;

        let outcome = ctx.registry.sweep(stale, evict);
        for user_id in outcome.went_inactive {
            tracing::debug!(peer = %user_id, "peer went inactive");
            ctx.emit(UiEvent::PeerInactive { user_id });
        }
        for user_id in outcome.evicted {
            tracing::info!(peer = %user_id, "peer evicted from registry");
            ctx.emit(UiEvent::PeerRemoved { user_id });
        }

        for game_id in ctx.games.expired_invites(INVITE_TIMEOUT) {
            if ctx
                .games
                .with_game(&game_id, |game| game.cancel())
                .is_some()
            {
                tracing::debug!(game_id, "game invite timed out");
                ctx.emit(UiEvent::GameEnded {
                    game_id,
                    outcome: GameOutcome::Cancelled,
                });
            }
        }

        // A live game against a silent opponent is abandoned, not lost.
        let abandoned: Vec<String> = ctx
            .registry
            .all_peers()
            .into_iter()
            .filter(|peer| {
                ctx.registry
                    .idle_for(&peer.user_id)
                    .is_some_and(|idle| idle > abandon_after)
            })
            .flat_map(|peer| ctx.games.active_against(&peer.user_id))
            .collect();
        for game_id in abandoned {
            ctx.games.with_game(&game_id, |game| game.abandon());
            tracing::info!(game_id, "game abandoned, opponent inactive");
            ctx.emit(UiEvent::GameEnded {
                game_id,
                outcome: GameOutcome::Abandoned,
            });
        }
    }
}

/// Farewell broadcast: receivers mark us inactive and revoke our tokens.
pub async fn broadcast_revoke(ctx: &EngineCtx) {
    let frame = Frame::new(FrameType::Revoke).with("USER_ID", ctx.me());
    ctx.transport.send_broadcast(&frame).await;
    tracing::info!("revoke broadcast sent");
}
