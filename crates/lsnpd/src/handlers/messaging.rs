//! Direct messages, posts, and likes.
//!
//! CHAT rides the reliable lane; the sender's conversation entry follows
//! the delivery future from `pending` to `acked` or `failed`. POST and
//! LIKE are best-effort broadcasts — loss is repaired socially, not by the
//! protocol.

use std::collections::HashSet;
use std::sync::Arc;

use lsnp_core::token::{now_epoch, Scope};
use lsnp_core::wire::{Frame, FrameType};
use lsnp_core::UserId;
use lsnp_services::events::UiEvent;
use lsnp_services::messaging::{DeliveryState, Post};

use crate::engine::EngineCtx;
use crate::handlers::new_id;
use crate::transport::Delivery;

// ── Outbound ──────────────────────────────────────────────────────────────────

pub async fn send_chat(ctx: &Arc<EngineCtx>, peer: UserId, text: String) {
    let message_id = new_id();
    let timestamp = now_epoch();
    let frame = Frame::new(FrameType::Chat)
        .with("MESSAGE_ID", &message_id)
        .with("FROM", ctx.me())
        .with("TO", &peer)
        .with("TIMESTAMP", timestamp)
        .with("TOKEN", ctx.mint_token(Scope::Chat))
        .with_body(text.clone().into_bytes().into());

    ctx.store.record_outbound(&peer, &message_id, timestamp, &text);

    let dest = ctx.peer_addr(&peer);
    let delivery = ctx.transport.send_reliable(&frame, dest);

    let ctx = ctx.clone();
    tokio::spawn(async move {
        let state = match delivery.await {
            Ok(Delivery::Acked) => DeliveryState::Acked,
            _ => DeliveryState::Failed,
        };
        ctx.store.set_delivery(&peer, &message_id, state);
        ctx.emit(UiEvent::DmDeliveryChanged {
            peer,
            message_id,
            state,
        });
    });
}

pub async fn send_post(ctx: &Arc<EngineCtx>, text: String) {
    let post_id = new_id();
    let timestamp = now_epoch();
    let frame = Frame::new(FrameType::Post)
        .with("POST_ID", &post_id)
        .with("FROM", ctx.me())
        .with("TIMESTAMP", timestamp)
        .with("MESSAGE_ID", &post_id)
        .with("TOKEN", ctx.mint_token(Scope::Broadcast))
        .with_body(text.clone().into_bytes().into());

    // Our own feed sees the post immediately.
    ctx.store.add_post(Post {
        post_id,
        author: ctx.me(),
        timestamp,
        text,
        likes: HashSet::new(),
    });

    ctx.transport.send_broadcast(&frame).await;
}

pub async fn send_like(ctx: &Arc<EngineCtx>, post_id: String, liked: bool) {
    let me = ctx.me();
    ctx.store.apply_like(&post_id, &me, liked);

    let frame = Frame::new(FrameType::Like)
        .with("POST_ID", &post_id)
        .with("FROM", &me)
        .with("ACTION", if liked { "LIKE" } else { "UNLIKE" })
        .with("MESSAGE_ID", new_id())
        .with("TOKEN", ctx.mint_token(Scope::Broadcast));
    ctx.transport.send_broadcast(&frame).await;
}

// ── Inbound ───────────────────────────────────────────────────────────────────

pub fn handle_chat(ctx: &EngineCtx, frame: &Frame, sender: &UserId) {
    let message_id = frame.message_id().unwrap_or_default().to_string();
    let timestamp = frame
        .get("TIMESTAMP")
        .and_then(|t| t.parse().ok())
        .unwrap_or_else(now_epoch);
    let text = frame.body_text().unwrap_or_default();

    ctx.store.record_inbound(sender, &message_id, timestamp, &text);
    ctx.emit(UiEvent::DmReceived {
        from: sender.clone(),
        message_id,
        text,
    });
}

pub fn handle_post(ctx: &EngineCtx, frame: &Frame, sender: &UserId) {
    let post_id = frame.get("POST_ID").unwrap_or_default().to_string();
    let timestamp = frame
        .get("TIMESTAMP")
        .and_then(|t| t.parse().ok())
        .unwrap_or_else(now_epoch);
    let text = frame.body_text().unwrap_or_default();

    let post = Post {
        post_id,
        author: sender.clone(),
        timestamp,
        text,
        likes: HashSet::new(),
    };
    // The fingerprint gate already dropped wire duplicates; this second
    // check keys the timeline by post id across retransmitted POST frames
    // with fresh MESSAGE_IDs.
    if ctx.store.add_post(post.clone()) {
        ctx.emit(UiEvent::PostReceived { post });
    }
}

pub fn handle_like(ctx: &EngineCtx, frame: &Frame, sender: &UserId) {
    let post_id = frame.get("POST_ID").unwrap_or_default();
    let liked = frame.get("ACTION").map(|a| a != "UNLIKE").unwrap_or(true);

    if ctx.store.apply_like(post_id, sender, liked) {
        ctx.emit(UiEvent::LikeReceived {
            post_id: post_id.to_string(),
            from: sender.clone(),
            liked,
        });
    } else {
        ctx.verbose(format!("like for unknown post {post_id}"));
    }
}
