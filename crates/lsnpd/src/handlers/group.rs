//! Group membership and group chat.
//!
//! The creator is the only authority on membership: GROUP_UPDATE broadcasts
//! the full member list and mirrors replace theirs last-writer-wins by the
//! creator's timestamp. A group message is one MESSAGE_ID unicast to every
//! member; the sender's delivery state is `acked` on the first member ACK
//! and `failed` only when every lane fails.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::task::JoinSet;

use lsnp_core::token::{now_epoch, Scope};
use lsnp_core::wire::{Frame, FrameType};
use lsnp_core::UserId;
use lsnp_services::events::UiEvent;
use lsnp_services::group::{GroupTable, UpdateOutcome};
use lsnp_services::messaging::DeliveryState;

use crate::engine::EngineCtx;
use crate::handlers::new_id;
use crate::transport::Delivery;

// ── Outbound ──────────────────────────────────────────────────────────────────

pub async fn create_group(ctx: &Arc<EngineCtx>, name: String, members: Vec<UserId>) {
    let me = ctx.me();
    let group_id = GroupTable::make_group_id(&me, &new_id());
    let timestamp = now_epoch();
    let group = ctx.groups.create(
        group_id.clone(),
        name.clone(),
        me,
        members.into_iter().collect(),
        timestamp,
    );
    broadcast_membership(ctx, &group.group_id, &name, &group.members, timestamp).await;
    ctx.emit(UiEvent::GroupUpdated { group_id, name });
}

pub async fn update_group(
    ctx: &Arc<EngineCtx>,
    group_id: String,
    add: Vec<UserId>,
    remove: Vec<UserId>,
) {
    let me = ctx.me();
    let Some(group) = ctx.groups.get(&group_id) else {
        ctx.verbose(format!("update for unknown group {group_id}"));
        return;
    };
    if group.creator != me {
        ctx.verbose(format!("not the creator of {group_id}, update refused"));
        return;
    }

    let mut members = group.members;
    members.extend(add);
    for user in &remove {
        members.remove(user);
    }
    members.insert(me.clone());

    let timestamp = now_epoch();
    ctx.groups
        .apply_update(&group_id, &group.name, &me, members.clone(), timestamp);
    broadcast_membership(ctx, &group_id, &group.name, &members, timestamp).await;
    ctx.emit(UiEvent::GroupUpdated {
        group_id,
        name: group.name,
    });
}

async fn broadcast_membership(
    ctx: &EngineCtx,
    group_id: &str,
    name: &str,
    members: &HashSet<UserId>,
    timestamp: u64,
) {
    let member_list = members
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",");
    let frame = Frame::new(FrameType::GroupUpdate)
        .with("GROUP_ID", group_id)
        .with("CREATOR", ctx.me())
        .with("MEMBERS", member_list)
        .with("NAME", name)
        .with("TIMESTAMP", timestamp)
        .with("MESSAGE_ID", new_id())
        .with("TOKEN", ctx.mint_token(Scope::Broadcast));
    ctx.transport.send_broadcast(&frame).await;
}

pub async fn send_group_chat(ctx: &Arc<EngineCtx>, group_id: String, text: String) {
    let me = ctx.me();
    if !ctx.groups.is_member(&group_id, &me) {
        ctx.verbose(format!("not a member of {group_id}, message refused"));
        return;
    }

    let message_id = new_id();
    let timestamp = now_epoch();
    ctx.groups.record_message(&group_id, me.clone(), timestamp, &text);

    // Snapshot the member set once; each unicast gets its own reliable
    // lane under the shared MESSAGE_ID.
    let recipients = ctx.groups.fanout_members(&group_id, &me);
    if recipients.is_empty() {
        ctx.emit(UiEvent::GroupDeliveryChanged {
            group_id,
            message_id,
            state: DeliveryState::Acked,
        });
        return;
    }

    let mut deliveries = JoinSet::new();
    for member in recipients {
        let frame = Frame::new(FrameType::GroupChat)
            .with("MESSAGE_ID", &message_id)
            .with("GROUP_ID", &group_id)
            .with("FROM", &me)
            .with("TO", &member)
            .with("TIMESTAMP", timestamp)
            .with("TOKEN", ctx.mint_token(Scope::Chat))
            .with_body(text.clone().into_bytes().into());
        let delivery = ctx.transport.send_reliable(&frame, ctx.peer_addr(&member));
        deliveries.spawn(async move { delivery.await.unwrap_or(Delivery::Failed) });
    }

    let ctx = ctx.clone();
    tokio::spawn(async move {
        let mut any_acked = false;
        while let Some(result) = deliveries.join_next().await {
            if matches!(result, Ok(Delivery::Acked)) && !any_acked {
                any_acked = true;
                ctx.emit(UiEvent::GroupDeliveryChanged {
                    group_id: group_id.clone(),
                    message_id: message_id.clone(),
                    state: DeliveryState::Acked,
                });
            }
        }
        if !any_acked {
            ctx.emit(UiEvent::GroupDeliveryChanged {
                group_id,
                message_id,
                state: DeliveryState::Failed,
            });
        }
    });
}

// ── Inbound ───────────────────────────────────────────────────────────────────

pub fn handle_group_update(ctx: &EngineCtx, frame: &Frame, sender: &UserId) {
    let group_id = frame.get("GROUP_ID").unwrap_or_default();
    let name = frame.get("NAME").unwrap_or_default();
    let timestamp = frame
        .get("TIMESTAMP")
        .and_then(|t| t.parse().ok())
        .unwrap_or_else(now_epoch);

    let members: HashSet<UserId> = frame
        .get("MEMBERS")
        .unwrap_or_default()
        .split(',')
        .filter_map(|m| m.trim().parse().ok())
        .collect();

    match ctx
        .groups
        .apply_update(group_id, name, sender, members, timestamp)
    {
        UpdateOutcome::Applied => {
            ctx.emit(UiEvent::GroupUpdated {
                group_id: group_id.to_string(),
                name: name.to_string(),
            });
        }
        UpdateOutcome::Stale => {
            ctx.verbose(format!("stale membership snapshot for {group_id}"));
        }
        UpdateOutcome::CreatorMismatch => {
            ctx.verbose(format!(
                "group update for {group_id} from non-creator {sender}"
            ));
        }
    }
}

pub fn handle_group_chat(ctx: &EngineCtx, frame: &Frame, sender: &UserId) {
    let group_id = frame.get("GROUP_ID").unwrap_or_default().to_string();
    let timestamp = frame
        .get("TIMESTAMP")
        .and_then(|t| t.parse().ok())
        .unwrap_or_else(now_epoch);
    let text = frame.body_text().unwrap_or_default();

    // A message can outrun its GROUP_UPDATE; show it either way, the
    // mirror catches up on the next membership broadcast.
    if !ctx.groups.record_message(&group_id, sender.clone(), timestamp, &text) {
        ctx.verbose(format!("group message for unmirrored group {group_id}"));
    }
    ctx.emit(UiEvent::GroupMessageReceived {
        group_id,
        from: sender.clone(),
        text,
    });
}
