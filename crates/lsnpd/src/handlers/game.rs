//! Tic-Tac-Toe over the wire — invite, move, result, resign, resync.
//!
//! All validation is local (`lsnp_services::game`); this module only maps
//! frames to state transitions and back. A remote MOVE that fails
//! validation is answered with a RESYNC carrying our snapshot; whichever
//! side holds the shorter history adopts the longer one.

use std::sync::Arc;

use lsnp_core::token::Scope;
use lsnp_core::wire::{Frame, FrameType};
use lsnp_core::UserId;
use lsnp_services::events::UiEvent;
use lsnp_services::game::{decode_board, Game, GameOutcome, MoveOutcome, Symbol};

use crate::engine::EngineCtx;
use crate::handlers::new_id;
use crate::transport::Delivery;

// ── Outbound ──────────────────────────────────────────────────────────────────

pub async fn invite_game(ctx: &Arc<EngineCtx>, peer: UserId, symbol: Option<Symbol>) {
    let symbol = symbol.unwrap_or(Symbol::X);
    let game_id = new_id();
    ctx.games
        .insert(Game::new(game_id.clone(), peer.clone(), symbol));

    let frame = Frame::new(FrameType::GameInvite)
        .with("MESSAGE_ID", new_id())
        .with("GAME_ID", &game_id)
        .with("FROM", ctx.me())
        .with("TO", &peer)
        .with("SYMBOL", symbol)
        .with("TOKEN", ctx.mint_token(Scope::Game));
    let delivery = ctx.transport.send_reliable(&frame, ctx.peer_addr(&peer));

    let ctx = ctx.clone();
    tokio::spawn(async move {
        if !matches!(delivery.await, Ok(Delivery::Acked)) {
            ctx.games.remove(&game_id);
            tracing::debug!(game_id, "invite undeliverable");
            ctx.emit(UiEvent::GameEnded {
                game_id,
                outcome: GameOutcome::Cancelled,
            });
        }
    });
}

pub async fn respond_invite(ctx: &Arc<EngineCtx>, game_id: String, accept: bool) {
    let Some((opponent, symbol)) = ctx
        .games
        .with_game(&game_id, |game| (game.opponent.clone(), game.symbol))
    else {
        ctx.verbose(format!("no invite for game {game_id}"));
        return;
    };

    let frame = Frame::new(FrameType::GameInviteAck)
        .with("MESSAGE_ID", new_id())
        .with("GAME_ID", &game_id)
        .with("FROM", ctx.me())
        .with("TO", &opponent)
        .with("ACCEPT", accept)
        .with("TOKEN", ctx.mint_token(Scope::Game));
    let _ = ctx.transport.send_reliable(&frame, ctx.peer_addr(&opponent));

    if accept {
        ctx.games.with_game(&game_id, |game| game.activate());
        ctx.emit(UiEvent::GameStarted {
            game_id,
            opponent,
            symbol,
        });
    } else {
        ctx.games.remove(&game_id);
        ctx.emit(UiEvent::GameEnded {
            game_id,
            outcome: GameOutcome::Cancelled,
        });
    }
}

pub async fn submit_move(ctx: &Arc<EngineCtx>, game_id: String, position: u32) {
    let result = ctx.games.with_game(&game_id, |game| {
        let move_no = game.move_no + 1;
        let symbol = game.symbol;
        game.apply_move(move_no, position, symbol)
            .map(|outcome| (move_no, symbol, game.opponent.clone(), outcome))
    });

    match result {
        None => ctx.verbose(format!("no such game {game_id}")),
        Some(Err(e)) => {
            ctx.emit(UiEvent::GameMoveRejected {
                game_id,
                reason: e.to_string(),
            });
        }
        Some(Ok((move_no, symbol, opponent, outcome))) => {
            let frame = Frame::new(FrameType::GameMove)
                .with("MESSAGE_ID", new_id())
                .with("GAME_ID", &game_id)
                .with("MOVE_NO", move_no)
                .with("POSITION", position)
                .with("PLAYER", symbol)
                .with("FROM", ctx.me())
                .with("TO", &opponent)
                .with("TOKEN", ctx.mint_token(Scope::Game));
            let _ = ctx.transport.send_reliable(&frame, ctx.peer_addr(&opponent));

            announce_move(ctx, &game_id, position, symbol);
            conclude_if_over(ctx, &game_id, &opponent, outcome).await;
        }
    }
}

pub async fn resign_game(ctx: &Arc<EngineCtx>, game_id: String) {
    let Some(opponent) = ctx.games.with_game(&game_id, |game| {
        game.resign(true);
        game.opponent.clone()
    }) else {
        ctx.verbose(format!("no such game {game_id}"));
        return;
    };

    let frame = Frame::new(FrameType::GameResign)
        .with("MESSAGE_ID", new_id())
        .with("GAME_ID", &game_id)
        .with("FROM", ctx.me())
        .with("TOKEN", ctx.mint_token(Scope::Game));
    let _ = ctx.transport.send_reliable(&frame, ctx.peer_addr(&opponent));

    ctx.emit(UiEvent::GameEnded {
        game_id,
        outcome: GameOutcome::Lost,
    });
}

// ── Inbound ───────────────────────────────────────────────────────────────────

pub async fn handle_frame(
    ctx: &Arc<EngineCtx>,
    frame_type: FrameType,
    frame: &Frame,
    sender: &UserId,
) {
    match frame_type {
        FrameType::GameInvite => handle_invite(ctx, frame, sender),
        FrameType::GameInviteAck => handle_invite_ack(ctx, frame, sender),
        FrameType::GameMove => handle_move(ctx, frame, sender).await,
        FrameType::GameResync => handle_resync(ctx, frame, sender).await,
        FrameType::GameResign => handle_resign(ctx, frame),
        FrameType::GameResult => {
            // Informational closure; both sides already concluded locally.
            tracing::debug!(
                game_id = frame.get("GAME_ID").unwrap_or_default(),
                result = frame.get("RESULT").unwrap_or_default(),
                "game result received"
            );
        }
        _ => unreachable!("not a game frame"),
    }
}

fn handle_invite(ctx: &EngineCtx, frame: &Frame, sender: &UserId) {
    let game_id = frame.get("GAME_ID").unwrap_or_default().to_string();
    // SYMBOL is the inviter's choice; we play the other one. X by default.
    let inviter_symbol = frame
        .get("SYMBOL")
        .and_then(|s| s.parse().ok())
        .unwrap_or(Symbol::X);
    let our_symbol = inviter_symbol.opposite();

    ctx.games
        .insert(Game::new(game_id.clone(), sender.clone(), our_symbol));
    tracing::info!(game_id, from = %sender, symbol = %our_symbol, "game invite received");
    ctx.emit(UiEvent::GameInvited {
        game_id,
        from: sender.clone(),
        symbol: our_symbol,
    });
}

fn handle_invite_ack(ctx: &EngineCtx, frame: &Frame, sender: &UserId) {
    let game_id = frame.get("GAME_ID").unwrap_or_default().to_string();
    let accepted = frame.get("ACCEPT").map(|v| v == "true").unwrap_or(false);

    if accepted {
        let started = ctx.games.with_game(&game_id, |game| {
            game.activate();
            (game.opponent.clone(), game.symbol)
        });
        if let Some((opponent, symbol)) = started {
            ctx.emit(UiEvent::GameStarted {
                game_id,
                opponent,
                symbol,
            });
        }
    } else {
        ctx.games.remove(&game_id);
        tracing::debug!(game_id, from = %sender, "invite declined");
        ctx.emit(UiEvent::GameEnded {
            game_id,
            outcome: GameOutcome::Cancelled,
        });
    }
}

async fn handle_move(ctx: &Arc<EngineCtx>, frame: &Frame, sender: &UserId) {
    let game_id = frame.get("GAME_ID").unwrap_or_default().to_string();
    let (Some(move_no), Some(position), Some(player)) = (
        frame.get("MOVE_NO").and_then(|v| v.parse::<u32>().ok()),
        frame.get("POSITION").and_then(|v| v.parse::<u32>().ok()),
        frame.get("PLAYER").and_then(|v| v.parse::<Symbol>().ok()),
    ) else {
        ctx.verbose(format!("unparseable move for game {game_id}"));
        return;
    };

    let result = ctx
        .games
        .with_game(&game_id, |game| game.apply_move(move_no, position, player));

    match result {
        None => ctx.verbose(format!("move for unknown game {game_id}")),
        Some(Ok(outcome)) => {
            announce_move(ctx, &game_id, position, player);
            conclude_if_over(ctx, &game_id, sender, outcome).await;
        }
        Some(Err(e)) => {
            // Divergence: answer with our snapshot, let the longer history
            // win on the other side.
            ctx.verbose(format!("move rejected for {game_id}: {e}"));
            send_resync(ctx, &game_id, sender).await;
        }
    }
}

async fn handle_resync(ctx: &Arc<EngineCtx>, frame: &Frame, sender: &UserId) {
    let game_id = frame.get("GAME_ID").unwrap_or_default().to_string();
    let (Some(board_str), Some(move_no)) = (
        frame.get("BOARD"),
        frame.get("MOVE_NO").and_then(|v| v.parse::<u32>().ok()),
    ) else {
        ctx.verbose(format!("unparseable resync for game {game_id}"));
        return;
    };
    let board = match decode_board(board_str) {
        Ok(board) => board,
        Err(e) => {
            ctx.verbose(format!("bad resync board for {game_id}: {e}"));
            return;
        }
    };

    let reconciled = ctx
        .games
        .with_game(&game_id, |game| (game.reconcile(board, move_no), game.move_no));

    match reconciled {
        None => ctx.verbose(format!("resync for unknown game {game_id}")),
        Some((true, _)) => {
            tracing::info!(game_id, move_no, "board adopted from peer snapshot");
            ctx.emit(UiEvent::GameResynced {
                game_id,
                board: board_str.to_string(),
            });
        }
        Some((false, ours)) if ours > move_no => {
            // Their snapshot is behind ours; send ours back instead of
            // replaying individual moves.
            send_resync(ctx, &game_id, sender).await;
        }
        Some((false, _)) => {
            tracing::debug!(game_id, "resync with equal history, nothing to do");
        }
    }
}

fn handle_resign(ctx: &EngineCtx, frame: &Frame) {
    let game_id = frame.get("GAME_ID").unwrap_or_default().to_string();
    if ctx
        .games
        .with_game(&game_id, |game| game.resign(false))
        .is_some()
    {
        ctx.emit(UiEvent::GameEnded {
            game_id,
            outcome: GameOutcome::Won,
        });
    }
}

// ── Shared ────────────────────────────────────────────────────────────────────

fn announce_move(ctx: &EngineCtx, game_id: &str, position: u32, player: Symbol) {
    if let Some(board) = ctx
        .games
        .with_game(game_id, |game| game.snapshot().0)
    {
        ctx.emit(UiEvent::GameMoveApplied {
            game_id: game_id.to_string(),
            position,
            player,
            board,
        });
    }
}

/// On a terminal move, tell the UI and exchange the informational RESULT.
async fn conclude_if_over(
    ctx: &Arc<EngineCtx>,
    game_id: &str,
    opponent: &UserId,
    outcome: MoveOutcome,
) {
    let (result_text, ui_outcome) = match outcome {
        MoveOutcome::InProgress => return,
        MoveOutcome::Drawn => ("DRAW".to_string(), GameOutcome::Drawn),
        MoveOutcome::Won(winner) => {
            let ours = ctx
                .games
                .with_game(game_id, |game| game.symbol)
                .unwrap_or(Symbol::X);
            (
                format!("WINNER:{winner}"),
                if winner == ours {
                    GameOutcome::Won
                } else {
                    GameOutcome::Lost
                },
            )
        }
    };

    let frame = Frame::new(FrameType::GameResult)
        .with("MESSAGE_ID", new_id())
        .with("GAME_ID", game_id)
        .with("FROM", ctx.me())
        .with("RESULT", &result_text)
        .with("TOKEN", ctx.mint_token(Scope::Game));
    let _ = ctx.transport.send_reliable(&frame, ctx.peer_addr(opponent));

    tracing::info!(game_id, result = result_text, "game over");
    ctx.emit(UiEvent::GameEnded {
        game_id: game_id.to_string(),
        outcome: ui_outcome,
    });
}

async fn send_resync(ctx: &Arc<EngineCtx>, game_id: &str, peer: &UserId) {
    let Some((board, move_no)) = ctx.games.with_game(game_id, |game| game.snapshot()) else {
        return;
    };
    let frame = Frame::new(FrameType::GameResync)
        .with("MESSAGE_ID", new_id())
        .with("GAME_ID", game_id)
        .with("BOARD", board)
        .with("MOVE_NO", move_no)
        .with("FROM", ctx.me())
        .with("TOKEN", ctx.mint_token(Scope::Game));
    let _ = ctx.transport.send_reliable(&frame, ctx.peer_addr(peer));
}
