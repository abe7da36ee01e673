//! The UI adapter contract — commands in, events out.
//!
//! The engine consumes `Command`s from a channel and emits `UiEvent`s on
//! another; the terminal UI (an external collaborator) holds the other end
//! of each. Nothing here blocks: a command is a request, and every outcome
//! the UI cares about comes back as an event.

use std::path::PathBuf;

use bytes::Bytes;

use lsnp_core::UserId;

use crate::file_transfer::TransferState;
use crate::game::{GameOutcome, Symbol};
use crate::messaging::{DeliveryState, Post};

/// Requests from the UI into the engine.
#[derive(Debug, Clone)]
pub enum Command {
    SendChat {
        peer: UserId,
        text: String,
    },
    Post {
        text: String,
    },
    Like {
        post_id: String,
        liked: bool,
    },
    Follow {
        peer: UserId,
    },
    Unfollow {
        peer: UserId,
    },
    CreateGroup {
        name: String,
        members: Vec<UserId>,
    },
    UpdateGroup {
        group_id: String,
        add: Vec<UserId>,
        remove: Vec<UserId>,
    },
    SendGroupChat {
        group_id: String,
        text: String,
    },
    OfferFile {
        peer: UserId,
        path: PathBuf,
    },
    AcceptFile {
        transfer_id: String,
    },
    RejectFile {
        transfer_id: String,
    },
    CancelFile {
        transfer_id: String,
    },
    InviteGame {
        peer: UserId,
        symbol: Option<Symbol>,
    },
    RespondGameInvite {
        game_id: String,
        accept: bool,
    },
    SubmitMove {
        game_id: String,
        position: u32,
    },
    ResignGame {
        game_id: String,
    },
    UpdateProfile {
        display_name: String,
        status: String,
    },
    Shutdown,
}

/// Notifications from the engine to the UI.
#[derive(Debug, Clone)]
pub enum UiEvent {
    PeerAdded {
        user_id: UserId,
    },
    PeerUpdated {
        user_id: UserId,
        display_name: String,
        status: String,
    },
    PeerInactive {
        user_id: UserId,
    },
    PeerRemoved {
        user_id: UserId,
    },
    DmReceived {
        from: UserId,
        message_id: String,
        text: String,
    },
    DmDeliveryChanged {
        peer: UserId,
        message_id: String,
        state: DeliveryState,
    },
    PostReceived {
        post: Post,
    },
    LikeReceived {
        post_id: String,
        from: UserId,
        liked: bool,
    },
    GroupUpdated {
        group_id: String,
        name: String,
    },
    GroupMessageReceived {
        group_id: String,
        from: UserId,
        text: String,
    },
    GroupDeliveryChanged {
        group_id: String,
        message_id: String,
        state: DeliveryState,
    },
    FileOffered {
        transfer_id: String,
        from: UserId,
        filename: String,
        size: u64,
    },
    FileProgress {
        transfer_id: String,
        done: u32,
        total: u32,
    },
    FileCompleted {
        transfer_id: String,
        filename: String,
        /// Set on the receiving side: where the blob landed.
        path: Option<PathBuf>,
        /// Set on the receiving side when the UI wants the bytes directly.
        blob: Option<Bytes>,
    },
    FileFailed {
        transfer_id: String,
        state: TransferState,
        reason: String,
    },
    GameInvited {
        game_id: String,
        from: UserId,
        symbol: Symbol,
    },
    GameStarted {
        game_id: String,
        opponent: UserId,
        symbol: Symbol,
    },
    GameMoveApplied {
        game_id: String,
        position: u32,
        player: Symbol,
        board: String,
    },
    /// A local move was refused by validation (occupied cell, wrong turn,
    /// bad move number).
    GameMoveRejected {
        game_id: String,
        reason: String,
    },
    /// The board was replaced by the opponent's longer history.
    GameResynced {
        game_id: String,
        board: String,
    },
    GameEnded {
        game_id: String,
        outcome: GameOutcome,
    },
    /// Dropped/duplicate/unauthorized frame details, emitted only when the
    /// engine runs verbose.
    VerboseLog(String),
}
