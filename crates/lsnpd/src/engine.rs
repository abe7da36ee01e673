//! Engine wiring — shared context, task spawning, and the command loop.
//!
//! `Engine::start` binds the socket, builds the shared context, and spawns
//! the receive pump, the presence loops, and the command loop. The UI holds
//! the command sender and the event receiver; everything else is internal.

use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use lsnp_core::config::LsnpConfig;
use lsnp_core::token::{RevocationSet, Scope, Token};
use lsnp_core::UserId;
use lsnp_services::dedupe::DedupeCache;
use lsnp_services::events::{Command, UiEvent};
use lsnp_services::file_transfer::IncomingTable;
use lsnp_services::game::GameTable;
use lsnp_services::group::GroupTable;
use lsnp_services::messaging::MessagingStore;
use lsnp_services::peer::PeerRegistry;

use crate::transport::{self, Transport};
use crate::{dispatch, handlers, presence};

/// Our own identity and profile fields, mutable via `update_profile`.
#[derive(Debug, Clone)]
pub struct Profile {
    pub user_id: UserId,
    pub display_name: String,
    pub status: String,
}

/// Control surface for one outbound file transfer: the accept/reject
/// waiter and a cancel flag the chunk pump polls between completions.
pub struct FileControl {
    pub accept: Mutex<Option<oneshot::Sender<bool>>>,
    pub cancelled: Arc<AtomicBool>,
}

/// Everything the pump, timers, and handlers share.
pub struct EngineCtx {
    pub config: LsnpConfig,
    pub profile: RwLock<Profile>,
    pub transport: Transport,
    pub registry: PeerRegistry,
    pub dedupe: DedupeCache,
    pub revoked: RevocationSet,
    pub store: MessagingStore,
    pub groups: GroupTable,
    pub incoming_files: IncomingTable,
    pub outgoing_files: DashMap<String, Arc<FileControl>>,
    pub games: GameTable,
    events: mpsc::UnboundedSender<UiEvent>,
}

impl EngineCtx {
    pub fn me(&self) -> UserId {
        self.profile.read().expect("profile lock poisoned").user_id.clone()
    }

    pub fn mint_token(&self, scope: Scope) -> Token {
        Token::mint(self.me(), scope, self.config.token.ttl_secs)
    }

    pub fn emit(&self, event: UiEvent) {
        // A closed receiver just means the UI went away; the engine keeps
        // its protocol obligations either way.
        let _ = self.events.send(event);
    }

    /// Debug-log a dropped frame; surface it to the UI only in verbose mode.
    pub fn verbose(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::debug!("{message}");
        if self.config.verbose {
            self.emit(UiEvent::VerboseLog(message));
        }
    }

    /// Where to unicast for a peer: its last observed source address, or
    /// the identity IP on the well-known port if we have never heard it.
    pub fn peer_addr(&self, peer: &UserId) -> SocketAddr {
        self.registry
            .addr_of(peer)
            .unwrap_or_else(|| SocketAddr::new(peer.ip().into(), self.config.network.port))
    }
}

pub struct Engine {
    ctx: Arc<EngineCtx>,
    commands: mpsc::UnboundedSender<Command>,
    events: Option<mpsc::UnboundedReceiver<UiEvent>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Engine {
    /// Bind the socket and start every engine task. Bind errors are fatal.
    pub async fn start(config: LsnpConfig) -> Result<Self> {
        let transport = Transport::bind(
            config.network.port,
            &config.network.broadcast_addr,
            &config.delivery.retry_schedule_secs,
        )?;

        let ip = transport::local_ipv4();
        let user_id =
            UserId::new(config.identity.name.clone(), ip).context("invalid identity name")?;
        tracing::info!(
            user_id = %user_id,
            addr = %transport.local_addr()?,
            broadcast = %transport.broadcast_addr(),
            "lsnp engine starting"
        );

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let dedupe = DedupeCache::new(
            config.dedupe.cap,
            Duration::from_secs(config.dedupe.ttl_secs),
        );

        let profile = Profile {
            user_id,
            display_name: config.identity.display_name.clone(),
            status: config.identity.status.clone(),
        };

        let ctx = Arc::new(EngineCtx {
            config,
            profile: RwLock::new(profile),
            transport,
            registry: PeerRegistry::new(),
            dedupe,
            revoked: RevocationSet::new(),
            store: MessagingStore::new(),
            groups: GroupTable::new(),
            incoming_files: IncomingTable::new(),
            outgoing_files: DashMap::new(),
            games: GameTable::new(),
            events: event_tx,
        });

        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let tasks = vec![
            tokio::spawn(dispatch::pump(ctx.clone())),
            tokio::spawn(presence::profile_loop(ctx.clone())),
            tokio::spawn(presence::ping_loop(ctx.clone())),
            tokio::spawn(presence::sweep_loop(ctx.clone())),
            tokio::spawn(command_loop(ctx.clone(), command_rx)),
        ];

        Ok(Self {
            ctx,
            commands: command_tx,
            events: Some(event_rx),
            tasks,
        })
    }

    /// Sender half of the UI command channel.
    pub fn commands(&self) -> mpsc::UnboundedSender<Command> {
        self.commands.clone()
    }

    /// Receiver half of the UI event channel. Yields once.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<UiEvent>> {
        self.events.take()
    }

    pub fn ctx(&self) -> &Arc<EngineCtx> {
        &self.ctx
    }

    pub fn user_id(&self) -> UserId {
        self.ctx.me()
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.ctx.transport.local_addr()
    }

    /// Broadcast REVOKE and stop every task.
    pub async fn shutdown(self) {
        presence::broadcast_revoke(&self.ctx).await;
        for task in &self.tasks {
            task.abort();
        }
        tracing::info!("lsnp engine stopped");
    }
}

async fn command_loop(ctx: Arc<EngineCtx>, mut commands: mpsc::UnboundedReceiver<Command>) {
    while let Some(command) = commands.recv().await {
        match command {
            Command::SendChat { peer, text } => {
                handlers::messaging::send_chat(&ctx, peer, text).await;
            }
            Command::Post { text } => handlers::messaging::send_post(&ctx, text).await,
            Command::Like { post_id, liked } => {
                handlers::messaging::send_like(&ctx, post_id, liked).await;
            }
            Command::Follow { peer } => {
                ctx.store.follow(peer);
            }
            Command::Unfollow { peer } => {
                ctx.store.unfollow(&peer);
            }
            Command::CreateGroup { name, members } => {
                handlers::group::create_group(&ctx, name, members).await;
            }
            Command::UpdateGroup {
                group_id,
                add,
                remove,
            } => handlers::group::update_group(&ctx, group_id, add, remove).await,
            Command::SendGroupChat { group_id, text } => {
                handlers::group::send_group_chat(&ctx, group_id, text).await;
            }
            Command::OfferFile { peer, path } => {
                handlers::file::offer_file(&ctx, peer, path).await;
            }
            Command::AcceptFile { transfer_id } => {
                handlers::file::accept_file(&ctx, transfer_id).await;
            }
            Command::RejectFile { transfer_id } => {
                handlers::file::reject_file(&ctx, transfer_id).await;
            }
            Command::CancelFile { transfer_id } => {
                handlers::file::cancel_file(&ctx, transfer_id).await;
            }
            Command::InviteGame { peer, symbol } => {
                handlers::game::invite_game(&ctx, peer, symbol).await;
            }
            Command::RespondGameInvite { game_id, accept } => {
                handlers::game::respond_invite(&ctx, game_id, accept).await;
            }
            Command::SubmitMove { game_id, position } => {
                handlers::game::submit_move(&ctx, game_id, position).await;
            }
            Command::ResignGame { game_id } => {
                handlers::game::resign_game(&ctx, game_id).await;
            }
            Command::UpdateProfile {
                display_name,
                status,
            } => {
                {
                    let mut profile = ctx.profile.write().expect("profile lock poisoned");
                    profile.display_name = display_name;
                    profile.status = status;
                }
                // Announce the change right away instead of waiting a tick.
                presence::send_profile(&ctx).await;
            }
            Command::Shutdown => {
                presence::broadcast_revoke(&ctx).await;
                break;
            }
        }
    }
}
