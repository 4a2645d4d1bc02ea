use std::sync::Arc;

use tandem_core::{decode, Dispatcher, MessageKind, Reaction};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::channel::{ChannelEvent, RoomChannel};

const REACTION_BACKLOG: usize = 64;

/// A reaction produced for one inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub struct ReactionReport {
    pub room_id: String,
    pub channel_id: u64,
    pub reaction: Reaction,
}

/// Drives a [`RoomChannel`]'s events: frames go to the dispatcher and close
/// events go back to the channel's reconnect policy.
///
/// `sync` frames are handed to a single worker so pipelines run one at a
/// time in arrival order, while everything else is handled inline and is
/// never stuck behind a build.
pub struct Session {
    event_loop: JoinHandle<()>,
    worker: JoinHandle<()>,
    reactions: broadcast::Sender<ReactionReport>,
}

impl Session {
    pub fn spawn(
        channel: RoomChannel,
        events: mpsc::UnboundedReceiver<ChannelEvent>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        let (reactions, _) = broadcast::channel(REACTION_BACKLOG);
        let (sync_tx, sync_rx) = mpsc::unbounded_channel();

        let worker = tokio::spawn(run_worker(dispatcher.clone(), sync_rx, reactions.clone()));
        let event_loop = tokio::spawn(run_events(
            channel,
            events,
            dispatcher,
            sync_tx,
            reactions.clone(),
        ));

        Self {
            event_loop,
            worker,
            reactions,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReactionReport> {
        self.reactions.subscribe()
    }

    pub fn shutdown(self) {
        self.event_loop.abort();
        self.worker.abort();
    }
}

struct SyncJob {
    room_id: String,
    channel_id: u64,
    text: String,
}

async fn run_events(
    channel: RoomChannel,
    mut events: mpsc::UnboundedReceiver<ChannelEvent>,
    dispatcher: Arc<Dispatcher>,
    sync_tx: mpsc::UnboundedSender<SyncJob>,
    reactions: broadcast::Sender<ReactionReport>,
) {
    while let Some(event) = events.recv().await {
        match event {
            ChannelEvent::Frame {
                channel_id,
                room_id,
                text,
            } => {
                if channel.current_channel_id() != Some(channel_id) {
                    debug!(
                        target: "tandem::session",
                        room_id = %room_id,
                        channel_id,
                        "dropping frame from retired channel"
                    );
                    continue;
                }
                let is_sync = decode(text.as_bytes())
                    .map(|envelope| envelope.kind == MessageKind::Sync.as_str())
                    .unwrap_or(false);
                if is_sync {
                    trace!(target: "tandem::session", room_id = %room_id, channel_id, "queueing sync");
                    let job = SyncJob {
                        room_id,
                        channel_id,
                        text,
                    };
                    if sync_tx.send(job).is_err() {
                        break;
                    }
                    continue;
                }
                let reaction = dispatcher.dispatch_frame(&room_id, text.as_bytes()).await;
                let _ = reactions.send(ReactionReport {
                    room_id,
                    channel_id,
                    reaction,
                });
            }
            ChannelEvent::Closed { channel_id, .. } => {
                let disposition = channel.handle_closed(channel_id);
                debug!(target: "tandem::session", channel_id, ?disposition, "channel closed");
            }
        }
    }
}

async fn run_worker(
    dispatcher: Arc<Dispatcher>,
    mut jobs: mpsc::UnboundedReceiver<SyncJob>,
    reactions: broadcast::Sender<ReactionReport>,
) {
    while let Some(job) = jobs.recv().await {
        let reaction = dispatcher
            .dispatch_frame(&job.room_id, job.text.as_bytes())
            .await;
        let _ = reactions.send(ReactionReport {
            room_id: job.room_id,
            channel_id: job.channel_id,
            reaction,
        });
    }
}
