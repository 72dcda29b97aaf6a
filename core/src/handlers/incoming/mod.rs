//! Incoming peer handlers
//!
//! Transport events arrive on one channel and are routed by message type:
//! - `resource`: existence and invalidation announcements
//! - `chunk`: chunk requests, chunk responses and replication jobs

mod chunk;
mod resource;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, trace};

use crate::network::{PeerId, PeerMessage, TransportEvent};
use crate::protocol::DistributionTask;

impl DistributionTask {
    /// Run the incoming event handler
    ///
    /// Drains transport events until the channel closes or the task stops.
    /// Chunk requests are answered on their own task so a slow store read
    /// never delays chunk responses other fetches are waiting for.
    pub(crate) async fn run_incoming_handler(
        self: Arc<Self>,
        mut events: mpsc::Receiver<TransportEvent>,
        running: Arc<RwLock<bool>>,
    ) {
        loop {
            if !*running.read().await {
                break;
            }

            let event = tokio::select! {
                event = events.recv() => event,
                _ = tokio::time::sleep(Duration::from_millis(100)) => continue,
            };

            let Some(event) = event else {
                // transport shut down
                break;
            };

            match event {
                TransportEvent::Connected(peer) => {
                    self.on_peer_connect(peer).await;
                }
                TransportEvent::Disconnected(peer) => {
                    self.on_peer_disconnect(&peer).await;
                }
                TransportEvent::Message {
                    from,
                    message: message @ PeerMessage::ChunkRequest(_),
                } => {
                    let task = Arc::clone(&self);
                    tokio::spawn(async move {
                        task.handle_message(&from, message).await;
                    });
                }
                TransportEvent::Message { from, message } => {
                    self.handle_message(&from, message).await;
                }
            }
        }

        info!("incoming handler stopped");
    }

    /// Apply one message from a peer
    pub async fn handle_message(&self, from: &PeerId, message: PeerMessage) {
        trace!(peer = %from, kind = ?message.message_type(), "peer message");

        match message {
            PeerMessage::Hello(hello) => {
                debug!(peer = %from, announced = %hello.peer_id, "late hello ignored");
            }
            PeerMessage::ResourceExists(exists) => {
                self.handle_resource_exists(from, exists).await;
            }
            PeerMessage::ResourceInvalidated(invalidated) => {
                self.handle_resource_invalidated(from, invalidated).await;
            }
            PeerMessage::ChunkRequest(request) => {
                self.handle_chunk_request(from, request).await;
            }
            PeerMessage::ChunkResponse(response) => {
                self.handle_chunk_response(from, response).await;
            }
            PeerMessage::JobPayload(payload) => {
                self.handle_job_payload(from, payload).await;
            }
        }
    }
}
