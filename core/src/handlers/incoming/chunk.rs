//! Chunk traffic handler
//!
//! Serves chunk requests from memory or the local store, routes chunk
//! responses to the fetches waiting for them, and applies replication jobs.

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::jobs::DistributionJobReceiver;
use crate::network::{ChunkRequest, ChunkResponse, JobPayload, PeerId, PeerMessage};
use crate::protocol::{ChunkReceivedEvent, DistributionEvent, DistributionTask};
use crate::resource::{uri, ChunkLookup};

impl DistributionTask {
    /// Answer a chunk request
    ///
    /// Only local data is served; a miss is answered with an empty
    /// response so the requester can move on to its next peer.
    pub(crate) async fn handle_chunk_request(&self, from: &PeerId, request: ChunkRequest) {
        let data = match self.get_resource(&request.uri, Some(from.clone())).await {
            Some(resource) => match resource.get_chunk(request.index, ChunkLookup::LOCAL).await {
                Ok(data) => data,
                Err(e) => {
                    debug!(error = %e, uri = %request.uri, index = request.index, "chunk lookup failed");
                    None
                }
            },
            None => {
                let path = uri::normalize(&request.uri);
                match self.store.query(&path, request.index).await {
                    Ok(data) => data,
                    Err(e) => {
                        warn!(error = %e, uri = %path, index = request.index, "chunk store query failed");
                        None
                    }
                }
            }
        };

        trace!(
            peer = %from,
            uri = %request.uri,
            index = request.index,
            found = data.is_some(),
            "answering chunk request"
        );

        let response = PeerMessage::ChunkResponse(ChunkResponse {
            uri: request.uri,
            index: request.index,
            data: data.map(|d| d.to_vec()),
        });
        if let Err(e) = self.transport.send(from, &response).await {
            debug!(error = %e, peer = %from, "failed to send chunk response");
        }
    }

    pub(crate) async fn handle_chunk_response(&self, from: &PeerId, response: ChunkResponse) {
        let waiting = self
            .fetcher
            .complete(&response.uri, response.index, response.data.map(Bytes::from))
            .await;
        if waiting == 0 {
            trace!(peer = %from, uri = %response.uri, index = response.index, "unsolicited chunk response");
        }
    }

    /// Store a chunk a peer replicated to us
    pub(crate) async fn handle_job_payload(&self, from: &PeerId, payload: JobPayload) {
        let receiver = DistributionJobReceiver::new(self.store.clone(), self.ctx.clock.clone());
        match receiver.apply(&payload).await {
            Ok(received) => {
                debug!(
                    peer = %from,
                    uri = %received.uri,
                    index = received.index,
                    len = received.len,
                    "replicated chunk stored"
                );
                self.emit(DistributionEvent::ChunkReceived(ChunkReceivedEvent {
                    uri: received.uri,
                    index: received.index,
                    from: from.clone(),
                }))
                .await;
            }
            Err(e) => {
                warn!(error = %e, peer = %from, kind = %payload.kind, "failed to apply job");
            }
        }
    }
}
