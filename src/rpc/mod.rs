use crate::pb::{self, world_server};
use crate::policy::Peer;
use crate::world::WorldCore;
use axum::extract::ConnectInfo;
use futures::Stream;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tonic::{Request, Response, Status};

/// The gRPC edge: extracts the caller's identity, delegates to `WorldCore`,
/// and maps engine errors onto status codes.
pub struct WorldService {
    core: Arc<WorldCore>,
}

impl WorldService {
    pub fn new(core: Arc<WorldCore>) -> Self {
        Self { core }
    }

    pub fn server(core: Arc<WorldCore>) -> world_server::WorldServer<WorldService> {
        world_server::WorldServer::new(Self::new(core))
    }
}

/// Caller identity. TCP connections carry their socket address in the
/// request extensions; the in-process loopback transport carries none,
/// which is exactly the identity the policy gate exempts.
fn peer_of<T>(request: &Request<T>) -> Peer {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| Peer::Remote(info.0.ip()))
        .unwrap_or(Peer::InProcess)
}

type EventStream = Pin<Box<dyn Stream<Item = Result<pb::EntityChange, Status>> + Send>>;
type PairingStream = Pin<Box<dyn Stream<Item = Result<pb::Pairing, Status>> + Send>>;

#[tonic::async_trait]
impl world_server::World for WorldService {
    async fn push(
        &self,
        request: Request<pb::PushRequest>,
    ) -> Result<Response<pb::PushResponse>, Status> {
        let peer = peer_of(&request);
        let response = self.core.push(peer, request.into_inner().entities);
        Ok(Response::new(response))
    }

    async fn get_entity(
        &self,
        request: Request<pb::GetEntityRequest>,
    ) -> Result<Response<pb::GetEntityResponse>, Status> {
        let peer = peer_of(&request);
        let entity = self.core.get(peer, &request.get_ref().entity_id)?;
        Ok(Response::new(pb::GetEntityResponse {
            entity: Some(entity),
        }))
    }

    async fn list_entities(
        &self,
        request: Request<pb::ListEntitiesRequest>,
    ) -> Result<Response<pb::ListEntitiesResponse>, Status> {
        let peer = peer_of(&request);
        let entities = self.core.list(peer, request.into_inner().filter)?;
        Ok(Response::new(pb::ListEntitiesResponse { entities }))
    }

    type WatchEntitiesStream = EventStream;

    async fn watch_entities(
        &self,
        request: Request<pb::WatchEntitiesRequest>,
    ) -> Result<Response<Self::WatchEntitiesStream>, Status> {
        let peer = peer_of(&request);
        let request = request.into_inner();
        let events = self.core.watch(peer, request.filter, request.behavior)?;
        let stream = ReceiverStream::new(events).map(|item| item.map_err(Status::from));
        Ok(Response::new(Box::pin(stream)))
    }

    async fn expire_entity(
        &self,
        request: Request<pb::ExpireEntityRequest>,
    ) -> Result<Response<pb::ExpireEntityResponse>, Status> {
        let peer = peer_of(&request);
        self.core.expire(peer, &request.get_ref().entity_id)?;
        Ok(Response::new(pb::ExpireEntityResponse {}))
    }

    async fn run_task(
        &self,
        request: Request<pb::RunTaskRequest>,
    ) -> Result<Response<pb::RunTaskResponse>, Status> {
        let peer = peer_of(&request);
        let status = self.core.run_task(peer, &request.get_ref().entity_id).await?;
        Ok(Response::new(pb::RunTaskResponse { status }))
    }

    async fn get_local_node(
        &self,
        request: Request<pb::GetLocalNodeRequest>,
    ) -> Result<Response<pb::GetLocalNodeResponse>, Status> {
        let peer = peer_of(&request);
        let node = self.core.local_node(peer)?;
        Ok(Response::new(pb::GetLocalNodeResponse { node: Some(node) }))
    }

    type ReconcileStream = PairingStream;

    async fn reconcile(
        &self,
        request: Request<pb::ReconcileRequest>,
    ) -> Result<Response<Self::ReconcileStream>, Status> {
        let peer = peer_of(&request);
        let pairings = self.core.reconcile(peer, &request.get_ref().controller)?;
        let stream = ReceiverStream::new(pairings).map(|item| item.map_err(Status::from));
        Ok(Response::new(Box::pin(stream)))
    }

    type GetTimelineStream = EventStream;

    async fn get_timeline(
        &self,
        request: Request<pb::GetTimelineRequest>,
    ) -> Result<Response<Self::GetTimelineStream>, Status> {
        let peer = peer_of(&request);
        let events = self.core.timeline(peer, request.get_ref().seek_unix_ms)?;
        let stream = ReceiverStream::new(events).map(|item| item.map_err(Status::from));
        Ok(Response::new(Box::pin(stream)))
    }

    async fn move_timeline(
        &self,
        request: Request<pb::MoveTimelineRequest>,
    ) -> Result<Response<pb::MoveTimelineResponse>, Status> {
        let peer = peer_of(&request);
        let request = request.get_ref();
        self.core
            .move_timeline(peer, request.freeze, request.at_unix_ms)?;
        Ok(Response::new(pb::MoveTimelineResponse {}))
    }
}
