//! Node-to-node transport

mod codec;
mod memory;
mod tcp;

pub use codec::{CodecError, RaftCodec, MAX_FRAME_SIZE};
pub use memory::{MemoryRouter, MemoryTransport};
pub use tcp::{RaftRpcServer, TcpTransport};

use async_trait::async_trait;

use crate::error::{RaftError, RaftResult};
use crate::message::*;
use dcache_core::Server;

/// Point-to-point RPC channel to other servers.
///
/// Implementations only provide [`Transport::call`]; failures are reported as
/// [`RaftError::TransientNetwork`] and retried by the caller.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn call(&self, target: &Server, request: RaftRequest) -> RaftResult<RaftResponse>;

    async fn request_vote(
        &self,
        target: &Server,
        request: RequestVoteRequest,
    ) -> RaftResult<RequestVoteResponse> {
        match self.call(target, RaftRequest::RequestVote(request)).await? {
            RaftResponse::RequestVote(response) => Ok(response),
            other => Err(unexpected(other)),
        }
    }

    async fn append_entries(
        &self,
        target: &Server,
        request: AppendEntriesRequest,
    ) -> RaftResult<AppendEntriesResponse> {
        match self.call(target, RaftRequest::AppendEntries(request)).await? {
            RaftResponse::AppendEntries(response) => Ok(response),
            other => Err(unexpected(other)),
        }
    }

    async fn install_snapshot(
        &self,
        target: &Server,
        request: InstallSnapshotRequest,
    ) -> RaftResult<InstallSnapshotResponse> {
        match self.call(target, RaftRequest::InstallSnapshot(request)).await? {
            RaftResponse::InstallSnapshot(response) => Ok(response),
            other => Err(unexpected(other)),
        }
    }

    async fn forward(&self, target: &Server, request: ForwardRequest) -> RaftResult<ForwardResponse> {
        match self.call(target, RaftRequest::Forward(request)).await? {
            RaftResponse::Forward(response) => Ok(response),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(response: RaftResponse) -> RaftError {
    match response {
        RaftResponse::Error(msg) => RaftError::TransientNetwork(msg),
        _ => RaftError::TransientNetwork("unexpected response type".to_string()),
    }
}
