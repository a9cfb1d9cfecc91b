// Outbound RPC port.
//
// The core treats every transport failure uniformly: a call either returns
// the peer's reply or it failed. Wire errors and peer-side refusals to
// answer are indistinguishable here.

use crate::common::NodeAddr;
use crate::error::Result;
use crate::message::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest,
    InstallSnapshotResponse, VoteRequest, VoteResponse,
};

/// Synchronous RPC surface the core dispatches through. Implementations own
/// connection management, retries below the call boundary, and encoding.
#[async_trait::async_trait]
pub trait RaftTransport: Send + Sync {
    async fn append_entries(
        &self,
        addr: &NodeAddr,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse>;

    async fn request_vote(&self, addr: &NodeAddr, req: VoteRequest) -> Result<VoteResponse>;

    async fn install_snapshot(
        &self,
        addr: &NodeAddr,
        req: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse>;
}
