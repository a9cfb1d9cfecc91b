// Application state machine port.

use crate::error::Result;

/// The user-supplied state machine committed commands are applied to.
///
/// `apply` is invoked at most once per log index, in index order.
/// `serialize` must capture exactly the applied prefix; the engine pairs the
/// result with the last applied index to form a snapshot.
#[async_trait::async_trait]
pub trait StateMachine: Send + Sync {
    async fn apply(&self, data: &[u8]) -> Result<()>;

    async fn serialize(&self) -> Result<Vec<u8>>;
}
