pub mod cache;
pub mod codec;
pub mod dereference;
pub mod error;
pub mod protocol;
pub mod reconcile;
pub mod session;
pub mod tree;

use tokio::sync::mpsc;
use tracing::{debug, warn};

pub use crate::cache::CacheStore;
pub use crate::codec::{Codec, JsonCodec};
pub use crate::dereference::{Endpoint, MessageDereferencer};
pub use crate::error::{DecodeError, EngineError, FetchError, ProtocolError};
pub use crate::protocol::{
    Block, Delta, DeltaChange, Element, ForwardBody, ForwardMsg, ForwardMsgMetadata,
    HOST_TO_SERVER_CAP, HostEnvelope, NewSession, RenderedElement, SERVER_TO_HOST_CAP,
    ScriptFinishedStatus, SessionConfig, SessionEventKind,
};
pub use crate::reconcile::{Epoch, LifecycleEvent, ScriptRunState, Transition};
pub use crate::session::{Session, TreeSnapshot};
pub use crate::tree::{AppNode, NodeStamp, RootContainer};
pub use serde_json;

/// How the engine talks to whatever renders the tree.
pub trait HostBindings {
    fn render_tree(&mut self, snapshot: TreeSnapshot<'_>);

    fn report_error(&mut self, err: &EngineError);

    fn message_applied(&mut self, _msg: &ForwardMsg) {}
}

/// Feeds inbound frames through `session` strictly in arrival order until
/// the queue closes. A failed message is reported and skipped; nothing here
/// ends the loop early.
pub async fn run_session<B: HostBindings>(
    session: &mut Session,
    inbound: &mut mpsc::Receiver<Vec<u8>>,
    bindings: &mut B,
) {
    while let Some(frame) = inbound.recv().await {
        match session.process_inbound_message(&frame).await {
            Ok(msg) => {
                debug!(kind = msg.body.kind(), hash = %msg.hash, "applied forward message");
                bindings.message_applied(&msg);

                if msg.body.is_lifecycle() {
                    bindings.render_tree(session.tree_snapshot());
                }
            }
            Err(err) => {
                warn!(code = err.code(), error = %err, "dropping forward message");
                bindings.report_error(&err);
            }
        }
    }
}
