use crate::codec::Codec;
use crate::dereference::{Endpoint, MessageDereferencer};
use crate::error::{EngineError, ProtocolError};
use crate::protocol::{
    DEFAULT_MAX_CACHED_MESSAGE_AGE, ForwardBody, ForwardMsg, ForwardMsgMetadata, RenderedElement,
};
use crate::reconcile::{
    self, Epoch, LifecycleEvent, ScriptRunState, StalenessReconciler, Transition,
};
use crate::tree::{AppNode, ElementTree, Elements, RootContainer};
use std::rc::Rc;
use tracing::{debug, info};

/// All protocol state for one connection: message cache, element tree and
/// the script-run state machine. Dropping it (or calling [`Session::close`])
/// discards everything; a reconnect opens a fresh one.
pub struct Session {
    codec: Rc<dyn Codec>,
    dereferencer: MessageDereferencer,
    tree: ElementTree,
    reconciler: StalenessReconciler,
    max_cached_message_age: u32,
}

impl Session {
    pub fn open(endpoint: Rc<dyn Endpoint>, codec: Rc<dyn Codec>) -> Self {
        Self {
            dereferencer: MessageDereferencer::new(endpoint, Rc::clone(&codec)),
            codec,
            tree: ElementTree::new(),
            reconciler: StalenessReconciler::new(),
            max_cached_message_age: DEFAULT_MAX_CACHED_MESSAGE_AGE,
        }
    }

    pub fn close(self) {
        info!(
            script_runs = self.dereferencer.cache().script_run_count(),
            cached = self.dereferencer.cache().len(),
            nodes = self.tree.node_count(),
            "session closed"
        );
    }

    /// Decodes one frame, resolves cache references and applies the result.
    /// On error the message is dropped and the session stays usable.
    pub async fn process_inbound_message(&mut self, raw: &[u8]) -> Result<ForwardMsg, EngineError> {
        let msg = self.codec.decode(raw)?;
        let msg = self.dereferencer.resolve(msg, raw).await?;
        self.apply(&msg)?;
        Ok(msg)
    }

    pub fn on_script_run_lifecycle(&mut self, event: LifecycleEvent) -> Transition {
        let transition = self.reconciler.handle(event, &mut self.tree);

        if transition.advance_cache_clock {
            let evicted = self
                .dereferencer
                .advance_run_count_and_evict(self.max_cached_message_age);
            debug!(
                evicted,
                max_age = self.max_cached_message_age,
                "advanced message cache clock"
            );
        }

        transition
    }

    pub fn tree_snapshot(&self) -> TreeSnapshot<'_> {
        TreeSnapshot {
            tree: &self.tree,
            epoch: self.reconciler.epoch(),
            state: self.reconciler.state(),
        }
    }

    pub fn script_run_state(&self) -> ScriptRunState {
        self.reconciler.state()
    }

    pub fn script_run_count(&self) -> u64 {
        self.dereferencer.cache().script_run_count()
    }

    pub fn cached_message_count(&self) -> usize {
        self.dereferencer.cache().len()
    }

    pub fn max_cached_message_age(&self) -> u32 {
        self.max_cached_message_age
    }

    fn apply(&mut self, msg: &ForwardMsg) -> Result<(), ProtocolError> {
        match &msg.body {
            ForwardBody::NewSession(new_session) => {
                self.max_cached_message_age = new_session.config.max_cached_message_age;
                self.on_script_run_lifecycle(LifecycleEvent::NewSession(Epoch::from(new_session)));
            }
            ForwardBody::Delta(delta) => {
                let Some(ForwardMsgMetadata {
                    delta_path,
                    active_script_hash,
                    ..
                }) = &msg.metadata
                else {
                    return Err(ProtocolError::DeltaWithoutMetadata {
                        hash: msg.hash.clone(),
                    });
                };
                let Some(epoch) = self.reconciler.epoch() else {
                    return Err(ProtocolError::NoActiveEpoch {
                        hash: msg.hash.clone(),
                    });
                };

                let stamp = epoch.stamp(delta.fragment_id.clone(), active_script_hash.clone());
                self.tree.apply_delta(delta_path, &delta.change, stamp)?;
            }
            ForwardBody::ScriptFinished { status } => {
                self.on_script_run_lifecycle(LifecycleEvent::ScriptFinished(*status));
            }
            ForwardBody::SessionStatusChanged { script_is_running } => {
                self.on_script_run_lifecycle(LifecycleEvent::SessionStatusChanged {
                    script_is_running: *script_is_running,
                });
            }
            ForwardBody::SessionEvent { event } => {
                self.on_script_run_lifecycle(LifecycleEvent::SessionEvent(*event));
            }
            ForwardBody::RefHash { ref_hash } => {
                return Err(ProtocolError::UnresolvedReference {
                    ref_hash: ref_hash.clone(),
                });
            }
        }

        Ok(())
    }
}

/// Read-only view of the tree for the rendering layer.
#[derive(Clone, Copy)]
pub struct TreeSnapshot<'a> {
    tree: &'a ElementTree,
    epoch: Option<&'a Epoch>,
    state: ScriptRunState,
}

impl<'a> TreeSnapshot<'a> {
    pub fn elements(&self) -> Elements<'a> {
        self.tree.elements()
    }

    pub fn container(&self, container: RootContainer) -> &'a [AppNode] {
        self.tree.container(container)
    }

    pub fn get(&self, path: &[u32]) -> Option<&'a AppNode> {
        self.tree.get(path)
    }

    pub fn script_run_id(&self) -> Option<&'a str> {
        self.epoch.map(|epoch| epoch.script_run_id.as_str())
    }

    pub fn page_script_hash(&self) -> Option<&'a str> {
        self.epoch.map(|epoch| epoch.page_script_hash.as_str())
    }

    pub fn state(&self) -> ScriptRunState {
        self.state
    }

    pub fn node_count(&self) -> usize {
        self.tree.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// See [`reconcile::is_stale`].
    pub fn is_stale(&self, node: &AppNode) -> bool {
        reconcile::is_stale(node.stamp(), self.state, self.epoch)
    }

    pub fn rendered_elements(&self) -> Vec<RenderedElement> {
        self.tree
            .leaves()
            .map(|leaf| RenderedElement {
                element: leaf.element.clone(),
                stale: reconcile::is_stale(&leaf.stamp, self.state, self.epoch),
            })
            .collect()
    }
}
