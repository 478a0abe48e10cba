use crate::protocol::{NewSession, ScriptFinishedStatus, SessionEventKind};
use crate::tree::{AppNode, ElementTree, NodeStamp};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScriptRunState {
    #[default]
    NotRunning,
    Running,
    RerunRequested,
    StopRequested,
    CompilationError,
}

impl ScriptRunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScriptRunState::NotRunning => "not_running",
            ScriptRunState::Running => "running",
            ScriptRunState::RerunRequested => "rerun_requested",
            ScriptRunState::StopRequested => "stop_requested",
            ScriptRunState::CompilationError => "compilation_error",
        }
    }
}

/// The run currently feeding the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Epoch {
    pub page_script_hash: String,
    pub script_run_id: String,
    pub fragment_ids_this_run: BTreeSet<String>,
}

impl Epoch {
    pub fn new(page_script_hash: impl Into<String>, script_run_id: impl Into<String>) -> Self {
        Self {
            page_script_hash: page_script_hash.into(),
            script_run_id: script_run_id.into(),
            fragment_ids_this_run: BTreeSet::new(),
        }
    }

    pub fn with_fragments<I, S>(mut self, fragment_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fragment_ids_this_run = fragment_ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn is_fragment_run(&self) -> bool {
        !self.fragment_ids_this_run.is_empty()
    }

    /// True when this run will rewrite the node: it came from another run
    /// and, for a fragment run, belongs to one of the rerun fragments.
    pub fn supersedes(&self, stamp: &NodeStamp) -> bool {
        if stamp.script_run_id == self.script_run_id {
            return false;
        }
        if !self.is_fragment_run() {
            return true;
        }
        stamp
            .fragment_id
            .as_ref()
            .is_some_and(|fragment_id| self.fragment_ids_this_run.contains(fragment_id))
    }

    pub fn stamp(&self, fragment_id: Option<String>, active_script_hash: Option<String>) -> NodeStamp {
        NodeStamp {
            script_run_id: self.script_run_id.clone(),
            fragment_id,
            active_script_hash: active_script_hash.unwrap_or_else(|| self.page_script_hash.clone()),
        }
    }
}

impl From<&NewSession> for Epoch {
    fn from(session: &NewSession) -> Self {
        Epoch::new(&session.page_script_hash, &session.script_run_id)
            .with_fragments(session.fragment_ids_this_run.iter().cloned())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    NewSession(Epoch),
    ScriptFinished(ScriptFinishedStatus),
    SessionStatusChanged { script_is_running: bool },
    SessionEvent(SessionEventKind),
    RerunRequested,
    StopRequested,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SweepScope {
    Full,
    Fragments(BTreeSet<String>),
}

impl SweepScope {
    /// Which nodes a finishing run is allowed to prune, if any.
    pub fn for_finish(status: ScriptFinishedStatus, epoch: &Epoch) -> Option<SweepScope> {
        match status {
            ScriptFinishedStatus::FinishedSuccessfully => Some(SweepScope::Full),
            ScriptFinishedStatus::FinishedFragmentRunSuccessfully if epoch.is_fragment_run() => {
                Some(SweepScope::Fragments(epoch.fragment_ids_this_run.clone()))
            }
            ScriptFinishedStatus::FinishedFragmentRunSuccessfully => Some(SweepScope::Full),
            ScriptFinishedStatus::FinishedEarlyForRerun
            | ScriptFinishedStatus::FinishedWithCompileError => None,
        }
    }

    pub fn is_stale(&self, node: &AppNode, current_script_run_id: &str) -> bool {
        let stamp = node.stamp();
        if stamp.script_run_id == current_script_run_id {
            return false;
        }

        match self {
            SweepScope::Full => true,
            SweepScope::Fragments(fragment_ids) => stamp
                .fragment_id
                .as_ref()
                .is_some_and(|fragment_id| fragment_ids.contains(fragment_id)),
        }
    }
}

/// Whether a node should render as superseded right now. Everything is
/// stale once a rerun is requested; while running, whatever the current run
/// will replace; otherwise nothing.
pub fn is_stale(stamp: &NodeStamp, state: ScriptRunState, epoch: Option<&Epoch>) -> bool {
    match state {
        ScriptRunState::RerunRequested => true,
        ScriptRunState::Running => epoch.is_some_and(|epoch| epoch.supersedes(stamp)),
        ScriptRunState::NotRunning
        | ScriptRunState::StopRequested
        | ScriptRunState::CompilationError => false,
    }
}

/// What a lifecycle event did to the session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transition {
    pub state: ScriptRunState,
    pub page_changed: bool,
    pub removed: usize,
    pub advance_cache_clock: bool,
}

#[derive(Debug, Default)]
pub struct StalenessReconciler {
    state: ScriptRunState,
    epoch: Option<Epoch>,
}

impl StalenessReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ScriptRunState {
        self.state
    }

    pub fn epoch(&self) -> Option<&Epoch> {
        self.epoch.as_ref()
    }

    pub fn is_stale(&self, node: &AppNode) -> bool {
        is_stale(node.stamp(), self.state, self.epoch.as_ref())
    }

    pub fn handle(&mut self, event: LifecycleEvent, tree: &mut ElementTree) -> Transition {
        let mut transition = Transition::default();

        match event {
            LifecycleEvent::NewSession(epoch) => {
                let page_changed = self
                    .epoch
                    .as_ref()
                    .is_some_and(|previous| previous.page_script_hash != epoch.page_script_hash);

                if page_changed {
                    transition.page_changed = true;
                    transition.removed = tree.clear();
                    info!(
                        page_script_hash = %epoch.page_script_hash,
                        removed = transition.removed,
                        "page changed; cleared element tree"
                    );
                }

                debug!(
                    script_run_id = %epoch.script_run_id,
                    fragments = epoch.fragment_ids_this_run.len(),
                    "script run started"
                );
                self.epoch = Some(epoch);
                self.state = ScriptRunState::Running;
            }
            LifecycleEvent::ScriptFinished(status) => {
                self.state = match status {
                    ScriptFinishedStatus::FinishedWithCompileError => ScriptRunState::CompilationError,
                    _ => ScriptRunState::NotRunning,
                };

                let Some(epoch) = &self.epoch else {
                    warn!(?status, "script finished before any new session; ignoring");
                    transition.state = self.state;
                    return transition;
                };

                if let Some(scope) = SweepScope::for_finish(status, epoch) {
                    let current = epoch.script_run_id.as_str();
                    transition.removed = tree.prune_stale(|node| scope.is_stale(node, current));
                    debug!(
                        script_run_id = %current,
                        removed = transition.removed,
                        ?scope,
                        "pruned stale nodes"
                    );
                }

                transition.advance_cache_clock =
                    status != ScriptFinishedStatus::FinishedWithCompileError;
            }
            LifecycleEvent::SessionStatusChanged { script_is_running } => {
                self.state = match (self.state, script_is_running) {
                    (ScriptRunState::StopRequested, false) => ScriptRunState::NotRunning,
                    (ScriptRunState::StopRequested, true) => ScriptRunState::StopRequested,
                    (ScriptRunState::RerunRequested, true) => ScriptRunState::Running,
                    (ScriptRunState::RerunRequested, false) => ScriptRunState::RerunRequested,
                    (ScriptRunState::CompilationError, false) => ScriptRunState::CompilationError,
                    (_, true) => ScriptRunState::Running,
                    (_, false) => ScriptRunState::NotRunning,
                };
            }
            LifecycleEvent::SessionEvent(kind) => match kind {
                SessionEventKind::ScriptCompilationException => {
                    self.state = ScriptRunState::CompilationError;
                }
                SessionEventKind::ScriptWasManuallyStopped => {
                    self.state = ScriptRunState::NotRunning;
                }
                SessionEventKind::ScriptChangedOnDisk => {
                    debug!("script changed on disk");
                }
            },
            LifecycleEvent::RerunRequested => {
                if self.state == ScriptRunState::StopRequested {
                    debug!("ignoring rerun request while a stop is pending");
                } else {
                    self.state = ScriptRunState::RerunRequested;
                }
            }
            LifecycleEvent::StopRequested => match self.state {
                ScriptRunState::Running | ScriptRunState::NotRunning => {
                    self.state = ScriptRunState::StopRequested;
                }
                other => debug!(state = other.as_str(), "ignoring stop request"),
            },
        }

        transition.state = self.state;
        transition
    }
}
