use delta_host_runtime::serde_json::{self, Value, json};
use delta_host_runtime::{
    EngineError, Endpoint, FetchError, JsonCodec, LifecycleEvent, ProtocolError, ScriptRunState,
    Session,
};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

#[derive(Default)]
struct FakeServer {
    stored: RefCell<HashMap<String, Vec<u8>>>,
    requests: RefCell<Vec<String>>,
}

#[async_trait::async_trait(?Send)]
impl Endpoint for FakeServer {
    async fn fetch_cached_message(&self, hash: &str) -> Result<Vec<u8>, FetchError> {
        self.requests.borrow_mut().push(hash.to_string());
        self.stored
            .borrow()
            .get(hash)
            .cloned()
            .ok_or_else(|| FetchError::new(hash, "404 Not Found"))
    }
}

fn open() -> (Session, Rc<FakeServer>) {
    let server = Rc::new(FakeServer::default());
    let session = Session::open(server.clone(), Rc::new(JsonCodec));
    (session, server)
}

fn bytes(value: &Value) -> Vec<u8> {
    serde_json::to_vec(value).expect("encode frame")
}

fn new_session(page: &str, run: &str, fragments: &[&str]) -> Value {
    json!({
        "t": "new_session",
        "hash": format!("session-{run}"),
        "page_script_hash": page,
        "script_run_id": run,
        "fragment_ids_this_run": fragments,
    })
}

fn text_delta(path: &[u32], body: &str) -> Value {
    json!({
        "t": "delta",
        "hash": format!("text-{body}"),
        "metadata": {"delta_path": path},
        "change": {"op": "new_element", "element": {"type": "text", "props": {"body": body}}},
    })
}

fn fragment_delta(path: &[u32], body: &str, fragment: &str) -> Value {
    let mut delta = text_delta(path, body);
    delta["fragment_id"] = json!(fragment);
    delta
}

fn block_delta(path: &[u32], fragment: Option<&str>) -> Value {
    let mut delta = json!({
        "t": "delta",
        "hash": format!("block-{path:?}"),
        "metadata": {"delta_path": path},
        "change": {"op": "add_block", "block": {"type": "vertical"}},
    });
    if let Some(fragment) = fragment {
        delta["fragment_id"] = json!(fragment);
    }
    delta
}

fn cacheable_image(hash: &str, path: &[u32]) -> Value {
    json!({
        "t": "delta",
        "hash": hash,
        "metadata": {"cacheable": true, "delta_path": path},
        "change": {"op": "new_element", "element": {"type": "image", "props": {"url": "/media/cat.png"}}},
    })
}

fn reference(hash: &str, path: &[u32]) -> Value {
    json!({
        "t": "ref_hash",
        "hash": format!("ref-{hash}"),
        "metadata": {"cacheable": true, "delta_path": path},
        "ref_hash": hash,
    })
}

fn finished(status: &str) -> Value {
    json!({"t": "script_finished", "hash": format!("finished-{status}"), "status": status})
}

async fn send(session: &mut Session, value: Value) {
    session
        .process_inbound_message(&bytes(&value))
        .await
        .unwrap_or_else(|err| panic!("message {value} failed: {err}"));
}

fn bodies(session: &Session) -> Vec<String> {
    session
        .tree_snapshot()
        .elements()
        .map(|element| element.props["body"].as_str().unwrap_or_default().to_string())
        .collect()
}

#[tokio::test]
async fn navigation_clears_tree_before_new_deltas() {
    let (mut session, _server) = open();

    send(&mut session, new_session("P1", "R1", &[])).await;
    send(&mut session, text_delta(&[0, 0], "a")).await;
    send(&mut session, text_delta(&[0, 1], "b")).await;
    send(&mut session, finished("FINISHED_SUCCESSFULLY")).await;

    assert_eq!(bodies(&session), vec!["a", "b"]);
    assert_eq!(session.script_run_state(), ScriptRunState::NotRunning);

    send(&mut session, new_session("P2", "R2", &[])).await;

    let snapshot = session.tree_snapshot();
    assert!(snapshot.is_empty());
    assert_eq!(snapshot.page_script_hash(), Some("P2"));
    assert_eq!(snapshot.state(), ScriptRunState::Running);
}

#[tokio::test]
async fn rerun_replaces_in_place_and_sweeps_leftovers() {
    let (mut session, _server) = open();

    send(&mut session, new_session("P1", "R1", &[])).await;
    send(&mut session, text_delta(&[0, 0], "some text")).await;
    send(&mut session, text_delta(&[0, 1], "other text")).await;

    send(&mut session, new_session("P1", "R2", &[])).await;
    send(&mut session, text_delta(&[0, 0], "new text")).await;
    send(&mut session, finished("FINISHED_EARLY_FOR_RERUN")).await;
    assert_eq!(bodies(&session), vec!["new text", "other text"]);

    send(&mut session, finished("FINISHED_FRAGMENT_RUN_SUCCESSFULLY")).await;
    assert_eq!(bodies(&session), vec!["new text"]);
}

#[tokio::test]
async fn fragment_rerun_leaves_other_fragments_alone() {
    let (mut session, _server) = open();

    send(&mut session, new_session("P1", "R1", &[])).await;
    send(&mut session, fragment_delta(&[0, 0], "f1 old", "F1")).await;
    send(&mut session, fragment_delta(&[0, 1], "f2", "F2")).await;
    send(&mut session, finished("FINISHED_SUCCESSFULLY")).await;

    send(&mut session, new_session("P1", "R2", &["F1"])).await;
    send(&mut session, fragment_delta(&[0, 2], "f1 new", "F1")).await;
    send(&mut session, finished("FINISHED_FRAGMENT_RUN_SUCCESSFULLY")).await;

    assert_eq!(bodies(&session), vec!["f2", "f1 new"]);
}

#[tokio::test]
async fn reference_resolves_to_cached_payload_at_its_own_path() {
    let (mut session, server) = open();

    send(&mut session, new_session("P1", "R1", &[])).await;
    send(&mut session, cacheable_image("img", &[0, 0])).await;
    send(&mut session, finished("FINISHED_SUCCESSFULLY")).await;
    assert_eq!(session.cached_message_count(), 1);

    send(&mut session, new_session("P1", "R2", &[])).await;
    send(&mut session, text_delta(&[0, 0], "caption")).await;
    let resolved = session
        .process_inbound_message(&bytes(&reference("img", &[0, 1])))
        .await
        .expect("resolve reference");
    send(&mut session, finished("FINISHED_SUCCESSFULLY")).await;

    assert_eq!(resolved.hash, "img");
    assert_eq!(resolved.metadata.expect("metadata").delta_path, vec![0, 1]);
    assert!(server.requests.borrow().is_empty());

    let snapshot = session.tree_snapshot();
    let kinds: Vec<&str> = snapshot.elements().map(|element| element.kind.as_str()).collect();
    assert_eq!(kinds, vec!["text", "image"]);
}

#[tokio::test]
async fn cache_miss_is_fetched_from_the_server() {
    let (mut session, server) = open();
    server
        .stored
        .borrow_mut()
        .insert("img".to_string(), bytes(&cacheable_image("img", &[9, 9])));

    send(&mut session, new_session("P1", "R1", &[])).await;
    send(&mut session, reference("img", &[0, 0])).await;

    assert_eq!(*server.requests.borrow(), vec!["img".to_string()]);
    assert_eq!(session.cached_message_count(), 1);
    assert_eq!(session.tree_snapshot().node_count(), 1);
}

#[tokio::test]
async fn cached_messages_expire_after_max_age_runs() {
    let (mut session, _server) = open();
    let mut start = new_session("P1", "R1", &[]);
    start["config"] = json!({"max_cached_message_age": 1});

    send(&mut session, start).await;
    send(&mut session, cacheable_image("img", &[0, 0])).await;
    send(&mut session, finished("FINISHED_SUCCESSFULLY")).await;
    assert_eq!(session.cached_message_count(), 1);

    send(&mut session, finished("FINISHED_EARLY_FOR_RERUN")).await;
    assert_eq!(session.script_run_count(), 2);
    assert_eq!(session.cached_message_count(), 0);
}

#[tokio::test]
async fn compile_error_does_not_age_the_cache() {
    let (mut session, _server) = open();

    send(&mut session, new_session("P1", "R1", &[])).await;
    send(&mut session, finished("FINISHED_WITH_COMPILE_ERROR")).await;

    assert_eq!(session.script_run_count(), 0);
    assert_eq!(session.script_run_state(), ScriptRunState::CompilationError);
}

#[tokio::test]
async fn delta_before_any_session_is_rejected_without_poisoning_the_session() {
    let (mut session, _server) = open();

    let err = session
        .process_inbound_message(&bytes(&text_delta(&[0, 0], "early")))
        .await
        .expect_err("no epoch yet");
    assert!(matches!(
        err,
        EngineError::Protocol(ProtocolError::NoActiveEpoch { .. })
    ));

    send(&mut session, new_session("P1", "R1", &[])).await;
    send(&mut session, text_delta(&[0, 0], "on time")).await;
    assert_eq!(bodies(&session), vec!["on time"]);
}

#[tokio::test]
async fn host_actions_drive_side_branches() {
    let (mut session, _server) = open();
    send(&mut session, new_session("P1", "R1", &[])).await;

    let transition = session.on_script_run_lifecycle(LifecycleEvent::StopRequested);
    assert_eq!(transition.state, ScriptRunState::StopRequested);
    assert!(!transition.advance_cache_clock);

    send(
        &mut session,
        json!({"t": "session_status_changed", "hash": "s1", "script_is_running": false}),
    )
    .await;
    assert_eq!(session.script_run_state(), ScriptRunState::NotRunning);

    session.on_script_run_lifecycle(LifecycleEvent::RerunRequested);
    send(&mut session, new_session("P1", "R2", &[])).await;
    assert_eq!(session.script_run_state(), ScriptRunState::Running);
}

#[tokio::test]
async fn fragment_rerun_into_existing_container_keeps_fresh_children() {
    let (mut session, _server) = open();

    send(&mut session, new_session("P1", "R1", &[])).await;
    send(&mut session, block_delta(&[0, 0], Some("F1"))).await;
    send(&mut session, fragment_delta(&[0, 0, 0], "old", "F1")).await;
    send(&mut session, finished("FINISHED_SUCCESSFULLY")).await;

    send(&mut session, new_session("P1", "R2", &["F1"])).await;
    send(&mut session, fragment_delta(&[0, 0, 0], "fresh", "F1")).await;
    send(&mut session, finished("FINISHED_FRAGMENT_RUN_SUCCESSFULLY")).await;

    assert_eq!(bodies(&session), vec!["fresh"]);
    let container = session.tree_snapshot().get(&[0, 0]).cloned().expect("fragment container");
    assert_eq!(container.stamp().script_run_id, "R2");
    assert_eq!(container.stamp().fragment_id.as_deref(), Some("F1"));
}

#[tokio::test]
async fn full_rerun_into_existing_block_keeps_fresh_children() {
    let (mut session, _server) = open();

    send(&mut session, new_session("P1", "R1", &[])).await;
    send(&mut session, block_delta(&[0, 0], None)).await;
    send(&mut session, text_delta(&[0, 0, 0], "old inner")).await;
    send(&mut session, text_delta(&[0, 0, 1], "old leftover")).await;
    send(&mut session, finished("FINISHED_SUCCESSFULLY")).await;

    send(&mut session, new_session("P1", "R2", &[])).await;
    send(&mut session, text_delta(&[0, 0, 0], "new inner")).await;
    send(&mut session, finished("FINISHED_SUCCESSFULLY")).await;

    assert_eq!(bodies(&session), vec!["new inner"]);
    assert_eq!(session.tree_snapshot().node_count(), 2);
}

#[tokio::test]
async fn snapshot_marks_elements_the_running_script_will_replace() {
    let (mut session, _server) = open();

    send(&mut session, new_session("P1", "R1", &[])).await;
    send(&mut session, text_delta(&[0, 0], "a")).await;
    send(&mut session, text_delta(&[0, 1], "b")).await;
    send(&mut session, finished("FINISHED_SUCCESSFULLY")).await;

    let stale_flags = |session: &Session| -> Vec<(String, bool)> {
        session
            .tree_snapshot()
            .rendered_elements()
            .into_iter()
            .map(|rendered| {
                let body = rendered.element.props["body"].as_str().unwrap_or_default();
                (body.to_string(), rendered.stale)
            })
            .collect()
    };
    let flags = |pairs: &[(&str, bool)]| -> Vec<(String, bool)> {
        pairs.iter().map(|(body, stale)| (body.to_string(), *stale)).collect()
    };

    assert_eq!(stale_flags(&session), flags(&[("a", false), ("b", false)]));

    session.on_script_run_lifecycle(LifecycleEvent::RerunRequested);
    assert_eq!(stale_flags(&session), flags(&[("a", true), ("b", true)]));

    send(&mut session, new_session("P1", "R2", &[])).await;
    send(&mut session, text_delta(&[0, 0], "a2")).await;
    assert_eq!(stale_flags(&session), flags(&[("a2", false), ("b", true)]));

    send(&mut session, finished("FINISHED_SUCCESSFULLY")).await;
    assert_eq!(stale_flags(&session), flags(&[("a2", false)]));
}
