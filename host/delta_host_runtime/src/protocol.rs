use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::{self, Read, Write};
use std::ops::ControlFlow;
use std::sync::mpsc::Receiver;

pub const HOST_TO_SERVER_CAP: usize = 65_536;
pub const SERVER_TO_HOST_CAP: usize = 1_048_576;

pub const DEFAULT_MAX_CACHED_MESSAGE_AGE: u32 = 2;

/// One message from the backend. `hash` identifies the payload for caching;
/// `body` is what the message actually says.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwardMsg {
    #[serde(default)]
    pub hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ForwardMsgMetadata>,
    #[serde(flatten)]
    pub body: ForwardBody,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardMsgMetadata {
    #[serde(default)]
    pub cacheable: bool,
    #[serde(default)]
    pub delta_path: Vec<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_script_hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t")]
pub enum ForwardBody {
    #[serde(rename = "new_session")]
    NewSession(NewSession),

    #[serde(rename = "delta")]
    Delta(Delta),

    #[serde(rename = "script_finished")]
    ScriptFinished { status: ScriptFinishedStatus },

    #[serde(rename = "session_status_changed")]
    SessionStatusChanged { script_is_running: bool },

    #[serde(rename = "session_event")]
    SessionEvent { event: SessionEventKind },

    #[serde(rename = "ref_hash")]
    RefHash { ref_hash: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewSession {
    pub page_script_hash: String,
    pub script_run_id: String,
    #[serde(default)]
    pub fragment_ids_this_run: Vec<String>,
    #[serde(default)]
    pub config: SessionConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_max_cached_message_age")]
    pub max_cached_message_age: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_cached_message_age: DEFAULT_MAX_CACHED_MESSAGE_AGE,
        }
    }
}

fn default_max_cached_message_age() -> u32 {
    DEFAULT_MAX_CACHED_MESSAGE_AGE
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fragment_id: Option<String>,
    pub change: DeltaChange,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum DeltaChange {
    #[serde(rename = "new_element")]
    NewElement { element: Element },
    #[serde(rename = "add_block")]
    AddBlock { block: Block },
}

/// Leaf payload. The engine never looks inside `props`; that is the
/// rendering layer's business.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Element {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub props: Value,
}

/// A leaf as sent to the renderer. `stale` marks output a newer run is about
/// to replace, so it can be dimmed until the sweep removes it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenderedElement {
    #[serde(flatten)]
    pub element: Element,
    pub stale: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    #[serde(rename = "type", default = "default_block_kind")]
    pub kind: String,
    #[serde(default)]
    pub props: Value,
}

fn default_block_kind() -> String {
    "vertical".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScriptFinishedStatus {
    FinishedSuccessfully,
    FinishedWithCompileError,
    FinishedEarlyForRerun,
    FinishedFragmentRunSuccessfully,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEventKind {
    ScriptCompilationException,
    ScriptChangedOnDisk,
    ScriptWasManuallyStopped,
}

impl ForwardMsg {
    pub fn ref_hash(&self) -> Option<&str> {
        match &self.body {
            ForwardBody::RefHash { ref_hash } => Some(ref_hash),
            _ => None,
        }
    }

    pub fn is_reference(&self) -> bool {
        self.ref_hash().is_some()
    }

    /// The `cacheable` flag on a reference describes its referent, so a
    /// reference itself is never cacheable.
    pub fn is_cacheable(&self) -> bool {
        !self.is_reference() && self.metadata.as_ref().is_some_and(|meta| meta.cacheable)
    }
}

impl ForwardBody {
    pub fn kind(&self) -> &'static str {
        match self {
            ForwardBody::NewSession(_) => "new_session",
            ForwardBody::Delta(_) => "delta",
            ForwardBody::ScriptFinished { .. } => "script_finished",
            ForwardBody::SessionStatusChanged { .. } => "session_status_changed",
            ForwardBody::SessionEvent { .. } => "session_event",
            ForwardBody::RefHash { .. } => "ref_hash",
        }
    }

    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            ForwardBody::NewSession(_)
                | ForwardBody::ScriptFinished { .. }
                | ForwardBody::SessionStatusChanged { .. }
                | ForwardBody::SessionEvent { .. }
        )
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "t")]
pub enum HostEnvelope {
    #[serde(rename = "ready")]
    Ready { sid: String, capabilities: Value },
    #[serde(rename = "tree")]
    Tree {
        sid: String,
        script_run_id: Option<String>,
        state: String,
        elements: Vec<RenderedElement>,
    },
    #[serde(rename = "error")]
    Error {
        sid: String,
        code: String,
        message: String,
    },
}

pub fn ready_envelope(sid: String) -> HostEnvelope {
    HostEnvelope::Ready {
        sid,
        capabilities: serde_json::json!({
            "forward_msg_cache": true,
            "transport": "stdio-packet-4"
        }),
    }
}

pub fn tree_envelope(
    sid: String,
    script_run_id: Option<String>,
    state: impl Into<String>,
    elements: Vec<RenderedElement>,
) -> HostEnvelope {
    HostEnvelope::Tree {
        sid,
        script_run_id,
        state: state.into(),
        elements,
    }
}

pub fn error_envelope(sid: String, code: impl Into<String>, message: impl Into<String>) -> HostEnvelope {
    HostEnvelope::Error {
        sid,
        code: code.into(),
        message: message.into(),
    }
}

pub fn writer_loop(mut writer: impl Write, rx: Receiver<HostEnvelope>) -> io::Result<()> {
    for envelope in rx {
        let payload = encode_host_envelope(&envelope)?;
        write_frame(&mut writer, &payload, HOST_TO_SERVER_CAP)?;
        writer.flush()?;
    }

    Ok(())
}

/// Reads frames until EOF or until `on_frame` asks to stop. Frames are
/// handed over undecoded: the cache needs the exact bytes the server sent.
pub fn reader_loop<F>(mut reader: impl Read, mut on_frame: F) -> io::Result<()>
where
    F: FnMut(Vec<u8>) -> ControlFlow<()>,
{
    loop {
        match read_frame(&mut reader, SERVER_TO_HOST_CAP) {
            Ok(payload) => {
                if on_frame(payload).is_break() {
                    return Ok(());
                }
            }
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(err) => return Err(err),
        }
    }
}

fn encode_host_envelope(envelope: &HostEnvelope) -> io::Result<Vec<u8>> {
    serde_json::to_vec(envelope).map_err(json_error)
}

fn read_frame(reader: &mut impl Read, max_payload: usize) -> io::Result<Vec<u8>> {
    let mut len_buf = [0_u8; 4];
    reader.read_exact(&mut len_buf)?;

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_payload {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame too large: {len} > {max_payload}"),
        ));
    }

    let mut payload = vec![0_u8; len];
    reader.read_exact(&mut payload)?;
    Ok(payload)
}

pub fn write_frame(writer: &mut impl Write, payload: &[u8], max_payload: usize) -> io::Result<()> {
    if payload.len() > max_payload {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame too large: {} > {}", payload.len(), max_payload),
        ));
    }

    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "payload exceeds u32"))?;

    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(payload)?;
    Ok(())
}

fn json_error(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}
