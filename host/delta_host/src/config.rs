const DEFAULT_SID: &str = "S1";
const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:8501";
const DEFAULT_OUTBOUND_QUEUE_CAP: usize = 256;
const DEFAULT_INBOUND_QUEUE_CAP: usize = 1024;
const DEFAULT_LOG_FILTER: &str = "info";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostConfig {
    pub sid: String,
    pub server_url: String,
    pub outbound_queue_cap: usize,
    pub inbound_queue_cap: usize,
    pub log_filter: String,
}

impl HostConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            sid: non_empty(lookup("DELTA_HOST_SID")).unwrap_or_else(|| DEFAULT_SID.to_string()),
            server_url: parse_server_url(lookup("DELTA_HOST_SERVER_URL")),
            outbound_queue_cap: parse_queue_capacity(
                lookup("DELTA_HOST_OUTBOUND_QUEUE_CAP"),
                DEFAULT_OUTBOUND_QUEUE_CAP,
            ),
            inbound_queue_cap: parse_queue_capacity(
                lookup("DELTA_HOST_INBOUND_QUEUE_CAP"),
                DEFAULT_INBOUND_QUEUE_CAP,
            ),
            log_filter: non_empty(lookup("DELTA_HOST_LOG"))
                .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string()),
        }
    }
}

fn non_empty(raw: Option<String>) -> Option<String> {
    raw.map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_server_url(raw: Option<String>) -> String {
    non_empty(raw)
        .map(|url| url.trim_end_matches('/').to_string())
        .unwrap_or_else(|| DEFAULT_SERVER_URL.to_string())
}

fn parse_queue_capacity(raw: Option<String>, default: usize) -> usize {
    raw.and_then(|raw| raw.trim().parse::<usize>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}
