use once_cell::sync::Lazy;

pub static USER_AGENT: Lazy<String> =
    Lazy::new(|| format!("kiro-relay/{}", env!("CARGO_PKG_VERSION")));

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_HOST: &str = "127.0.0.1";

// Directory under $HOME holding the persisted config document.
pub const CONFIG_DIR_NAME: &str = ".kiro-proxy";
pub const CONFIG_FILE_NAME: &str = "config.json";
pub const CONFIG_SCHEMA_VERSION: u32 = 2;

pub const DEFAULT_REGION: &str = "us-east-1";

// Account lifecycle timings.
pub const COOLDOWN_SECS: i64 = 300;
pub const SESSION_IDLE_TTL_SECS: u64 = 60;
pub const SESSION_PRUNE_INTERVAL_SECS: u64 = 30;
pub const REFRESH_TICK_SECS: u64 = 300;
pub const REFRESH_BEFORE_EXPIRY_SECS: i64 = 900;
pub const FLOW_EVICT_INTERVAL_SECS: u64 = 60;
pub const FLOW_RING_CAPACITY: usize = 500;
pub const FLOW_MAX_AGE_SECS: i64 = 86_400;

// Per-request bounds.
pub const DEFAULT_REQUEST_DEADLINE_SECS: u64 = 120;
pub const FIRST_CHUNK_TIMEOUT_SECS: u64 = 60;
pub const MAX_SELECTION_ATTEMPTS: usize = 3;

// Tool surface limits.
pub const MAX_TOOLS_PER_REQUEST: usize = 50;
pub const MAX_TOOL_DESCRIPTION_CHARS: usize = 500;
pub const WEB_SEARCH_TOOL_NAME: &str = "web_search";

// Model summarization calls are routed to.
pub const SUMMARY_MODEL: &str = "claude-haiku-4.5";
