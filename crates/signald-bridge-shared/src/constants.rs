/// Prefix tagging public group identifiers in the HTTP contract
pub const GROUP_PREFIX: &str = "group.";

/// API versions advertised by `/v1/about`
pub const SUPPORTED_API_VERSIONS: [&str; 2] = ["v1", "v2"];

/// Internal build counter advertised by `/v1/about`
pub const BUILD_NR: u32 = 2;

/// Default location of the signald control socket
pub const DEFAULT_SOCKET_PATH: &str = "/var/run/signald/signald.sock";

/// Default directory for materialized attachments
pub const DEFAULT_ATTACHMENT_DIR: &str = "/tmp/";

/// File name prefix for materialized attachments
pub const ATTACHMENT_FILE_PREFIX: &str = "signald-bridge-";

/// Side length in pixels of the linking QR code
pub const QR_CODE_SIZE: u32 = 256;

/// Default HTTP API port
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// Depth of the per-connection command queue
pub const COMMAND_QUEUE_DEPTH: usize = 256;
