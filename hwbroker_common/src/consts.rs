//! System-wide constants.

/// Canonical broker service name (used for logging and the default socket).
pub const BROKER_SERVICE_NAME: &str = "hwbroker";

/// Default configuration file path.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/hwbroker/broker.toml";

/// Default listening socket.
pub const DEFAULT_SOCKET_PATH: &str = "/run/hwbroker.sock";

/// Default directory scanned for board descriptors.
pub const DEFAULT_BOARD_DIR: &str = "/etc/hwbroker/boards";

/// Device-tree model string of the running board.
pub const DEFAULT_MODEL_PATH: &str = "/proc/device-tree/model";

/// Privilege token checked at acquisition.
pub const DEFAULT_PRIVILEGE: &str = "hwbroker.peripheral-io";

/// Policy decision cache capacity.
pub const DEFAULT_POLICY_CACHE_CAPACITY: usize = 100;

/// GPIO value node readiness: number of polls after export.
pub const DEFAULT_GPIO_READY_ATTEMPTS: u32 = 10;

/// GPIO value node readiness: interval between polls in milliseconds.
pub const DEFAULT_GPIO_READY_INTERVAL_MS: u64 = 100;

/// Maximum numeric arguments encoded in a descriptor key.
pub const MAX_CATALOG_ARGS: usize = 2;

/// Maximum header pins per descriptor entry.
pub const MAX_CATALOG_PINS: usize = 4;

/// Maximum payload accepted for a single read/write/transfer request.
pub const MAX_TRANSFER_LEN: usize = 4096;

/// Maximum length of one request line on the wire.
pub const MAX_REQUEST_LINE: usize = 64 * 1024;
