//! Client configuration constants.
//!
//! Centralizes hardcoded values for easier configuration and documentation.

use std::time::Duration;

/// Buffered session events per subscriber before it starts lagging.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Buffered commands from handles before `send` waits.
pub const DEFAULT_COMMAND_CAPACITY: usize = 64;

/// Push events the in-memory server buffers per subscriber.
pub const PUSH_CHANNEL_CAPACITY: usize = 1024;

/// Directory under the user's config dir.
pub const CONFIG_DIR_NAME: &str = "kaisha";

/// Session config file inside [`CONFIG_DIR_NAME`].
pub const CONFIG_FILE_NAME: &str = "session.ron";

/// Upper bound for a configured round-trip timeout. Anything longer is
/// clamped; a caller that wants no timeout leaves it unset.
pub const MAX_ROUND_TRIP_TIMEOUT: Duration = Duration::from_secs(300);
