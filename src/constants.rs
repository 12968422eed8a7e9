use std::time::Duration;

pub const DEFAULT_TIME_MS: u64 = 2000;
pub const DEFAULT_MEMORY_BYTES: u64 = 256 * 1024 * 1024;
pub const DEFAULT_OUTPUT_BYTES: u64 = 64 * 1024 * 1024;
/// Upper bound on captured bytes per pipe, with or without an output limit.
pub const CAPTURE_CEILING_BYTES: u64 = 256 * 1024 * 1024;

pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_millis(10);
/// How long to wait for output pipes to close once the process group is dead.
pub const PIPE_DRAIN_GRACE: Duration = Duration::from_millis(250);

pub const DEFAULT_CONFIG_FILE: &str = "judge.yaml";

pub const VERDICT_TX_ERR: &str = "verdict receiver dropped";
