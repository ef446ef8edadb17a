//! Centralized constants for permissions, paths, and limits.

/// Default vault root directory.
pub const DEFAULT_VAULT_ROOT: &str = "/var/lib/fleet-vault";

/// Environment variable overriding the vault root.
pub const ROOT_ENV_VAR: &str = "FLEET_VAULT_ROOT";

/// Environment variable carrying the tracing filter.
pub const LOG_ENV_VAR: &str = "FLEET_VAULT_LOG";

/// Config file name inside the vault root.
pub const CONFIG_FILE: &str = "fleet-vault.toml";

/// Default master key file name inside the vault root.
pub const MASTER_KEY_FILE: &str = "master.key";

/// Permission mode for the entry/pointer directory.
pub const VAULT_DIR_MODE: u32 = 0o700;

/// Permission mode for the lock directory.
pub const LOCKS_DIR_MODE: u32 = 0o700;

/// Permission mode for entries, pointers, the master key and the registry.
pub const SECRET_FILE_MODE: u32 = 0o600;

/// Permission mode for the audit log.
pub const AUDIT_LOG_MODE: u32 = 0o640;

/// File extension for encrypted vault entries.
pub const ENTRY_EXTENSION: &str = ".vault";

/// Suffix of the live pointer record.
pub const CURRENT_SUFFIX: &str = "_current";

/// Suffix of a pointer whose server was removed from the registry.
pub const ORPHANED_SUFFIX: &str = "_orphaned";

/// chrono format of a version id. Fixed width, lexicographic = chronological.
pub const VERSION_FORMAT: &str = "%Y%m%dT%H%M%S%9fZ";

/// Maximum generated secret length.
pub const MAX_SECRET_LENGTH: usize = 4096;

/// Maximum size of a caller-supplied secret in bytes (1 MiB).
pub const MAX_SECRET_SIZE: usize = 1_048_576;

/// Default symbol alphabet for generated secrets.
pub const DEFAULT_SYMBOLS: &str = "!@#$%^&*()_+-=[]{}|;:,.<>?";

/// Ports tried when `ping` is unavailable.
pub const FALLBACK_PROBE_PORTS: &[u16] = &[22, 80, 443];

/// Remote command used to sample CPU, memory and disk usage.
pub const RESOURCE_SNAPSHOT_COMMAND: &str =
    "nproc; cat /proc/loadavg; grep -E '^(MemTotal|MemAvailable):' /proc/meminfo; df -P /";

/// Bound for removing a remote temporary script.
pub const CLEANUP_TIMEOUT_SECS: u64 = 10;

/// Tag used when forwarding audit lines to journald.
pub const JOURNALD_TAG: &str = "fleet-vault";

/// Upper bound for one provisioning retry delay.
pub const MAX_RETRY_BACKOFF_MS: u64 = 30_000;
