// src/constants.rs

/// The well-known rendezvous point of the daemon's listening socket.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/kshell-unix-socket";

/// Environment variable the client reads to override the socket path.
pub const SOCKET_ENV_VAR: &str = "KSHELL_SOCKET";

/// The name of the directory (inside the system config dir) holding kshell files.
pub const CONFIG_DIR_NAME: &str = "kshell";

/// The name of the daemon configuration file (inside the kshell config dir).
pub const DAEMON_CONFIG_FILENAME: &str = "kshelld.toml";

/// The name of the default command tree file (inside the kshell config dir).
pub const SCHEME_FILENAME: &str = "scheme.toml";

/// The view a new session starts in when neither the scheme nor the config names one.
pub const DEFAULT_START_ENTRY: &str = "main";

/// The shell used by the `script` handler.
pub const DEFAULT_SHELL: &str = "/bin/sh";

/// Prefix of the environment variables the `script` handler exports for parameters.
pub const PARAM_ENV_PREFIX: &str = "KSHELL_PARAM_";

/// Return code reported when the executor itself fails (unresolved symbol,
/// spawn failure, lock failure). Handlers never produce it on purpose.
pub const EXEC_FAILURE_RETCODE: i32 = -1;

/// Return code reported for a canceled pipeline, the shell convention for SIGINT.
pub const CANCELED_RETCODE: i32 = 130;

/// Default upper bound for a single frame payload (16 MiB).
pub const DEFAULT_MAX_PAYLOAD: u32 = 16 * 1024 * 1024;

/// Default number of action child tasks allowed to run at the same time.
pub const DEFAULT_MAX_CHILDREN: usize = 64;

/// Default time to wait for a named lock before giving up.
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 10_000;

/// Default grace period for draining pipeline output after the last stage ends.
pub const DEFAULT_DRAIN_TIMEOUT_MS: u64 = 200;

/// First four bytes of every frame header ("KSH1").
pub const PROTOCOL_MAGIC: u32 = 0x4B53_4831;

/// Protocol version spoken by this build. Peers must agree on the major part.
pub const PROTOCOL_MAJOR: u8 = 1;
pub const PROTOCOL_MINOR: u8 = 0;

/// Prompt used when the current view defines no prompt actions.
pub const DEFAULT_PROMPT: &str = "> ";
