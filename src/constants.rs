//! Protocol constants and configuration values

/// Default Asterisk manager port
pub const DEFAULT_AMI_PORT: u16 = 5038;

/// Socket buffer size for reading from TCP stream (64KB) - standard TCP receive window
pub const SOCKET_BUF_SIZE: usize = 65536;

/// Maximum buffered bytes without a line terminator (1MB).
/// AMI lines are short; a line this long means the stream is not AMI.
pub const MAX_LINE_SIZE: usize = 1024 * 1024;

/// Maximum total buffer size (16MB) - safety limit to prevent runaway memory
pub const MAX_BUFFER_SIZE: usize = 16 * 1024 * 1024;

/// Protocol line terminator
pub const LINE_TERMINATOR: &str = "\r\n";

/// Separator between a header name and its value
pub const HEADER_SEPARATOR: &str = ": ";

/// Prefix of the banner line sent by Asterisk on connect
pub const BANNER_PREFIX: &str = "Asterisk Call Manager";

/// Connection timeout in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 2000;

/// Default action response timeout in milliseconds (5 seconds)
pub const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 5000;

/// Default delay between reconnect attempts in milliseconds
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 1000;

/// Maximum number of queued events before dropping
pub const MAX_EVENT_QUEUE_SIZE: usize = 1000;

/// Prefix for generated `ActionID` values
pub const DEFAULT_ACTION_ID_PREFIX: &str = "ami";
