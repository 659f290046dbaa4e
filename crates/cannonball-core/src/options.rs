//! Plugin option parsing.
//!
//! The host hands the plugin its options as a list of `key=value`
//! strings (already split on commas).  Unknown keys are logged and
//! skipped so a newer launcher can pass options an older plugin does
//! not know about; malformed values are hard errors.

use log::{error, warn};

use cannonball_wire::EventFlags;

use crate::error::CoreError;

/// Default consumer socket path.
pub const DEFAULT_SOCK_PATH: &str = "/dev/shm/cannonball.sock";

/// Default log level (info).
pub const DEFAULT_LOG_LEVEL: i64 = 3;

const TRUE_LITERALS: [&str; 4] = ["true", "yes", "1", "on"];
const FALSE_LITERALS: [&str; 4] = ["false", "no", "0", "off"];

/// Parsed plugin options.
#[derive(Debug, Clone)]
pub struct Options {
    /// Log destination; `-` means stderr.
    pub log_file: String,
    /// Log level, 0 (off) through 4 (debug).
    pub log_level: i64,
    /// Path of the consumer's listening socket.
    pub sock_path: String,
    pub trace_pc: bool,
    pub trace_reads: bool,
    pub trace_writes: bool,
    pub trace_syscalls: bool,
    pub trace_instrs: bool,
    pub trace_branches: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            log_file: "-".to_string(),
            log_level: DEFAULT_LOG_LEVEL,
            sock_path: DEFAULT_SOCK_PATH.to_string(),
            trace_pc: false,
            trace_reads: false,
            trace_writes: false,
            trace_syscalls: false,
            trace_instrs: false,
            trace_branches: false,
        }
    }
}

impl Options {
    /// Parse the host-provided option strings over the defaults.
    pub fn parse<S: AsRef<str>>(args: &[S]) -> Result<Self, CoreError> {
        let mut options = Options::default();

        for arg in args {
            let arg = arg.as_ref();
            let (key, value) = match arg.split_once('=') {
                Some(split) => split,
                None if arg == "help" => {
                    print!("{}", Self::usage());
                    return Err(CoreError::HelpRequested);
                }
                None => {
                    error!("Failed to parse option (expected key=value): {}", arg);
                    continue;
                }
            };

            match key {
                "help" => {
                    print!("{}", Self::usage());
                    return Err(CoreError::HelpRequested);
                }
                "log_file" => options.log_file = value.to_string(),
                "log_level" => {
                    options.log_level = value.parse::<i64>().map_err(|_| {
                        CoreError::Argument(format!("Invalid log level: {}", value))
                    })?;
                }
                "sock_path" => options.sock_path = value.to_string(),
                "trace_pc" => options.trace_pc = parse_bool(value)?,
                "trace_reads" => options.trace_reads = parse_bool(value)?,
                "trace_writes" => options.trace_writes = parse_bool(value)?,
                "trace_syscalls" => options.trace_syscalls = parse_bool(value)?,
                "trace_instrs" => options.trace_instrs = parse_bool(value)?,
                "trace_branches" => options.trace_branches = parse_bool(value)?,
                _ => warn!("Ignoring unknown option: {}", key),
            }
        }

        Ok(options)
    }

    /// Fold the per-class switches into the request mask.  Reads and
    /// writes share the `READS_WRITES` bit.
    pub fn request_flags(&self) -> EventFlags {
        EventFlags::from_requests(
            self.trace_pc,
            self.trace_reads || self.trace_writes,
            self.trace_instrs,
            self.trace_syscalls,
            self.trace_branches,
        )
    }

    /// Usage text for the `help` option.
    pub fn usage() -> String {
        let mut usage = String::new();
        let rows: [(&str, &str, &str); 10] = [
            ("help", "<flag   >", "Print this help message"),
            (
                "log_file",
                "<string >",
                "Path to log file. '-' is interpreted as stderr. (default: -)",
            ),
            (
                "log_level",
                "<integer>",
                "Log level (0 = Off, 1 = Error, 2 = Warn, 3 = Info, 4 = Debug) (default: 3)",
            ),
            (
                "sock_path",
                "<string >",
                "Path to socket file to connect to consumer. (default: /dev/shm/cannonball.sock)",
            ),
            ("trace_pc", "<boolean>", "Enable program counter tracing."),
            ("trace_reads", "<boolean>", "Enable memory read tracing."),
            ("trace_writes", "<boolean>", "Enable memory write tracing."),
            ("trace_syscalls", "<boolean>", "Enable syscall tracing."),
            (
                "trace_instrs",
                "<boolean>",
                "Enable instruction contents tracing.",
            ),
            ("trace_branches", "<boolean>", "Enable branch tracing."),
        ];
        for (name, kind, help) in rows {
            usage.push_str(&format!("{:>16}={} {}\n", name, kind, help));
        }
        usage
    }
}

fn parse_bool(value: &str) -> Result<bool, CoreError> {
    if TRUE_LITERALS.contains(&value) {
        Ok(true)
    } else if FALSE_LITERALS.contains(&value) {
        Ok(false)
    } else {
        Err(CoreError::Argument(format!(
            "Invalid boolean value: {}",
            value
        )))
    }
}
