//! `env_logger` setup teeing timestamped records into the `LOGS` directory and the console.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use colored::Colorize;
use env_logger::{Builder, Env, Target, WriteStyle};
use log::{Level, LevelFilter};

use crate::error::{EseError, IoResultExt, Result};

pub const STDOUT_LOG: &str = "Ese.stdout";
pub const STDERR_LOG: &str = "Ese.stderr";

const TIMESTAMP_FORMAT: &str = "%m/%d %H:%M:%S";

/// Pipe target of the logger. Every record is appended to [`STDOUT_LOG`],
/// errors also to [`STDERR_LOG`].
pub struct LogTee {
    stdout: File,
    stderr: File,
    console: bool,
}

impl LogTee {
    /// Opens (appending) the log files inside `log_dir`.
    pub fn open(log_dir: impl AsRef<Path>, console: bool) -> Result<Self> {
        let log_dir = log_dir.as_ref();
        Ok(Self {
            stdout: open_log(log_dir.join(STDOUT_LOG))?,
            stderr: open_log(log_dir.join(STDERR_LOG))?,
            console,
        })
    }
}

fn open_log(path: PathBuf) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .at(&path)
}

/// Level of a formatted record: the token after the two timestamp fields.
fn record_level(line: &str) -> Option<Level> {
    line.split_whitespace().nth(2)?.parse().ok()
}

fn echo(level: Option<Level>, line: &str) {
    match level {
        Some(Level::Error) => eprintln!("{}", line.red().bold()),
        Some(Level::Warn) => eprintln!("{}", line.yellow()),
        Some(Level::Debug | Level::Trace) => println!("{}", line.truecolor(120, 120, 120)),
        Some(Level::Info) | None => println!("{line}"),
    }
}

impl Write for LogTee {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stdout.write_all(buf)?;
        let text = String::from_utf8_lossy(buf);
        let level = record_level(&text);
        if level == Some(Level::Error) {
            self.stderr.write_all(buf)?;
        }
        if self.console {
            for line in text.lines() {
                echo(level, line);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stdout.flush()?;
        self.stderr.flush()
    }
}

fn configure(builder: &mut Builder, tee: LogTee) -> &mut Builder {
    builder
        .format(|buf, record| {
            writeln!(
                buf,
                "{} {:<5} {}",
                chrono::Local::now().format(TIMESTAMP_FORMAT),
                record.level(),
                record.args()
            )
        })
        .write_style(WriteStyle::Never)
        .target(Target::Pipe(Box::new(tee)))
}

/// Installs the global logger writing into `log_dir`. `RUST_LOG` overrides `level`.
pub fn init(log_dir: impl AsRef<Path>, level: LevelFilter) -> Result<()> {
    let tee = LogTee::open(log_dir, true)?;
    let mut builder = Builder::from_env(Env::default().default_filter_or(level.as_str()));
    configure(&mut builder, tee)
        .try_init()
        .map_err(|e| EseError::InvalidArgument(format!("cannot install logger: {e}")))
}

#[cfg(test)]
mod tests {
    use std::fs;

    use log::{Log, Record};

    use super::*;

    #[test]
    fn test_errors_go_to_both_logs() {
        let dir = tempfile::tempdir().unwrap();
        let tee = LogTee::open(dir.path(), false).unwrap();
        let mut builder = Builder::new();
        builder.filter_level(LevelFilter::Info);
        let logger = configure(&mut builder, tee).build();

        logger.log(
            &Record::builder()
                .level(Level::Info)
                .args(format_args!("staging TC1"))
                .build(),
        );
        logger.log(
            &Record::builder()
                .level(Level::Error)
                .args(format_args!("missing sidecar"))
                .build(),
        );
        logger.log(
            &Record::builder()
                .level(Level::Debug)
                .args(format_args!("filtered"))
                .build(),
        );
        logger.flush();

        let stdout = fs::read_to_string(dir.path().join(STDOUT_LOG)).unwrap();
        let stderr = fs::read_to_string(dir.path().join(STDERR_LOG)).unwrap();
        assert_eq!(stdout.lines().count(), 2);
        assert!(stdout.contains("INFO  staging TC1"));
        assert!(!stdout.contains("filtered"));
        assert_eq!(stderr.lines().count(), 1);
        assert!(stderr.contains("ERROR missing sidecar"));
    }

    #[test]
    fn test_record_level() {
        assert_eq!(record_level("10/19 09:30:00 WARN  no netlist"), Some(Level::Warn));
        assert_eq!(record_level("10/19 09:30:00 ERROR tool failed"), Some(Level::Error));
        assert_eq!(record_level("continuation"), None);
    }
}
