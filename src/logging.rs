use std::{
    fs::{File, OpenOptions},
    io::Write,
    path::Path,
    sync::Mutex,
};

use anyhow::{Context, Error};
use chrono::Utc;
use log::{LevelFilter, Log, Metadata, Record};
use serde::Serialize;

/// Fans every record out to the terminal logger and the file log.
///
/// The terminal honors the user-selected verbosity; the file always records
/// everything down to trace, which is where external command invocations and
/// their output land.
struct MultiLogger {
    loggers: Vec<Box<dyn Log>>,
}

impl Log for MultiLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.loggers.iter().any(|logger| logger.enabled(metadata))
    }

    fn log(&self, record: &Record) {
        for logger in &self.loggers {
            if logger.enabled(record.metadata()) {
                logger.log(record);
            }
        }
    }

    fn flush(&self) {
        for logger in &self.loggers {
            logger.flush();
        }
    }
}

#[derive(Serialize)]
struct LogEntry<'a> {
    timestamp: String,
    level: &'a str,
    target: &'a str,
    message: String,
}

/// Append-only JSON-lines log file. Write failures are swallowed; logging
/// must never take down the operation it describes.
struct FileLog {
    file: Mutex<File>,
}

impl Log for FileLog {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        let entry = LogEntry {
            timestamp: Utc::now().to_rfc3339(),
            level: record.level().as_str(),
            target: record.target(),
            message: record.args().to_string(),
        };

        if let Ok(line) = serde_json::to_string(&entry) {
            if let Ok(mut file) = self.file.lock() {
                let _ = writeln!(file, "{line}");
            }
        }
    }

    fn flush(&self) {
        if let Ok(mut file) = self.file.lock() {
            let _ = file.flush();
        }
    }
}

/// Installs the global logger: env_logger formatting on the terminal at
/// `terminal_level`, plus a trace-level JSON-lines file at `log_file`.
pub fn init(terminal_level: LevelFilter, log_file: &Path) -> Result<(), Error> {
    let terminal = env_logger::Builder::new()
        .filter_level(terminal_level)
        .build();

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)
        .context(format!(
            "Failed to open log file '{}'",
            log_file.display()
        ))?;

    let multi = MultiLogger {
        loggers: vec![
            Box::new(terminal),
            Box::new(FileLog {
                file: Mutex::new(file),
            }),
        ],
    };

    log::set_boxed_logger(Box::new(multi)).context("Failed to install the logger")?;
    log::set_max_level(LevelFilter::Trace);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_entry_shape() {
        let entry = LogEntry {
            timestamp: "2026-08-26T12:00:00+00:00".into(),
            level: "INFO",
            target: "blockclone::clone",
            message: "Cloned 3/3 partitions".into(),
        };
        let line = serde_json::to_string(&entry).unwrap();
        assert_eq!(
            line,
            r#"{"timestamp":"2026-08-26T12:00:00+00:00","level":"INFO","target":"blockclone::clone","message":"Cloned 3/3 partitions"}"#
        );
    }

    #[test]
    fn test_file_log_appends_lines() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let log = FileLog {
            file: Mutex::new(tmp.reopen().unwrap()),
        };

        log.log(
            &Record::builder()
                .args(format_args!("first"))
                .level(log::Level::Debug)
                .target("test")
                .build(),
        );
        log.log(
            &Record::builder()
                .args(format_args!("second"))
                .level(log::Level::Warn)
                .target("test")
                .build(),
        );
        log.flush();

        let contents = std::fs::read_to_string(tmp.path()).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains(r#""message":"first""#));
        assert!(lines[1].contains(r#""level":"WARN""#));
    }
}
