// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Logger setup for the command-line tool

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Local};
use slog::{Drain, Level, Logger};
use slog_async::AsyncGuard;
use slog_term::{FullFormat, PlainSyncDecorator, TermDecorator};

/// Name of the log file for a run started at `now`.
pub fn log_file_name(now: DateTime<Local>) -> String {
    format!("edge-provision-{}.log", now.format("%Y%m%d-%H%M%S"))
}

/// Builds a logger writing to the terminal and to a new timestamped file
/// in `log_dir`.
///
/// The file gets everything at debug and above; the terminal gets info and
/// above, or debug with `verbose`. Keep the guard alive until the end of
/// `main` so that buffered records reach the file.
pub fn init(
    log_dir: &Utf8Path,
    verbose: bool,
) -> std::io::Result<(Logger, AsyncGuard, Utf8PathBuf)> {
    fs_err::create_dir_all(log_dir)?;
    let path = log_dir.join(log_file_name(Local::now()));
    let file = fs_err::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&path)?;

    let file_drain = FullFormat::new(PlainSyncDecorator::new(file))
        .build()
        .filter_level(Level::Debug)
        .fuse();

    let term_level = if verbose { Level::Debug } else { Level::Info };
    let term_drain = FullFormat::new(TermDecorator::new().build())
        .build()
        .filter_level(term_level)
        .fuse();

    let drain = slog::Duplicate::new(file_drain, term_drain).fuse();
    let (drain, guard) = slog_async::Async::new(drain).build_with_guard();
    let log = Logger::root(drain.fuse(), slog::o!());
    Ok((log, guard, path))
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn file_name_is_timestamped() {
        let now = Local.with_ymd_and_hms(2026, 3, 7, 14, 5, 9).unwrap();
        assert_eq!(log_file_name(now), "edge-provision-20260307-140509.log");
    }

    #[test]
    fn log_file_is_created_before_anything_is_logged() {
        let dir = camino_tempfile::tempdir().unwrap();
        let log_dir = dir.path().join("logs");
        let (log, guard, path) = init(&log_dir, false).unwrap();
        assert!(path.exists());
        assert!(path.starts_with(&log_dir));

        slog::info!(log, "hello"; "key" => "value");
        drop(log);
        drop(guard);
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("hello"), "{contents}");
    }
}
