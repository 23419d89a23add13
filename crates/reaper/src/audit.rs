//! Append-only audit log of removed containers.
//!
//! Each successful removal produces exactly one line:
//!
//! ```text
//! 2024-05-01T12:00:00+02:00 3f2a9c0d1e4b 75.25 minutes
//! ```

use std::fmt::Display;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};

use camino::Utf8Path;
use chrono::{DateTime, SecondsFormat, TimeZone};
use color_eyre::eyre::Context;
use color_eyre::Result;

/// Sink for removal records.
#[derive(Debug)]
pub struct AuditLog<W: Write> {
    writer: W,
}

impl AuditLog<File> {
    /// Open the audit log at `path` for appending, creating the file and
    /// any missing parent directories.
    pub fn open(path: &Utf8Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_str().is_empty()) {
            create_dir_all(parent)
                .wrap_err_with(|| format!("Failed to create log file directory {parent}"))?;
        }

        let mut opts = OpenOptions::new();
        opts.append(true).create(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            opts.mode(0o644);
        }
        let file = opts
            .open(path)
            .wrap_err_with(|| format!("Failed to open log file {path}"))?;
        tracing::debug!("Opened audit log {path}");
        Ok(Self::new(file))
    }
}

fn create_dir_all(dir: &Utf8Path) -> io::Result<()> {
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o755);
    }
    builder.create(dir)
}

impl<W: Write> AuditLog<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Append the record for one removed container.
    ///
    /// The timestamp is rendered at whole-second precision in the offset of
    /// `now`, with `Z` for UTC.
    pub fn record<Tz>(&mut self, now: &DateTime<Tz>, id: &str, age_minutes: f64) -> io::Result<()>
    where
        Tz: TimeZone,
        Tz::Offset: Display,
    {
        let line = format_record(now, id, age_minutes);
        self.writer.write_all(line.as_bytes())?;
        self.writer.flush()
    }

    #[cfg(test)]
    pub(crate) fn into_inner(self) -> W {
        self.writer
    }
}

fn format_record<Tz>(now: &DateTime<Tz>, id: &str, age_minutes: f64) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    format!(
        "{} {} {:.2} minutes\n",
        now.to_rfc3339_opts(SecondsFormat::Secs, true),
        id,
        age_minutes
    )
}
