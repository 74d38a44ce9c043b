use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Time boundary for time-based rotation (UTC)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rollover {
    Hourly,
    Daily,
}

impl Rollover {
    fn period(&self) -> TimeDelta {
        match self {
            Rollover::Hourly => TimeDelta::hours(1),
            Rollover::Daily => TimeDelta::days(1),
        }
    }

    /// First boundary strictly after `now`
    pub fn next_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let period = self.period();
        let start = now.duration_trunc(period).unwrap_or(now);
        start + period
    }
}

/// How the session log is rotated. Size and time rotation are mutually
/// exclusive; both keep numbered backups `session.log.1 ..= session.log.N`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RotationPolicy {
    Off,
    Size { max_bytes: u64, backup_count: u32 },
    Time { every: Rollover, backup_count: u32 },
}

impl Default for RotationPolicy {
    fn default() -> Self {
        RotationPolicy::Size {
            max_bytes: 5 * 1024 * 1024,
            backup_count: 3,
        }
    }
}

/// Append-only log file with rotation
pub struct RotatingFile {
    path: PathBuf,
    policy: RotationPolicy,
    writer: BufWriter<File>,
    written: u64,
    next_rollover: Option<DateTime<Utc>>,
}

impl RotatingFile {
    pub fn open(path: impl AsRef<Path>, policy: RotationPolicy, now: DateTime<Utc>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let written = file.metadata()?.len();
        let next_rollover = match &policy {
            RotationPolicy::Time { every, .. } => Some(every.next_after(now)),
            _ => None,
        };

        Ok(Self {
            path,
            policy,
            writer: BufWriter::new(file),
            written,
            next_rollover,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one line, rotating first if the policy says so
    pub fn write_line(&mut self, line: &str, now: DateTime<Utc>) -> io::Result<()> {
        let len = line.len() as u64 + 1;
        if self.should_rotate(len, now) {
            self.rotate()?;
            if let RotationPolicy::Time { every, .. } = &self.policy {
                self.next_rollover = Some(every.next_after(now));
            }
        }

        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.written += len;
        Ok(())
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }

    fn should_rotate(&self, incoming: u64, now: DateTime<Utc>) -> bool {
        match &self.policy {
            RotationPolicy::Off => false,
            RotationPolicy::Size { max_bytes, .. } => {
                *max_bytes > 0 && self.written > 0 && self.written + incoming > *max_bytes
            }
            RotationPolicy::Time { .. } => self
                .next_rollover
                .map(|boundary| now >= boundary)
                .unwrap_or(false),
        }
    }

    fn backup_count(&self) -> u32 {
        match &self.policy {
            RotationPolicy::Off => 0,
            RotationPolicy::Size { backup_count, .. } | RotationPolicy::Time { backup_count, .. } => {
                *backup_count
            }
        }
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        let keep = self.backup_count();

        if keep > 0 {
            let oldest = backup_path(&self.path, keep);
            if oldest.exists() {
                fs::remove_file(&oldest)?;
            }
            for i in (1..keep).rev() {
                let from = backup_path(&self.path, i);
                if from.exists() {
                    fs::rename(&from, backup_path(&self.path, i + 1))?;
                }
            }
            fs::rename(&self.path, backup_path(&self.path, 1))?;
        }

        // Without backups the current file is simply truncated
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.written = 0;
        Ok(())
    }
}

impl Drop for RotatingFile {
    fn drop(&mut self) {
        let _ = self.writer.flush();
    }
}

/// `session.log` -> `session.log.<n>`
pub fn backup_path(path: &Path, n: u32) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".{n}"));
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    #[test]
    fn size_rotation_keeps_numbered_backups() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("session.log");
        let now = Utc::now();
        let mut file = RotatingFile::open(
            &path,
            RotationPolicy::Size {
                max_bytes: 20,
                backup_count: 2,
            },
            now,
        )
        .unwrap();

        for i in 0..5 {
            file.write_line(&format!("line-{i:012}"), now).unwrap();
        }
        file.flush().unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "line-000000000004\n");
        assert_eq!(
            fs::read_to_string(backup_path(&path, 1)).unwrap(),
            "line-000000000003\n"
        );
        assert_eq!(
            fs::read_to_string(backup_path(&path, 2)).unwrap(),
            "line-000000000002\n"
        );
        assert!(!backup_path(&path, 3).exists());
    }

    #[test]
    fn time_rotation_rolls_at_day_boundary() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("session.log");
        let day1 = Utc.with_ymd_and_hms(2026, 3, 1, 23, 59, 0).unwrap();
        let day2 = Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 1).unwrap();

        let mut file = RotatingFile::open(
            &path,
            RotationPolicy::Time {
                every: Rollover::Daily,
                backup_count: 1,
            },
            day1,
        )
        .unwrap();
        file.write_line("before midnight", day1).unwrap();
        file.write_line("still before", day1).unwrap();
        file.write_line("after midnight", day2).unwrap();
        file.flush().unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "after midnight\n");
        assert_eq!(
            fs::read_to_string(backup_path(&path, 1)).unwrap(),
            "before midnight\nstill before\n"
        );
    }

    #[test]
    fn rotation_off_never_rotates() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("session.log");
        let now = Utc::now();
        let mut file = RotatingFile::open(&path, RotationPolicy::Off, now).unwrap();
        for _ in 0..100 {
            file.write_line("0123456789", now).unwrap();
        }
        file.flush().unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), 1100);
        assert!(!backup_path(&path, 1).exists());
    }

    #[test]
    fn hourly_boundary_is_next_full_hour() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 10, 15, 30).unwrap();
        assert_eq!(
            Rollover::Hourly.next_after(now),
            Utc.with_ymd_and_hms(2026, 3, 1, 11, 0, 0).unwrap()
        );
    }
}
