//! Log re-piping after a restore.
//!
//! Checkpointing a container severs the fifos the orchestrator set up for
//! its stdio, and nothing upstream will re-open them. After a restore the
//! shim tails the container's stdout and stderr fifos itself and appends to
//! the CRI log file, one writer shared by both streams so lines are never
//! interleaved mid-record.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;

use chrono::Utc;

use crate::process::Stdio;

/// Writer shared between the stdout and stderr tails. Every write takes the
/// lock for a whole line.
#[derive(Clone)]
pub struct SerialWriter {
    file: Arc<Mutex<File>>,
}

impl SerialWriter {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Arc::new(Mutex::new(file)),
        })
    }

    fn write_entry(&self, stream: &str, line: &str) -> std::io::Result<()> {
        let mut file = self.file.lock().unwrap();
        // CRI log format: timestamp, stream, full/partial tag, content
        writeln!(file, "{} {} F {}", Utc::now().to_rfc3339(), stream, line)?;
        file.flush()
    }
}

/// Tails the stdio fifos of a restored container into the log file.
pub struct Repiper {
    threads: Vec<thread::JoinHandle<()>>,
}

impl Repiper {
    /// Starts one tail per stream. stdout and stderr are routed
    /// independently, each from its own fifo path. With no log path the
    /// output is drained and discarded so the fifos do not block the
    /// restored process.
    pub fn spawn(stdio: &Stdio, log_path: Option<&Path>) -> std::io::Result<Self> {
        let writer = match log_path {
            Some(path) => Some(SerialWriter::open(path)?),
            None => None,
        };

        let mut threads = Vec::new();
        for (stream, path) in [("stdout", &stdio.stdout), ("stderr", &stdio.stderr)] {
            if path.is_empty() {
                continue;
            }
            let path = PathBuf::from(path);
            let writer = writer.clone();
            let handle = thread::Builder::new()
                .name(format!("repipe-{stream}"))
                .spawn(move || {
                    if let Err(err) = tail(&path, stream, writer) {
                        tracing::warn!(?path, stream, %err, "log repipe ended");
                    }
                })?;
            threads.push(handle);
        }
        Ok(Self { threads })
    }

    /// Blocks until both streams hit EOF, i.e. the container closed its
    /// ends of the fifos.
    pub fn wait(self) {
        for handle in self.threads {
            let _ = handle.join();
        }
    }
}

fn tail(path: &Path, stream: &str, writer: Option<SerialWriter>) -> std::io::Result<()> {
    // opening a fifo read-only blocks until the writer side appears, which
    // is exactly the restored process coming up
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    for line in reader.lines() {
        let line = line?;
        match &writer {
            Some(writer) => writer.write_entry(stream, &line)?,
            None => tracing::trace!(stream, line, "discarding container output"),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn test_streams_are_tagged_and_serialized() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let stdout = dir.path().join("stdout");
        let stderr = dir.path().join("stderr");
        let log = dir.path().join("0.log");
        // plain files work in place of fifos for the tail logic
        std::fs::write(&stdout, "hello\nworld\n")?;
        std::fs::write(&stderr, "oops\n")?;

        let stdio = Stdio {
            stdout: stdout.to_string_lossy().to_string(),
            stderr: stderr.to_string_lossy().to_string(),
            ..Default::default()
        };
        Repiper::spawn(&stdio, Some(&log))?.wait();

        let mut content = String::new();
        File::open(&log)?.read_to_string(&mut content)?;
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(content.matches(" stdout F ").count(), 2);
        assert_eq!(content.matches(" stderr F ").count(), 1);
        assert!(content.contains("hello"));
        assert!(content.contains("oops"));
        Ok(())
    }

    #[test]
    fn test_missing_log_path_discards() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let stdout = dir.path().join("stdout");
        std::fs::write(&stdout, "dropped\n")?;
        let stdio = Stdio {
            stdout: stdout.to_string_lossy().to_string(),
            ..Default::default()
        };
        Repiper::spawn(&stdio, None)?.wait();
        Ok(())
    }
}
