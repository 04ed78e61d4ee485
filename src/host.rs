//! I/O seam between the engine and the outside world.
//!
//! The engine never touches stdin, stdout or the filesystem directly; every
//! `print`, `read`, `read_file`, `write_file` and `time` goes through a [`Host`].
//! [`StdHost`] is the process-backed implementation used by the `svm` binary;
//! [`CaptureHost`] keeps everything in memory for tests and embedders.

use std::collections::{HashMap, VecDeque};
use std::io::{BufRead, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::Fault;

pub trait Host {
    /// Write `text`, followed by a newline when `newline` is set
    fn print(&mut self, text: &str, newline: bool) -> Result<(), Fault>;

    /// Read one line without its terminator; `None` at end of input
    fn read_line(&mut self) -> Result<Option<String>, Fault>;

    fn read_file(&mut self, path: &str) -> Result<String, Fault>;

    fn write_file(&mut self, path: &str, contents: &str) -> Result<(), Fault>;

    /// Seconds since the UNIX epoch
    fn now(&mut self) -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0.0, |d| d.as_secs_f64())
    }
}

/// Host backed by the process's stdin/stdout and the real filesystem
#[derive(Debug, Default)]
pub struct StdHost;

impl Host for StdHost {
    fn print(&mut self, text: &str, newline: bool) -> Result<(), Fault> {
        let mut out = std::io::stdout().lock();
        let result = if newline {
            writeln!(out, "{text}")
        } else {
            write!(out, "{text}").and_then(|()| out.flush())
        };
        result.map_err(|e| Fault::Io(format!("stdout: {e}")))
    }

    fn read_line(&mut self) -> Result<Option<String>, Fault> {
        let mut line = String::new();
        let read = std::io::stdin()
            .lock()
            .read_line(&mut line)
            .map_err(|e| Fault::Io(format!("stdin: {e}")))?;
        if read == 0 {
            return Ok(None);
        }
        let trimmed = line.trim_end_matches(['\n', '\r']).len();
        line.truncate(trimmed);
        Ok(Some(line))
    }

    fn read_file(&mut self, path: &str) -> Result<String, Fault> {
        std::fs::read_to_string(path).map_err(|e| Fault::Io(format!("{path}: {e}")))
    }

    fn write_file(&mut self, path: &str, contents: &str) -> Result<(), Fault> {
        std::fs::write(path, contents).map_err(|e| Fault::Io(format!("{path}: {e}")))
    }
}

/// In-memory host: scripted input lines, a virtual filesystem, captured output
#[derive(Debug, Default, Clone)]
pub struct CaptureHost {
    /// Everything printed, exactly as it would have appeared on stdout
    pub transcript: String,
    pub input: VecDeque<String>,
    pub files: HashMap<String, String>,
    /// Fixed clock reading; the system clock is used when `None`
    pub clock: Option<f64>,
}

impl CaptureHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_input<I, S>(mut self, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.input.extend(lines.into_iter().map(Into::into));
        self
    }

    pub fn with_file(mut self, path: &str, contents: &str) -> Self {
        self.files.insert(path.to_owned(), contents.to_owned());
        self
    }

    /// Printed output split into lines
    pub fn lines(&self) -> Vec<&str> {
        self.transcript.lines().collect()
    }
}

impl Host for CaptureHost {
    fn print(&mut self, text: &str, newline: bool) -> Result<(), Fault> {
        self.transcript.push_str(text);
        if newline {
            self.transcript.push('\n');
        }
        Ok(())
    }

    fn read_line(&mut self) -> Result<Option<String>, Fault> {
        Ok(self.input.pop_front())
    }

    fn read_file(&mut self, path: &str) -> Result<String, Fault> {
        self.files
            .get(path)
            .cloned()
            .ok_or_else(|| Fault::Io(format!("{path}: no such file")))
    }

    fn write_file(&mut self, path: &str, contents: &str) -> Result<(), Fault> {
        self.files.insert(path.to_owned(), contents.to_owned());
        Ok(())
    }

    fn now(&mut self) -> f64 {
        match self.clock {
            Some(t) => t,
            None => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_or(0.0, |d| d.as_secs_f64()),
        }
    }
}

#[cfg(test)]
#[expect(clippy::unwrap_used)] // test code OK
mod tests {
    use super::*;

    #[test]
    fn test_capture_host_roundtrip() {
        let mut host = CaptureHost::new()
            .with_input(["first", "second"])
            .with_file("in.txt", "data");

        host.print("a", false).unwrap();
        host.print("b", true).unwrap();
        assert_eq!(host.transcript, "ab\n");
        assert_eq!(host.lines(), vec!["ab"]);

        assert_eq!(host.read_line().unwrap().as_deref(), Some("first"));
        assert_eq!(host.read_line().unwrap().as_deref(), Some("second"));
        assert_eq!(host.read_line().unwrap(), None);

        assert_eq!(host.read_file("in.txt").unwrap(), "data");
        assert!(matches!(host.read_file("missing"), Err(Fault::Io(_))));
        host.write_file("out.txt", "x").unwrap();
        assert_eq!(host.files["out.txt"], "x");
    }

    #[test]
    fn test_clock() {
        let mut fixed = CaptureHost {
            clock: Some(12.5),
            ..CaptureHost::default()
        };
        assert_eq!(fixed.now(), 12.5);
        assert!(CaptureHost::new().now() > 1.0e9);
    }

    #[test]
    fn test_std_host_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("note.txt");
        let path = path.to_str().unwrap();

        let mut host = StdHost;
        host.write_file(path, "hello").unwrap();
        assert_eq!(host.read_file(path).unwrap(), "hello");
        assert!(matches!(
            host.read_file(&format!("{path}.missing")),
            Err(Fault::Io(_))
        ));
    }
}
