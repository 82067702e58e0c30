use std::path::Path;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::types::MemberNaming;

// ── Compilation flags ───────────────────────────────────────────

/// Flags controlling what a script may do and how much the compiler reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompileOptions {
    /// Whether `print` statements are permitted.
    pub allow_print: bool,
    /// Whether scripts may build object and array literals.
    pub allow_literals: bool,
    /// Report warnings alongside a successful compile.
    pub collect_warnings: bool,
    /// How host member names map to script names.
    pub member_naming: MemberNaming,
    /// Nesting limit for script calls at run time.
    pub max_call_depth: usize,
    /// Upper bound on analysis passes spent settling late widenings.
    pub max_passes: usize,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            allow_print: true,
            allow_literals: true,
            collect_warnings: false,
            member_naming: MemberNaming::Exact,
            max_call_depth: 256,
            max_passes: 4,
        }
    }
}

#[derive(Debug, Error)]
pub enum OptionsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CompileOptions {
    /// Parse options from JSON. Missing keys keep their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, OptionsError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load options from a JSON file.
    pub fn load(path: &Path) -> Result<Self, OptionsError> {
        let data = std::fs::read_to_string(path)?;
        Self::from_json_str(&data)
    }
}

// ── Print output ────────────────────────────────────────────────

/// Destination of `print` statements.
pub trait PrintSink: Send + Sync {
    fn print(&self, line: &str);
}

/// Writes each printed value to standard output.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdoutSink;

impl PrintSink for StdoutSink {
    fn print(&self, line: &str) {
        println!("{line}");
    }
}

/// Collects printed lines in memory.
#[derive(Debug, Default)]
pub struct BufferSink {
    lines: Mutex<Vec<String>>,
}

impl BufferSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }

    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.lines.lock())
    }
}

impl PrintSink for BufferSink {
    fn print(&self, line: &str) {
        self.lines.lock().push(line.to_string());
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let options = CompileOptions::from_json_str(r#"{"allow_print": false, "member_naming": "camel_case"}"#).unwrap();
        assert!(!options.allow_print);
        assert!(options.allow_literals);
        assert_eq!(options.member_naming, MemberNaming::CamelCase);
        assert_eq!(options.max_call_depth, 256);
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(matches!(
            CompileOptions::from_json_str("{allow_print: }"),
            Err(OptionsError::Json(_))
        ));
    }

    #[test]
    fn load_from_file() {
        let dir = std::env::temp_dir().join("shapescript_test_options");
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("options.json");
        std::fs::write(&path, r#"{"collect_warnings": true, "max_passes": 2}"#).unwrap();

        let options = CompileOptions::load(&path).unwrap();
        assert!(options.collect_warnings);
        assert_eq!(options.max_passes, 2);
        assert!(matches!(
            CompileOptions::load(&dir.join("missing.json")),
            Err(OptionsError::Io(_))
        ));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn buffer_sink_collects_lines() {
        let sink = BufferSink::new();
        sink.print("a");
        sink.print("b");
        assert_eq!(sink.lines(), vec!["a", "b"]);
        assert_eq!(sink.take().len(), 2);
        assert!(sink.lines().is_empty());
    }
}
