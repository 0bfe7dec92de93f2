// packages/runify/src/completion.rs
//! Completion model
//!
//! A [`Completion`] is the normalized outcome of one evaluation: captured
//! stdout plus either a normal result or a thrown [`ErrorDescriptor`].
//! Every runtime reports errors as a loose [`RawError`] record; the rules
//! that turn it into a descriptor live here so that all backends agree.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Name used when a backend reports an error without a class name
pub const UNKNOWN_ERROR_NAME: &str = "UnknownEngineError";

/// Marker carried by the bootstrap file; frames pointing into it are dropped
pub const BOOTSTRAP_MARKER: &str = "runify-bootstrap";

/// How an evaluation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionKind {
    Normal,
    Throw,
}

/// One parsed stack frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackFrame {
    pub function_name: Option<String>,
    pub file_name: Option<String>,
    pub line_number: Option<u32>,
    pub column_number: Option<u32>,

    /// The raw stack line this frame was parsed from
    pub source: String,
}

/// Normalized representation of the evaluated script's own thrown error
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDescriptor {
    pub name: String,
    pub message: Option<String>,
    pub stack: Vec<StackFrame>,
}

/// Error record as a runtime reports it, before normalization
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawError {
    #[serde(default)]
    pub name: Option<String>,

    /// Constructor name, used when `name` is missing
    #[serde(default)]
    pub constructor: Option<String>,

    #[serde(default)]
    pub message: Option<String>,

    #[serde(default)]
    pub stack: Option<String>,

    /// Line reported out of band (browser `onerror` row)
    #[serde(default)]
    pub line: Option<u32>,

    #[serde(default)]
    pub column: Option<u32>,
}

/// Result of one `eval_script` call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completion {
    pub kind: CompletionKind,
    pub stdout: String,
    pub error: Option<ErrorDescriptor>,

    /// Set when `stop()` cut the evaluation short
    #[serde(default)]
    pub interrupted: bool,
}

impl Completion {
    pub fn normal(stdout: impl Into<String>) -> Self {
        Self {
            kind: CompletionKind::Normal,
            stdout: stdout.into(),
            error: None,
            interrupted: false,
        }
    }

    pub fn throw(stdout: impl Into<String>, error: ErrorDescriptor) -> Self {
        Self {
            kind: CompletionKind::Throw,
            stdout: stdout.into(),
            error: Some(error),
            interrupted: false,
        }
    }

    /// Completion handed to an evaluation that `stop()` terminated
    pub fn interrupted(stdout: impl Into<String>) -> Self {
        Self {
            interrupted: true,
            ..Self::normal(stdout)
        }
    }

    pub fn is_throw(&self) -> bool {
        self.kind == CompletionKind::Throw
    }
}

static V8_FRAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*at (?:(?P<func>.+?) \()?(?P<file>[^()]+?)(?::(?P<line>\d+))(?::(?P<col>\d+))?\)?\s*$")
        .expect("valid V8 frame pattern")
});

static GECKO_FRAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<func>[^@\s]*)@(?P<file>.*?)(?::(?P<line>\d+))(?::(?P<col>\d+))?\s*$")
        .expect("valid gecko frame pattern")
});

/// Parse one stack line in any of the supported engine formats
pub fn parse_frame(line: &str) -> Option<StackFrame> {
    let caps = V8_FRAME
        .captures(line)
        .or_else(|| GECKO_FRAME.captures(line))?;

    let func = caps
        .name("func")
        .map(|m| m.as_str().trim())
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    Some(StackFrame {
        function_name: func,
        file_name: caps.name("file").map(|m| m.as_str().to_string()),
        line_number: caps.name("line").and_then(|m| m.as_str().parse().ok()),
        column_number: caps.name("col").and_then(|m| m.as_str().parse().ok()),
        source: line.trim().to_string(),
    })
}

/// Parse a whole stack string, dropping frames that point into the bootstrap
pub fn parse_stack(stack: &str) -> Vec<StackFrame> {
    stack
        .lines()
        .filter_map(parse_frame)
        .filter(|frame| {
            !frame
                .file_name
                .as_deref()
                .is_some_and(|f| f.contains(BOOTSTRAP_MARKER))
        })
        .collect()
}

impl ErrorDescriptor {
    /// Apply the normalization rules to a raw runtime error
    pub fn from_raw(raw: RawError) -> Self {
        let name = raw
            .name
            .filter(|n| !n.is_empty())
            .or(raw.constructor.filter(|c| !c.is_empty() && c != "Object"))
            .unwrap_or_else(|| UNKNOWN_ERROR_NAME.to_string());

        let message = raw.message.filter(|m| !m.is_empty());

        let mut stack = raw.stack.as_deref().map(parse_stack).unwrap_or_default();

        if stack.is_empty() {
            if let Some(line) = raw.line {
                stack.push(StackFrame {
                    function_name: None,
                    file_name: None,
                    line_number: Some(line),
                    column_number: raw.column,
                    source: String::new(),
                });
            }
        }

        Self {
            name,
            message,
            stack,
        }
    }

    /// Descriptor for a backend that only reports a message string
    pub fn unknown(message: impl Into<String>) -> Self {
        Self {
            name: UNKNOWN_ERROR_NAME.to_string(),
            message: Some(message.into()),
            stack: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_v8_frames() {
        let frame = parse_frame("    at foo (eval.js:3:11)").unwrap();
        assert_eq!(frame.function_name.as_deref(), Some("foo"));
        assert_eq!(frame.file_name.as_deref(), Some("eval.js"));
        assert_eq!(frame.line_number, Some(3));
        assert_eq!(frame.column_number, Some(11));

        let anonymous = parse_frame("    at eval.js:1:7").unwrap();
        assert_eq!(anonymous.function_name, None);
        assert_eq!(anonymous.line_number, Some(1));
    }

    #[test]
    fn test_quickjs_frames() {
        let frame = parse_frame("    at <eval> (eval_script:1)").unwrap();
        assert_eq!(frame.function_name.as_deref(), Some("<eval>"));
        assert_eq!(frame.line_number, Some(1));
        assert_eq!(frame.column_number, None);
    }

    #[test]
    fn test_gecko_and_jsc_frames() {
        let frame = parse_frame("bar@http://127.0.0.1:4000/page:12:5").unwrap();
        assert_eq!(frame.function_name.as_deref(), Some("bar"));
        assert_eq!(frame.file_name.as_deref(), Some("http://127.0.0.1:4000/page"));
        assert_eq!(frame.line_number, Some(12));

        let global = parse_frame("@eval.js:1:1").unwrap();
        assert_eq!(global.function_name, None);
        assert_eq!(global.line_number, Some(1));
    }

    #[test]
    fn test_bootstrap_frames_dropped() {
        let stack = "TypeError: m\n    at eval.js:1:7\n    at dispatch (/tmp/runify-bootstrap-a1.js:90:3)";
        let frames = parse_stack(stack);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].line_number, Some(1));
    }

    #[test]
    fn test_from_raw_type_error() {
        let desc = ErrorDescriptor::from_raw(RawError {
            name: Some("TypeError".into()),
            message: Some("m".into()),
            stack: Some("TypeError: m\n    at eval.js:1:7".into()),
            ..Default::default()
        });
        assert_eq!(desc.name, "TypeError");
        assert_eq!(desc.message.as_deref(), Some("m"));
        assert_eq!(desc.stack[0].line_number, Some(1));
    }

    #[test]
    fn test_from_raw_synthesizes_name() {
        let desc = ErrorDescriptor::from_raw(RawError {
            message: Some("Script error.".into()),
            line: Some(4),
            ..Default::default()
        });
        assert_eq!(desc.name, UNKNOWN_ERROR_NAME);
        assert_eq!(desc.stack.len(), 1);
        assert_eq!(desc.stack[0].line_number, Some(4));
    }

    #[test]
    fn test_from_raw_constructor_fallback() {
        let desc = ErrorDescriptor::from_raw(RawError {
            constructor: Some("Foo2Error".into()),
            message: Some("FAIL!".into()),
            ..Default::default()
        });
        assert_eq!(desc.name, "Foo2Error");
    }

    #[test]
    fn test_empty_message_is_absent() {
        let desc = ErrorDescriptor::from_raw(RawError {
            name: Some("Error".into()),
            message: Some(String::new()),
            ..Default::default()
        });
        assert_eq!(desc.message, None);
    }

    #[test]
    fn test_completion_constructors() {
        let normal = Completion::normal("a\n");
        assert!(!normal.is_throw());
        assert!(normal.error.is_none());

        let stopped = Completion::interrupted("1\n");
        assert!(stopped.interrupted);
        assert_eq!(stopped.kind, CompletionKind::Normal);

        let thrown = Completion::throw("", ErrorDescriptor::unknown("boom"));
        assert!(thrown.is_throw());
        assert_eq!(thrown.error.unwrap().name, UNKNOWN_ERROR_NAME);
    }

    proptest! {
        #[test]
        fn prop_name_never_empty(
            name in proptest::option::of(".{0,12}"),
            constructor in proptest::option::of("[A-Za-z]{0,8}"),
            message in proptest::option::of(".{0,20}"),
        ) {
            let desc = ErrorDescriptor::from_raw(RawError {
                name,
                constructor,
                message,
                ..Default::default()
            });
            prop_assert!(!desc.name.is_empty());
            prop_assert!(desc.message.as_deref() != Some(""));
        }

        #[test]
        fn prop_stack_parsing_never_panics(stack in ".{0,200}") {
            let _ = parse_stack(&stack);
        }
    }
}
