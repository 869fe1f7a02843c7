use regex::Regex;

use crate::event::AsyncEvent;

/// One fatal-pattern rule. Rules are checked in order; the first match
/// wins and its description becomes the crash reason.
struct CrashRule {
    pattern: Regex,
    description: &'static str,
}

/// Stateless classifier for fatal conditions observed on the stream.
///
/// Applied to every raw line and every decoded event. On a match the
/// session synthesizes a `ProcessCrashed` event and feeds it through the
/// same path as genuine async notifications, so state transitions have a
/// single point of truth. Pure data-in/event-out, testable without a
/// subprocess.
pub struct CrashDetector {
    rules: Vec<CrashRule>,
}

impl Default for CrashDetector {
    fn default() -> Self {
        let rules = vec![
            CrashRule {
                pattern: Regex::new(r"dyld\[\d+\]|dyld: Library not loaded|Library not loaded:")
                    .unwrap(),
                description: "dynamic linker abort",
            },
            CrashRule {
                pattern: Regex::new(r"stop reason = signal SIG(ABRT|SEGV|BUS|ILL|KILL)").unwrap(),
                description: "fatal signal",
            },
            CrashRule {
                pattern: Regex::new(r"stop reason = (EXC_BAD_ACCESS|EXC_BAD_INSTRUCTION|EXC_CRASH)")
                    .unwrap(),
                description: "mach exception",
            },
            CrashRule {
                pattern: Regex::new(r"^Process \d+ crashed").unwrap(),
                description: "debugger reported crash",
            },
            CrashRule {
                pattern: Regex::new(r"abort_with_payload|__abort_with_payload").unwrap(),
                description: "abort with payload",
            },
        ];
        Self { rules }
    }
}

impl CrashDetector {
    /// Custom rule set, for debugger versions with different phrasing.
    pub fn with_patterns(patterns: Vec<(Regex, &'static str)>) -> Self {
        Self {
            rules: patterns
                .into_iter()
                .map(|(pattern, description)| CrashRule {
                    pattern,
                    description,
                })
                .collect(),
        }
    }

    /// Returns a crash reason if the line matches a fatal pattern.
    pub fn scan_line(&self, line: &str) -> Option<String> {
        for rule in &self.rules {
            if rule.pattern.is_match(line) {
                return Some(format!("{}: {}", rule.description, line.trim()));
            }
        }
        None
    }

    /// Returns a crash reason if a decoded event carries a fatal stop
    /// reason (e.g. a signal-based stop surfaced as `ProcessStopped`).
    pub fn scan_event(&self, event: &AsyncEvent) -> Option<String> {
        match event {
            AsyncEvent::ProcessStopped {
                reason: Some(reason),
                ..
            } => {
                let line = format!("stop reason = {reason}");
                self.scan_line(&line)
            }
            AsyncEvent::RawLine(line) => self.scan_line(line),
            _ => None,
        }
    }
}
