use regex::{Captures, Regex};

use crate::event::AsyncEvent;

const SENTINEL_PREFIX: &str = "__DBG_DONE_";
const SENTINEL_SUFFIX: &str = "__";

/// Builds the marker-echo instruction appended to every issued command.
///
/// The token is split across two string literals so the PTY's echo of the
/// command line itself can never match the anchored sentinel pattern; only
/// the debugger's printed concatenation does.
pub fn sentinel_echo_command(token: &str) -> String {
    format!("script print(\"{SENTINEL_PREFIX}\" + \"{token}{SENTINEL_SUFFIX}\")")
}

/// One item decoded from the stream, delivered exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamItem {
    /// A completion sentinel for the command that carries this token.
    Sentinel(String),
    /// A typed async notification, or `RawLine` for inert text.
    Event(AsyncEvent),
}

/// A single classification rule: pattern plus event constructor.
///
/// The stop-notification grammar is tool-version-dependent, so the rule
/// set is data rather than hard-coded parsing; `OutputDemux::with_rules`
/// swaps it wholesale.
pub struct StopRule {
    pub pattern: Regex,
    pub build: fn(&Captures<'_>, &str) -> AsyncEvent,
}

fn default_rules() -> Vec<StopRule> {
    vec![
        StopRule {
            pattern: Regex::new(r"^Process (\d+) exited with status = (-?\d+)").unwrap(),
            build: |caps, _| AsyncEvent::ProcessExited {
                code: caps.get(2).and_then(|m| m.as_str().parse().ok()),
            },
        },
        StopRule {
            pattern: Regex::new(r"^Process (\d+) crashed").unwrap(),
            build: |_, line| AsyncEvent::ProcessCrashed {
                reason: line.trim().to_string(),
            },
        },
        StopRule {
            pattern: Regex::new(r"^\* thread #(\d+).*stop reason = (.+)$").unwrap(),
            build: |caps, _| AsyncEvent::ProcessStopped {
                reason: caps.get(2).map(|m| m.as_str().trim().to_string()),
                thread_index: caps.get(1).and_then(|m| m.as_str().parse().ok()),
            },
        },
        StopRule {
            pattern: Regex::new(r"^Process (\d+) stopped").unwrap(),
            build: |_, _| AsyncEvent::ProcessStopped {
                reason: None,
                thread_index: None,
            },
        },
        StopRule {
            pattern: Regex::new(r"^Process (\d+) resuming").unwrap(),
            build: |_, _| AsyncEvent::ProcessContinued,
        },
        // "launched" means the target is running from the engine's point
        // of view; the pid side-channel picks up the process id.
        StopRule {
            pattern: Regex::new(r"^Process (\d+) launched:").unwrap(),
            build: |_, _| AsyncEvent::ProcessContinued,
        },
    ]
}

/// Splits the continuous PTY byte stream into discrete classified items.
///
/// Buffers partial lines across read boundaries and tokenizes on newline.
/// Each line becomes exactly one item: a sentinel hit, a typed event, or
/// `RawLine` text; never two of those.
pub struct OutputDemux {
    partial: Vec<u8>,
    rules: Vec<StopRule>,
    sentinel: Regex,
    pid_capture: Regex,
    observed_pid: Option<u32>,
}

impl Default for OutputDemux {
    fn default() -> Self {
        Self::with_rules(default_rules())
    }
}

impl OutputDemux {
    pub fn with_rules(rules: Vec<StopRule>) -> Self {
        Self {
            partial: Vec::new(),
            rules,
            sentinel: Regex::new(&format!(
                "^{SENTINEL_PREFIX}([0-9a-f]{{32}}){SENTINEL_SUFFIX}\\s*$"
            ))
            .unwrap(),
            pid_capture: Regex::new(r"^Process (\d+) ").unwrap(),
            observed_pid: None,
        }
    }

    /// Process id captured from the debugger's own status lines, once the
    /// stream has revealed it.
    pub fn observed_pid(&self) -> Option<u32> {
        self.observed_pid
    }

    /// Feed one chunk read from the transport; returns the items completed
    /// by this chunk, in stream order.
    pub fn push_bytes(&mut self, bytes: &[u8]) -> Vec<StreamItem> {
        let mut items = Vec::new();
        for &byte in bytes {
            if byte == b'\n' {
                let raw = std::mem::take(&mut self.partial);
                let line = String::from_utf8_lossy(&raw);
                let line = line.trim_end_matches('\r');
                items.push(self.classify(line));
            } else {
                self.partial.push(byte);
            }
        }
        items
    }

    fn classify(&mut self, raw_line: &str) -> StreamItem {
        // The PTY echoes prompts in front of both commands and output.
        let mut line = raw_line;
        while let Some(rest) = line.strip_prefix("(lldb) ") {
            line = rest;
        }

        if let Some(caps) = self.pid_capture.captures(line) {
            if self.observed_pid.is_none() {
                self.observed_pid = caps.get(1).and_then(|m| m.as_str().parse().ok());
            }
        }

        if let Some(caps) = self.sentinel.captures(line) {
            return StreamItem::Sentinel(caps[1].to_string());
        }

        for rule in &self.rules {
            if let Some(caps) = rule.pattern.captures(line) {
                return StreamItem::Event((rule.build)(&caps, line));
            }
        }

        StreamItem::Event(AsyncEvent::RawLine(line.to_string()))
    }
}
