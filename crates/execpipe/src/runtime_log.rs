// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

//! Parsing and forwarding of the container runtime's diagnostic log
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

#[cfg(test)]
#[path = "./runtime_log_test.rs"]
mod runtime_log_test;

static NO_SUCH_EXECUTABLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?:starting container process caused|unable to start container process): exec: .*: (?:stat .*: no such file or directory|executable file not found in \$PATH)",
    )
    .expect("a valid regular expression")
});

/// True if the runtime failed because the requested executable does not exist
pub fn is_no_such_executable(msg: &str) -> bool {
    NO_SUCH_EXECUTABLE.is_match(msg)
}

/// A single entry from the runtime log, which is
/// written either as json objects or as logfmt records.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct RuntimeLogLine {
    #[serde(default)]
    pub level: String,
    #[serde(default)]
    pub msg: String,
}

impl RuntimeLogLine {
    /// Parse one line of runtime output, if it looks like a structured entry
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        if line.starts_with('{') {
            return serde_json::from_str(line).ok();
        }

        let mut parsed = Self::default();
        let mut structured = false;
        for (key, value) in logfmt_pairs(line)? {
            match key.as_str() {
                "level" => {
                    parsed.level = value;
                    structured = true;
                }
                "msg" => {
                    parsed.msg = value;
                    structured = true;
                }
                _ => {}
            }
        }
        structured.then_some(parsed)
    }

    /// True for entries at error severity or worse
    pub fn is_error(&self) -> bool {
        matches!(self.level.as_str(), "error" | "fatal" | "panic")
    }

    fn forward(&self) {
        tracing::debug!(
            target: "execpipe::runtime",
            runtime_level = %self.level,
            message = %self.msg
        );
    }
}

/// Send one line of runtime output to the logger, returning
/// the parsed entry if it was structured.
pub fn forward_line(line: &str) -> Option<RuntimeLogLine> {
    match RuntimeLogLine::parse(line) {
        Some(parsed) => {
            parsed.forward();
            Some(parsed)
        }
        None => {
            if !line.trim().is_empty() {
                tracing::info!(target: "execpipe::runtime", message = %line, "error parsing runtime log line");
            }
            None
        }
    }
}

/// Split a logfmt record into its key value pairs.
///
/// Returns None for input that is not valid logfmt.
fn logfmt_pairs(line: &str) -> Option<Vec<(String, String)>> {
    let mut pairs = Vec::new();
    let mut chars = line.chars().peekable();
    loop {
        while chars.next_if(|c| c.is_whitespace()).is_some() {}
        if chars.peek().is_none() {
            break;
        }

        let mut key = String::new();
        while let Some(c) = chars.next_if(|c| *c != '=' && !c.is_whitespace()) {
            if c == '"' {
                return None;
            }
            key.push(c);
        }
        if chars.next_if_eq(&'=').is_none() {
            pairs.push((key, String::new()));
            continue;
        }

        let mut value = String::new();
        if chars.next_if_eq(&'"').is_some() {
            let mut closed = false;
            while let Some(c) = chars.next() {
                match c {
                    '"' => {
                        closed = true;
                        break;
                    }
                    '\\' => match chars.next()? {
                        'n' => value.push('\n'),
                        't' => value.push('\t'),
                        other => value.push(other),
                    },
                    c => value.push(c),
                }
            }
            if !closed {
                return None;
            }
        } else {
            while let Some(c) = chars.next_if(|c| !c.is_whitespace()) {
                value.push(c);
            }
        }
        pairs.push((key, value));
    }
    Some(pairs)
}
