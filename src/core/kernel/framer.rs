use serde::{Deserialize, Serialize};

/// How fragments that straddle two socket reads are treated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FramingMode {
    /// Every read is split on its own; a message cut by the read boundary
    /// turns into two malformed fragments.
    PerRead,
    /// The trailing fragment of a read is held back until it forms a
    /// complete JSON value, and then joined with the next read.
    #[default]
    CarryOver,
}

/// Splits a text stream into message fragments on a literal delimiter.
///
/// The framer never fails: fragments that are not valid messages are passed
/// through and left for the decoder to reject.
#[derive(Debug)]
pub struct DelimiterFramer {
    delimiter: &'static str,
    mode: FramingMode,
    pending: String,
    max_pending: usize,
}

impl DelimiterFramer {
    pub fn new(delimiter: &'static str, mode: FramingMode, max_pending: usize) -> Self {
        Self {
            delimiter,
            mode,
            pending: String::new(),
            max_pending,
        }
    }

    /// Feed one decoded read and collect every fragment that is ready.
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        self.pending.push_str(chunk);
        let buffer = std::mem::take(&mut self.pending);

        let mut parts: Vec<&str> = buffer.split(self.delimiter).collect();
        let tail = parts.pop().unwrap_or_default();

        let mut fragments: Vec<String> = parts
            .into_iter()
            .filter(|part| !part.trim().is_empty())
            .map(str::to_string)
            .collect();

        // The read may have ended in the middle of the next delimiter.
        if self.mode == FramingMode::CarryOver
            && !tail.is_empty()
            && self.delimiter.starts_with(tail)
        {
            self.pending = tail.to_string();
            return fragments;
        }

        if tail.trim().is_empty() {
            return fragments;
        }

        match self.mode {
            FramingMode::PerRead => fragments.push(tail.to_string()),
            FramingMode::CarryOver => {
                if is_complete_value(tail) || tail.len() > self.max_pending {
                    fragments.push(tail.to_string());
                } else {
                    self.pending = tail.to_string();
                }
            }
        }

        fragments
    }

    /// Text held back from previous reads
    pub fn pending(&self) -> &str {
        &self.pending
    }
}

/// Whether `fragment` holds a JSON object or array whose closing bracket
/// ends the fragment. Fragments that do not start with a bracket cannot
/// become valid later and count as complete.
fn is_complete_value(fragment: &str) -> bool {
    let trimmed = fragment.trim_start();
    if !trimmed.starts_with(['{', '[']) {
        return true;
    }

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (index, ch) in trimmed.char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }

        match ch {
            '"' => in_string = true,
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return trimmed[index + ch.len_utf8()..].trim().is_empty();
                }
            }
            _ => {}
        }
    }

    false
}
