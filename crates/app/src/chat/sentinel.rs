/// Marker separating the readable reply from the trailing suggestions payload.
pub const SUGGESTIONS_SENTINEL: &str = "---SUGGESTIONS---";

/// A finished reply split at the first sentinel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitReply {
    pub body: String,
    /// Raw text after the first sentinel; `None` when no sentinel arrived.
    pub trailer: Option<String>,
}

/// Incrementally locates the first sentinel in streamed text.
///
/// Only the tail that could still complete a sentinel is rescanned on each push, so a
/// marker split across chunk boundaries is found without rescanning the whole reply.
#[derive(Debug, Default, Clone)]
pub struct SentinelSplitter {
    accumulated: String,
    sentinel_at: Option<usize>,
    scan_from: usize,
}

impl SentinelSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &str) {
        if chunk.is_empty() {
            return;
        }
        self.accumulated.push_str(chunk);

        if self.sentinel_at.is_some() {
            return;
        }

        if let Some(offset) = self.accumulated[self.scan_from..].find(SUGGESTIONS_SENTINEL) {
            self.sentinel_at = Some(self.scan_from + offset);
            return;
        }

        let mut next_scan = self
            .accumulated
            .len()
            .saturating_sub(SUGGESTIONS_SENTINEL.len() - 1)
            .max(self.scan_from);
        while !self.accumulated.is_char_boundary(next_scan) {
            next_scan -= 1;
        }
        self.scan_from = next_scan;
    }

    /// Text safe to show while streaming: everything before the first sentinel, minus
    /// any tail that may still grow into one.
    pub fn displayable(&self) -> &str {
        match self.sentinel_at {
            Some(position) => &self.accumulated[..position],
            None => {
                let held = partial_sentinel_len(&self.accumulated);
                &self.accumulated[..self.accumulated.len() - held]
            }
        }
    }

    pub fn has_sentinel(&self) -> bool {
        self.sentinel_at.is_some()
    }

    pub fn accumulated(&self) -> &str {
        &self.accumulated
    }

    /// Without a sentinel the body is the untouched accumulator; with one it is trimmed.
    pub fn finish(self) -> SplitReply {
        match self.sentinel_at {
            Some(position) => SplitReply {
                body: self.accumulated[..position].trim().to_string(),
                trailer: Some(self.accumulated[position + SUGGESTIONS_SENTINEL.len()..].to_string()),
            },
            None => SplitReply {
                body: self.accumulated,
                trailer: None,
            },
        }
    }
}

// Length of the longest proper sentinel prefix that `text` ends with.
fn partial_sentinel_len(text: &str) -> usize {
    (1..SUGGESTIONS_SENTINEL.len())
        .rev()
        .find(|len| text.ends_with(&SUGGESTIONS_SENTINEL[..*len]))
        .unwrap_or(0)
}

/// Parses the trailer as a JSON array of strings.
///
/// A blank trailer or an empty array yields `Ok(None)`.
pub fn parse_suggestions(trailer: &str) -> Result<Option<Vec<String>>, serde_json::Error> {
    let trailer = trailer.trim();
    if trailer.is_empty() {
        return Ok(None);
    }

    let suggestions = serde_json::from_str::<Vec<String>>(trailer)?;
    Ok((!suggestions.is_empty()).then_some(suggestions))
}
