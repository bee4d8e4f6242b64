use memchr::memchr;

/// Splits a server-sent-events byte stream into `data:` payloads.
///
/// Network chunks can end mid-line (and mid UTF-8 sequence), so bytes are
/// buffered until a newline arrives.
#[derive(Debug, Default)]
pub(crate) struct SseDataBuffer {
    buffer: Vec<u8>,
}

impl SseDataBuffer {
    pub(crate) fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Returns the next complete `data:` payload, skipping comments and other fields.
    pub(crate) fn next_payload(&mut self) -> Option<Result<String, std::str::Utf8Error>> {
        while let Some(newline_pos) = memchr(b'\n', &self.buffer) {
            let line = self.buffer.drain(..=newline_pos).collect::<Vec<u8>>();
            match extract_payload(&line) {
                Ok(Some(payload)) => return Some(Ok(payload)),
                Ok(None) => continue,
                Err(error) => return Some(Err(error)),
            }
        }

        None
    }

    /// Drains a trailing line that was not newline-terminated.
    pub(crate) fn finish(&mut self) -> Option<Result<String, std::str::Utf8Error>> {
        if self.buffer.is_empty() {
            return None;
        }

        let line = std::mem::take(&mut self.buffer);
        extract_payload(&line).transpose()
    }
}

fn extract_payload(line: &[u8]) -> Result<Option<String>, std::str::Utf8Error> {
    let line = std::str::from_utf8(line)?.trim();
    Ok(line
        .strip_prefix("data:")
        .map(str::trim_start)
        .filter(|payload| !payload.is_empty())
        .map(str::to_string))
}
