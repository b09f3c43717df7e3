// Bounded capture of child output streams.
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncReadExt};

pub const TRUNCATION_MARKER: &str = "\n[output truncated]";

const READ_CHUNK: usize = 8 * 1024;

/// Keeps at most `limit` bytes; everything after is counted and dropped.
#[derive(Debug, Default)]
pub struct BoundedBuffer {
    data: Vec<u8>,
    limit: usize,
    truncated: bool,
}

impl BoundedBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            data: Vec::with_capacity(limit.min(READ_CHUNK)),
            limit,
            truncated: false,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        let room = self.limit.saturating_sub(self.data.len());
        if bytes.len() > room {
            self.truncated = true;
        }
        self.data.extend_from_slice(&bytes[..bytes.len().min(room)]);
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// Lossy UTF-8 text plus the truncation marker when anything was dropped.
    /// A character split by the cut is dropped whole.
    pub fn to_text(&self) -> (String, bool) {
        if !self.truncated {
            return (String::from_utf8_lossy(&self.data).into_owned(), false);
        }
        let mut text = String::from_utf8_lossy(without_split_char(&self.data)).into_owned();
        text.push_str(TRUNCATION_MARKER);
        (text, true)
    }
}

/// `bytes` minus a trailing multi-byte sequence that was cut short.
fn without_split_char(bytes: &[u8]) -> &[u8] {
    let window = bytes.len().saturating_sub(4);
    let Some(lead) = bytes[window..].iter().rposition(|b| b & 0xC0 != 0x80).map(|i| i + window) else {
        return bytes;
    };
    let width = match bytes[lead] {
        0x00..=0x7F => 1,
        0xC0..=0xDF => 2,
        0xE0..=0xEF => 3,
        0xF0..=0xF7 => 4,
        _ => return bytes,
    };
    if bytes.len() - lead < width {
        &bytes[..lead]
    } else {
        bytes
    }
}

/// Shared handle so a reader that never finishes (the pipe is held open by
/// an escaped process) still leaves its partial output behind.
pub type SharedBuffer = Arc<Mutex<BoundedBuffer>>;

pub fn shared(limit: usize) -> SharedBuffer {
    Arc::new(Mutex::new(BoundedBuffer::new(limit)))
}

pub fn snapshot(buffer: &SharedBuffer) -> (String, bool) {
    match buffer.lock() {
        Ok(guard) => guard.to_text(),
        Err(poisoned) => poisoned.into_inner().to_text(),
    }
}

/// Drain `reader` to EOF, keeping at most the buffer's limit.
pub async fn read_bounded<R>(mut reader: R, buffer: SharedBuffer)
where
    R: AsyncRead + Unpin,
{
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => match buffer.lock() {
                Ok(mut guard) => guard.push(&chunk[..n]),
                Err(poisoned) => poisoned.into_inner().push(&chunk[..n]),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_under_limit_is_untouched() {
        let mut buffer = BoundedBuffer::new(16);
        buffer.push(b"hello ");
        buffer.push(b"world");
        assert_eq!(buffer.to_text(), ("hello world".to_string(), false));
    }

    #[test]
    fn test_over_limit_truncates_with_marker() {
        let mut buffer = BoundedBuffer::new(4);
        buffer.push(b"abcdef");
        buffer.push(b"ghi");
        let (text, truncated) = buffer.to_text();
        assert!(truncated);
        assert_eq!(text, format!("abcd{}", TRUNCATION_MARKER));
    }

    #[test]
    fn test_exact_limit_is_not_truncated() {
        let mut buffer = BoundedBuffer::new(3);
        buffer.push(b"abc");
        assert!(!buffer.is_truncated());
        buffer.push(b"");
        assert!(!buffer.is_truncated());
    }

    #[test]
    fn test_cut_inside_multibyte_char_drops_it() {
        let mut buffer = BoundedBuffer::new(2);
        buffer.push("aé".as_bytes());
        buffer.push(b"!");
        assert_eq!(buffer.to_text(), (format!("a{}", TRUNCATION_MARKER), true));

        let mut buffer = BoundedBuffer::new(4);
        buffer.push("ab€".as_bytes());
        let (text, _) = buffer.to_text();
        assert_eq!(text, format!("ab{}", TRUNCATION_MARKER));
        assert!(!text.contains('\u{FFFD}'));
    }

    #[test]
    fn test_cut_on_char_boundary_keeps_everything() {
        let mut buffer = BoundedBuffer::new(3);
        buffer.push("aéz".as_bytes());
        assert_eq!(buffer.to_text(), (format!("aé{}", TRUNCATION_MARKER), true));
    }

    #[tokio::test]
    async fn test_read_bounded_drains_everything() {
        let data = vec![b'x'; 100_000];
        let buffer = shared(1024);
        read_bounded(&data[..], buffer.clone()).await;
        let (text, truncated) = snapshot(&buffer);
        assert!(truncated);
        assert_eq!(text.len(), 1024 + TRUNCATION_MARKER.len());
    }
}
