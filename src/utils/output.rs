/// Bounded output collection.
///
/// Each child stream is drained on its own thread. Bytes past the limit are
/// still read so a chatty child never blocks on a full pipe; only the last
/// `tail_limit` of them are kept.
use crate::config::types::OutputIntegrity;
use crate::config::OutputConfig;
use crossbeam_channel::{bounded, Receiver};
use std::collections::VecDeque;
use std::io::Read;
use std::thread;

/// Output limits configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLimits {
    pub stdout_limit: usize,
    pub stderr_limit: usize,
    /// Trailing stdout bytes kept once the head limit is reached
    pub tail_limit: usize,
    /// How long to wait for the pipes to close after the child was reaped
    pub collection_timeout_ms: u64,
}

impl Default for OutputLimits {
    fn default() -> Self {
        OutputLimits::from(&OutputConfig::default())
    }
}

impl From<&OutputConfig> for OutputLimits {
    fn from(config: &OutputConfig) -> Self {
        OutputLimits {
            stdout_limit: config.stdout_limit,
            stderr_limit: config.stderr_limit,
            tail_limit: config.tail_limit,
            collection_timeout_ms: 2000,
        }
    }
}

/// Bytes kept from one stream
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CollectedStream {
    /// First `limit` bytes
    pub data: Vec<u8>,
    /// Last bytes of the stream when bytes between `data` and them were
    /// dropped; empty otherwise
    pub tail: Vec<u8>,
    pub integrity: OutputIntegrity,
}

impl CollectedStream {
    pub fn lossy(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }

    pub fn tail_lossy(&self) -> String {
        String::from_utf8_lossy(&self.tail).into_owned()
    }
}

/// Drain `stream` on a background thread; the result arrives on the channel
pub fn spawn_collector<R: Read + Send + 'static>(
    stream: R,
    limit: usize,
    tail_limit: usize,
) -> Receiver<CollectedStream> {
    let (tx, rx) = bounded(1);
    thread::spawn(move || {
        let _ = tx.send(collect_stream(stream, limit, tail_limit));
    });
    rx
}

/// Collect from a single stream: the first `limit` bytes plus a ring of the
/// last `tail_limit` bytes past them
pub fn collect_stream<R: Read>(mut stream: R, limit: usize, tail_limit: usize) -> CollectedStream {
    let mut data = Vec::new();
    let mut tail: VecDeque<u8> = VecDeque::with_capacity(tail_limit.min(64 * 1024));
    let mut chunk = [0u8; 4096];
    let mut integrity = OutputIntegrity::Complete;
    let mut dropped: u64 = 0;

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                let room = limit.saturating_sub(data.len());
                if n > room {
                    data.extend_from_slice(&chunk[..room]);
                    let overflow = &chunk[room..n];
                    let keep = overflow.len().min(tail_limit);
                    let excess = (tail.len() + keep).saturating_sub(tail_limit);
                    tail.drain(..excess);
                    tail.extend(&overflow[overflow.len() - keep..]);
                    dropped += (overflow.len() - keep + excess) as u64;
                } else {
                    data.extend_from_slice(&chunk[..n]);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                integrity = if e.kind() == std::io::ErrorKind::BrokenPipe {
                    OutputIntegrity::TruncatedByProgramClose
                } else {
                    OutputIntegrity::ReadError
                };
                break;
            }
        }
    }

    // Nothing lost between head and tail: hand back one contiguous buffer.
    if dropped == 0 {
        data.extend(tail);
        return CollectedStream {
            data,
            tail: Vec::new(),
            integrity,
        };
    }

    CollectedStream {
        data,
        tail: tail.into(),
        integrity: combine_integrity(integrity, OutputIntegrity::TruncatedByLimit),
    }
}

/// Worst of two per-stream states
pub fn combine_integrity(a: OutputIntegrity, b: OutputIntegrity) -> OutputIntegrity {
    fn rank(i: OutputIntegrity) -> u8 {
        match i {
            OutputIntegrity::Complete => 0,
            OutputIntegrity::TruncatedByProgramClose => 1,
            OutputIntegrity::TruncatedByLimit => 2,
            OutputIntegrity::ReadError => 3,
        }
    }
    if rank(a) >= rank(b) {
        a
    } else {
        b
    }
}

/// Trailing `limit` bytes of `text`, cut on a char boundary
pub fn tail_excerpt(text: &str, limit: usize) -> &str {
    if text.len() <= limit {
        return text;
    }
    let mut start = text.len() - limit;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::time::Duration;

    #[test]
    fn test_small_output_is_complete() {
        let collected = collect_stream(Cursor::new(b"hello\n".to_vec()), 64, 16);
        assert_eq!(collected.data, b"hello\n");
        assert_eq!(collected.integrity, OutputIntegrity::Complete);
    }

    #[test]
    fn test_limit_truncates_but_drains() {
        let input = vec![b'x'; 10_000];
        let collected = collect_stream(Cursor::new(input), 100, 0);
        assert_eq!(collected.data.len(), 100);
        assert!(collected.tail.is_empty());
        assert_eq!(collected.integrity, OutputIntegrity::TruncatedByLimit);
    }

    #[test]
    fn test_tail_keeps_last_bytes_past_limit() {
        let mut input = vec![b'x'; 20_000];
        input.extend_from_slice(b"\nlast line\n");
        let collected = collect_stream(Cursor::new(input), 100, 32);
        assert_eq!(collected.data, vec![b'x'; 100]);
        assert_eq!(collected.tail.len(), 32);
        assert!(collected.tail_lossy().ends_with("xx\nlast line\n"));
        assert_eq!(collected.integrity, OutputIntegrity::TruncatedByLimit);
    }

    #[test]
    fn test_overflow_within_window_stays_contiguous() {
        let collected = collect_stream(Cursor::new(b"0123456789".to_vec()), 4, 64);
        assert_eq!(collected.data, b"0123456789");
        assert!(collected.tail.is_empty());
        assert_eq!(collected.integrity, OutputIntegrity::Complete);
    }

    #[test]
    fn test_exact_limit_is_complete() {
        let collected = collect_stream(Cursor::new(vec![b'y'; 64]), 64, 64);
        assert_eq!(collected.data.len(), 64);
        assert!(collected.tail.is_empty());
        assert_eq!(collected.integrity, OutputIntegrity::Complete);
    }

    #[test]
    fn test_background_collector() {
        let rx = spawn_collector(Cursor::new(b"abc".to_vec()), 10, 10);
        let collected = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(collected.lossy(), "abc");
    }

    #[test]
    fn test_combine_integrity_prefers_worst() {
        assert_eq!(
            combine_integrity(OutputIntegrity::Complete, OutputIntegrity::TruncatedByLimit),
            OutputIntegrity::TruncatedByLimit
        );
        assert_eq!(
            combine_integrity(OutputIntegrity::ReadError, OutputIntegrity::TruncatedByLimit),
            OutputIntegrity::ReadError
        );
        assert_eq!(
            combine_integrity(OutputIntegrity::Complete, OutputIntegrity::Complete),
            OutputIntegrity::Complete
        );
    }

    #[test]
    fn test_tail_excerpt_respects_char_boundaries() {
        assert_eq!(tail_excerpt("short", 10), "short");
        assert_eq!(tail_excerpt("abcdef", 3), "def");
        let text = "ééé";
        let tail = tail_excerpt(text, 3);
        assert_eq!(tail, "é");
    }
}
