use super::backend::OutputChunk;

/// Text captured from one phase.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
    pub truncated: bool,
}

impl CapturedOutput {
    pub fn combined(&self) -> String {
        let mut out = String::with_capacity(self.stdout.len() + self.stderr.len());
        out.push_str(&self.stdout);
        out.push_str(&self.stderr);
        out
    }
}

/// Byte-capped output collector shared by every phase of a job.
///
/// The budget covers stdout and stderr of all phases together. Chunks past the
/// budget are dropped, not buffered, so the reader can keep draining the
/// process and it never blocks on a full pipe.
#[derive(Debug)]
pub struct OutputCapture {
    remaining: usize,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    truncated: bool,
}

impl OutputCapture {
    pub fn new(cap: usize) -> Self {
        Self {
            remaining: cap,
            stdout: Vec::new(),
            stderr: Vec::new(),
            truncated: false,
        }
    }

    pub fn push(&mut self, chunk: OutputChunk) {
        let (buf, data) = match chunk {
            OutputChunk::Stdout(data) => (&mut self.stdout, data),
            OutputChunk::Stderr(data) => (&mut self.stderr, data),
        };
        let keep = data.len().min(self.remaining);
        if keep < data.len() {
            self.truncated = true;
        }
        buf.extend_from_slice(&data[..keep]);
        self.remaining -= keep;
    }

    /// Append a service-generated note (e.g. a timeout marker) under the same
    /// budget. When the budget is spent, the tail of this phase's output is
    /// evicted to make room, stderr first. The note itself is only cut when
    /// earlier phases used up the budget.
    pub fn note(&mut self, message: &str) {
        let bytes = message.as_bytes();
        let mut short = bytes.len().saturating_sub(self.remaining);
        for buf in [&mut self.stderr, &mut self.stdout] {
            if short == 0 {
                break;
            }
            let evict = short.min(buf.len());
            buf.truncate(buf.len() - evict);
            self.remaining += evict;
            short -= evict;
            self.truncated |= evict > 0;
        }

        let keep = bytes.len().min(self.remaining);
        if keep < bytes.len() {
            self.truncated = true;
        }
        self.stderr.extend_from_slice(&bytes[..keep]);
        self.remaining -= keep;
    }

    pub fn truncated(&self) -> bool {
        self.truncated
    }

    /// Hand out what this phase captured. The remaining budget carries over.
    pub fn take(&mut self) -> CapturedOutput {
        CapturedOutput {
            stdout: lossy_within(&std::mem::take(&mut self.stdout)),
            stderr: lossy_within(&std::mem::take(&mut self.stderr)),
            truncated: self.truncated,
        }
    }
}

/// Decode as UTF-8 without ever growing past the raw byte length, so the cap
/// still holds after replacement characters are substituted.
fn lossy_within(bytes: &[u8]) -> String {
    let mut text = String::from_utf8_lossy(bytes).into_owned();
    if text.len() > bytes.len() {
        let mut end = bytes.len();
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text.truncate(end);
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_within_budget_is_untouched() {
        let mut capture = OutputCapture::new(64);
        capture.push(OutputChunk::Stdout(b"hello\n".to_vec()));
        capture.push(OutputChunk::Stderr(b"warn\n".to_vec()));
        let out = capture.take();
        assert_eq!(out.stdout, "hello\n");
        assert_eq!(out.stderr, "warn\n");
        assert!(!out.truncated);
    }

    #[test]
    fn test_budget_is_shared_and_truncates() {
        let mut capture = OutputCapture::new(10);
        capture.push(OutputChunk::Stdout(vec![b'a'; 6]));
        capture.push(OutputChunk::Stderr(vec![b'b'; 6]));
        capture.push(OutputChunk::Stdout(vec![b'c'; 100]));
        let out = capture.take();
        assert_eq!(out.stdout, "aaaaaa");
        assert_eq!(out.stderr, "bbbb");
        assert!(out.truncated);
        assert!(out.stdout.len() + out.stderr.len() <= 10);
    }

    #[test]
    fn test_budget_carries_across_phases() {
        let mut capture = OutputCapture::new(8);
        capture.push(OutputChunk::Stderr(b"warn:".to_vec()));
        let compile = capture.take();
        capture.push(OutputChunk::Stdout(b"123456".to_vec()));
        let run = capture.take();
        assert_eq!(compile.stderr, "warn:");
        assert_eq!(run.stdout, "123");
        assert!(run.truncated);
    }

    #[test]
    fn test_note_lands_after_flood() {
        let mut capture = OutputCapture::new(10);
        capture.push(OutputChunk::Stdout(vec![b'x'; 100]));
        capture.note("[T/O]");
        let out = capture.take();
        assert_eq!(out.stdout, "xxxxx");
        assert_eq!(out.stderr, "[T/O]");
        assert!(out.truncated);
        assert!(out.stdout.len() + out.stderr.len() <= 10);
    }

    #[test]
    fn test_note_evicts_stderr_before_stdout() {
        let mut capture = OutputCapture::new(8);
        capture.push(OutputChunk::Stdout(b"abcd".to_vec()));
        capture.push(OutputChunk::Stderr(b"efgh".to_vec()));
        capture.note("!!!");
        let out = capture.take();
        assert_eq!(out.stdout, "abcd");
        assert_eq!(out.stderr, "e!!!");
    }

    #[test]
    fn test_note_is_cut_when_earlier_phase_spent_budget() {
        let mut capture = OutputCapture::new(4);
        capture.push(OutputChunk::Stderr(b"warn".to_vec()));
        let _compile = capture.take();
        capture.note("[timed out]");
        let run = capture.take();
        assert_eq!(run.stderr, "");
        assert!(run.truncated);
    }

    #[test]
    fn test_invalid_utf8_never_exceeds_cap() {
        let mut capture = OutputCapture::new(4);
        capture.push(OutputChunk::Stdout(vec![0xff, 0xfe, b'a', 0xf0, 0x9f]));
        let out = capture.take();
        assert!(out.stdout.len() <= 4);
        assert!(out.truncated);
    }

    #[test]
    fn test_split_multibyte_char_is_dropped() {
        // "é" is two bytes; the cap lands between them.
        let mut capture = OutputCapture::new(3);
        capture.push(OutputChunk::Stdout("aé".as_bytes().to_vec()));
        capture.push(OutputChunk::Stdout("é".as_bytes().to_vec()));
        let out = capture.take();
        assert_eq!(out.stdout, "aé");
        assert!(out.truncated);
    }
}
