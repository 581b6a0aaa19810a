use std::{
    collections::VecDeque,
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard},
};

use tokio::{io::AsyncWriteExt, sync::mpsc};

pub const DEFAULT_CONSOLE_LINES: usize = 50;

/// Longest run of bytes held back waiting for a newline. Anything longer is
/// emitted as its own line.
pub const MAX_PARTIAL_LINE: usize = 16 * 1024;

/// Splits a byte stream into lines. `\r\n` endings are normalized and
/// invalid UTF-8 is replaced lossily.
#[derive(Debug, Default)]
pub(crate) struct LineAssembler {
    // Bytes after the last newline; kept raw so split UTF-8 sequences survive.
    partial: Vec<u8>,
}

fn decode_line(mut raw: Vec<u8>) -> String {
    if raw.last() == Some(&b'\r') {
        raw.pop();
    }
    String::from_utf8_lossy(&raw).into_owned()
}

impl LineAssembler {
    pub(crate) fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        self.partial.extend_from_slice(bytes);
        let mut out = Vec::new();
        while let Some(pos) = self.partial.iter().position(|b| *b == b'\n') {
            let mut raw: Vec<u8> = self.partial.drain(..=pos).collect();
            raw.pop();
            out.push(decode_line(raw));
        }
        while self.partial.len() >= MAX_PARTIAL_LINE {
            let raw: Vec<u8> = self.partial.drain(..MAX_PARTIAL_LINE).collect();
            out.push(decode_line(raw));
        }
        out
    }

    /// Whatever is left once the stream has ended.
    pub(crate) fn finish(&mut self) -> Option<String> {
        if self.partial.is_empty() {
            return None;
        }
        Some(decode_line(std::mem::take(&mut self.partial)))
    }

    fn clear(&mut self) {
        self.partial.clear();
    }

    #[cfg(test)]
    fn pending(&self) -> usize {
        self.partial.len()
    }
}

#[derive(Debug)]
struct ConsoleBuffer {
    next_seq: u64,
    capacity: usize,
    lines: VecDeque<(u64, String)>,
    assembler: LineAssembler,
}

impl ConsoleBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            next_seq: 1,
            capacity: capacity.max(1),
            lines: VecDeque::new(),
            assembler: LineAssembler::default(),
        }
    }

    fn push_line(&mut self, line: String) {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.saturating_add(1);
        self.lines.push_back((seq, line));
        while self.lines.len() > self.capacity {
            self.lines.pop_front();
        }
    }

    fn tail_after(&self, cursor: u64, limit: usize) -> (Vec<String>, u64) {
        // Cursor 0 means "the most recent lines".
        if cursor == 0 {
            let start = self.lines.len().saturating_sub(limit);
            let mut out = Vec::new();
            let mut last = 0;
            for (seq, line) in self.lines.iter().skip(start) {
                out.push(line.clone());
                last = *seq;
            }
            return (out, last);
        }

        let mut out = Vec::new();
        let mut last = cursor;
        for (seq, line) in self.lines.iter() {
            if *seq > cursor {
                out.push(line.clone());
                last = *seq;
                if out.len() >= limit {
                    break;
                }
            }
        }
        (out, last)
    }
}

/// Bounded line buffer shared between a process output copier and any
/// number of readers.
#[derive(Clone, Debug)]
pub struct ConsoleSink {
    buffer: Arc<Mutex<ConsoleBuffer>>,
    file_tx: Option<mpsc::UnboundedSender<String>>,
}

impl Default for ConsoleSink {
    fn default() -> Self {
        Self::new(DEFAULT_CONSOLE_LINES)
    }
}

impl ConsoleSink {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: Arc::new(Mutex::new(ConsoleBuffer::new(capacity))),
            file_tx: None,
        }
    }

    /// Like [`ConsoleSink::new`], but every line is also appended to `path`,
    /// which rolls over to `path.1`..`path.<keep>` once it exceeds `max_bytes`.
    /// Must be called inside a tokio runtime.
    pub fn with_file_mirror(capacity: usize, path: PathBuf, max_bytes: u64, keep: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel::<String>();
        tokio::spawn(ConsoleLog::run(path, max_bytes, keep, rx));

        Self {
            buffer: Arc::new(Mutex::new(ConsoleBuffer::new(capacity))),
            file_tx: Some(tx),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ConsoleBuffer> {
        self.buffer.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn mirror(&self, lines: &[String]) {
        if let Some(tx) = &self.file_tx {
            for line in lines {
                let _ = tx.send(line.clone());
            }
        }
    }

    /// Appends raw output. Content after the last newline is held back until
    /// a later write completes it, [`ConsoleSink::close`] flushes it, or it
    /// reaches [`MAX_PARTIAL_LINE`] bytes.
    pub fn write(&self, bytes: &[u8]) {
        let lines = {
            let mut buf = self.lock();
            let lines = buf.assembler.feed(bytes);
            for line in &lines {
                buf.push_line(line.clone());
            }
            lines
        };
        self.mirror(&lines);
    }

    pub fn push_line(&self, line: impl Into<String>) {
        let line = line.into();
        self.lock().push_line(line.clone());
        self.mirror(std::slice::from_ref(&line));
    }

    /// Flushes held partial content as a final, unterminated line.
    pub fn close(&self) {
        let line = {
            let mut buf = self.lock();
            let Some(line) = buf.assembler.finish() else {
                return;
            };
            buf.push_line(line.clone());
            line
        };
        self.mirror(std::slice::from_ref(&line));
    }

    pub fn read_all(&self) -> Vec<String> {
        self.lock().lines.iter().map(|(_, l)| l.clone()).collect()
    }

    pub fn tail_after(&self, cursor: u64, limit: usize) -> (Vec<String>, u64) {
        self.lock().tail_after(cursor, limit)
    }

    /// Sequence number of the newest line (0 when nothing was written yet).
    pub fn last_seq(&self) -> u64 {
        self.lock().next_seq.saturating_sub(1)
    }

    /// Drops buffered lines and any partial content. Sequence numbers keep
    /// increasing so existing cursors stay valid.
    pub fn clear(&self) {
        let mut buf = self.lock();
        buf.lines.clear();
        buf.assembler.clear();
    }

    pub fn capacity(&self) -> usize {
        self.lock().capacity
    }
}

const MIRROR_BATCH: usize = 256;

/// Append-only console log with numbered backups, `.1` being the newest.
struct ConsoleLog {
    path: PathBuf,
    max_bytes: u64,
    keep: usize,
    len: u64,
    file: tokio::fs::File,
}

impl ConsoleLog {
    async fn run(path: PathBuf, max_bytes: u64, keep: usize, mut rx: mpsc::UnboundedReceiver<String>) {
        let mut log = match Self::open(path.clone(), max_bytes, keep).await {
            Ok(log) => log,
            Err(err) => {
                tracing::warn!(%err, path = %path.display(), "console log file unavailable");
                return;
            }
        };

        let mut batch = Vec::with_capacity(MIRROR_BATCH);
        let mut failing = false;
        while rx.recv_many(&mut batch, MIRROR_BATCH).await > 0 {
            match log.append(&batch).await {
                Ok(()) if failing => {
                    failing = false;
                    tracing::info!(path = %path.display(), "console log writes resumed");
                }
                Ok(()) => {}
                // Reported once per failure streak.
                Err(err) if !failing => {
                    failing = true;
                    tracing::warn!(%err, path = %path.display(), "console log write failed");
                }
                Err(_) => {}
            }
            batch.clear();
        }
    }

    async fn open(path: PathBuf, max_bytes: u64, keep: usize) -> std::io::Result<Self> {
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        let len = file.metadata().await?.len();
        Ok(Self {
            path,
            max_bytes,
            keep: keep.max(1),
            len,
            file,
        })
    }

    fn backup(&self, n: usize) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(format!(".{n}"));
        PathBuf::from(name)
    }

    /// Shifts `.n` to `.n+1` (dropping the oldest) and starts a fresh file.
    async fn roll(&mut self) -> std::io::Result<()> {
        self.file.flush().await?;
        match tokio::fs::remove_file(self.backup(self.keep)).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e),
            _ => {}
        }
        for n in (1..self.keep).rev() {
            match tokio::fs::rename(self.backup(n), self.backup(n + 1)).await {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e),
                _ => {}
            }
        }
        match tokio::fs::rename(&self.path, self.backup(1)).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e),
            _ => {}
        }
        self.file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        self.len = 0;
        Ok(())
    }

    async fn append(&mut self, lines: &[String]) -> std::io::Result<()> {
        let mut chunk = Vec::new();
        for line in lines {
            let size = line.len() as u64 + 1;
            let pending = self.len + chunk.len() as u64;
            if self.max_bytes > 0 && pending > 0 && pending + size > self.max_bytes {
                self.file.write_all(&chunk).await?;
                self.len += chunk.len() as u64;
                chunk.clear();
                self.roll().await?;
            }
            chunk.extend_from_slice(line.as_bytes());
            chunk.push(b'\n');
        }
        self.file.write_all(&chunk).await?;
        self.file.flush().await?;
        self.len += chunk.len() as u64;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_most_recent_lines_in_order() {
        let sink = ConsoleSink::new(3);
        for i in 0..10 {
            sink.push_line(format!("line {i}"));
        }
        assert_eq!(sink.read_all(), vec!["line 7", "line 8", "line 9"]);
    }

    #[test]
    fn write_splits_lines_and_holds_partial() {
        let sink = ConsoleSink::new(10);
        sink.write(b"hello\r\nwor");
        assert_eq!(sink.read_all(), vec!["hello"]);
        sink.write(b"ld\nnext");
        assert_eq!(sink.read_all(), vec!["hello", "world"]);
        sink.close();
        assert_eq!(sink.read_all(), vec!["hello", "world", "next"]);
    }

    #[test]
    fn close_without_partial_adds_nothing() {
        let sink = ConsoleSink::new(10);
        sink.write(b"a\n");
        sink.close();
        assert_eq!(sink.read_all(), vec!["a"]);
    }

    #[test]
    fn multibyte_char_split_across_writes() {
        let sink = ConsoleSink::new(10);
        let bytes = "héllo\n".as_bytes();
        sink.write(&bytes[..2]);
        sink.write(&bytes[2..]);
        assert_eq!(sink.read_all(), vec!["héllo"]);
    }

    #[test]
    fn tail_after_cursor() {
        let sink = ConsoleSink::new(100);
        for i in 1..=5 {
            sink.push_line(format!("{i}"));
        }
        let (recent, cursor) = sink.tail_after(0, 2);
        assert_eq!(recent, vec!["4", "5"]);
        assert_eq!(cursor, 5);

        sink.push_line("6");
        let (next, cursor) = sink.tail_after(cursor, 10);
        assert_eq!(next, vec!["6"]);
        assert_eq!(cursor, 6);

        let (none, same) = sink.tail_after(cursor, 10);
        assert!(none.is_empty());
        assert_eq!(same, 6);
    }

    #[test]
    fn clear_keeps_sequence_monotonic() {
        let sink = ConsoleSink::new(10);
        sink.push_line("a");
        sink.write(b"partial");
        sink.clear();
        assert!(sink.read_all().is_empty());
        sink.push_line("b");
        assert_eq!(sink.last_seq(), 2);
        assert_eq!(sink.read_all(), vec!["b"]);
    }

    #[test]
    fn concurrent_writers_and_readers() {
        let sink = ConsoleSink::new(1000);
        let mut handles = Vec::new();
        for t in 0..4 {
            let s = sink.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..100 {
                    s.write(format!("t{t}-{i}\n").as_bytes());
                }
            }));
        }
        let reader = {
            let s = sink.clone();
            std::thread::spawn(move || {
                for _ in 0..100 {
                    for line in s.read_all() {
                        assert!(line.starts_with('t'));
                    }
                }
            })
        };
        for h in handles {
            h.join().unwrap();
        }
        reader.join().unwrap();
        assert_eq!(sink.read_all().len(), 400);
    }

    #[tokio::test]
    async fn file_mirror_rotates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("console.log");
        let sink = ConsoleSink::with_file_mirror(10, path.clone(), 16, 2);
        for i in 0..6 {
            sink.push_line(format!("line-{i}"));
        }

        let mut rotated = false;
        for _ in 0..50 {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            if dir.path().join("logs").join("console.log.1").exists() {
                rotated = true;
                break;
            }
        }
        assert!(rotated);
        assert!(!dir.path().join("logs").join("console.log.3").exists());
    }

    #[test]
    fn unterminated_output_is_bounded() {
        let sink = ConsoleSink::new(10);
        let chunk = vec![b'x'; 1024 * 1024];
        for _ in 0..4 {
            sink.write(&chunk);
        }
        assert!(sink.lock().assembler.pending() < MAX_PARTIAL_LINE);
        let lines = sink.read_all();
        assert_eq!(lines.len(), 10);
        assert!(lines.iter().all(|l| l.len() == MAX_PARTIAL_LINE));
    }

    #[test]
    fn invalid_utf8_is_replaced() {
        let mut lines = LineAssembler::default();
        assert_eq!(lines.feed(b"bad \xff byte\r\nok\n"), vec!["bad \u{FFFD} byte", "ok"]);
        assert_eq!(lines.feed(b"tail"), Vec::<String>::new());
        assert_eq!(lines.finish().as_deref(), Some("tail"));
        assert_eq!(lines.finish(), None);
    }

    #[tokio::test]
    async fn file_mirror_keeps_every_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("console.log");
        let sink = ConsoleSink::with_file_mirror(2, path.clone(), 1024 * 1024, 3);
        sink.write(b"one\ntwo\n");
        sink.push_line("three");

        let mut content = String::new();
        for _ in 0..50 {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            content = std::fs::read_to_string(&path).unwrap_or_default();
            if content.lines().count() == 3 {
                break;
            }
        }
        assert_eq!(content, "one\ntwo\nthree\n");
        // The ring only keeps the newest lines; the file keeps them all.
        assert_eq!(sink.read_all(), vec!["two", "three"]);
    }
}
