//! Shared output sink for pipeline and subprocess text.

use std::io::Write;
use std::sync::{Arc, Mutex};

/// Where build, deploy and log text goes. A single sink is shared by the
/// runner and every background task so interleaving stays line-oriented.
pub struct Output {
    inner: Mutex<Box<dyn Write + Send>>,
}

impl Output {
    pub fn new(w: Box<dyn Write + Send>) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(w),
        })
    }

    pub fn stdout() -> Arc<Self> {
        Self::new(Box::new(std::io::stdout()))
    }

    /// Discards everything written to it.
    pub fn sink() -> Arc<Self> {
        Self::new(Box::new(std::io::sink()))
    }

    /// Captures into a shared buffer, for assertions in tests.
    pub fn buffer() -> (Arc<Self>, Arc<Mutex<Vec<u8>>>) {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let writer = SharedBuf(Arc::clone(&buf));
        (Self::new(Box::new(writer)), buf)
    }

    pub fn write_line(&self, line: &str) {
        let mut w = self.inner.lock().unwrap();
        let _ = writeln!(w, "{}", line);
        let _ = w.flush();
    }

    pub fn write_raw(&self, text: &str) {
        let mut w = self.inner.lock().unwrap();
        let _ = write!(w, "{}", text);
        let _ = w.flush();
    }
}

struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
