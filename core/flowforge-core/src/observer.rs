//! Bounded log observer.
//!
//! Captures child output, frames it into lines, redacts secrets, keeps the
//! most recent lines in a fixed-size ring and keeps a running token count.
//! A single mutex covers framing and reads; the token total is atomic so it
//! can be read without contending with writers.

use std::collections::VecDeque;
use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::normalize::normalize;
use crate::redact::redact;
use crate::tokens::TokenCounter;

/// Unterminated output longer than this is framed as a line on its own.
const MAX_PENDING_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingLine {
    /// Redacted text; this is the only form that is ever stored or exported.
    pub text: String,
    /// Redacted then normalized text used by the classifier.
    pub normalized: String,
    pub original_len: usize,
    pub tokens: u64,
}

struct Inner {
    ring: VecDeque<RingLine>,
    pending: Vec<u8>,
    total_lines: u64,
}

pub struct LogObserver {
    capacity: usize,
    counter: TokenCounter,
    inner: Mutex<Inner>,
    total_tokens: AtomicU64,
}

impl LogObserver {
    /// Ring capacity is `2 * log_window`.
    pub fn new(log_window: usize, counter: TokenCounter) -> Self {
        let capacity = log_window.saturating_mul(2).max(1);
        Self {
            capacity,
            counter,
            inner: Mutex::new(Inner {
                ring: VecDeque::with_capacity(capacity),
                pending: Vec::new(),
                total_lines: 0,
            }),
            total_tokens: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn write_bytes(&self, bytes: &[u8]) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.pending.extend_from_slice(bytes);

        while let Some(index) = inner.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = inner.pending.drain(..=index).collect();
            self.push_line(&mut inner, &raw[..raw.len() - 1]);
        }

        if inner.pending.len() > MAX_PENDING_BYTES {
            let raw = std::mem::take(&mut inner.pending);
            self.push_line(&mut inner, &raw);
        }
    }

    /// Frames any unterminated tail. Called once the stream has closed.
    pub fn flush_pending(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if !inner.pending.is_empty() {
            let raw = std::mem::take(&mut inner.pending);
            self.push_line(&mut inner, &raw);
        }
    }

    fn push_line(&self, inner: &mut Inner, raw: &[u8]) {
        let decoded = String::from_utf8_lossy(raw);
        let line = decoded.trim_end_matches('\r');
        let text = redact(line);
        let normalized = normalize(&text);
        let tokens = self.counter.count(&text);

        if inner.ring.len() == self.capacity {
            inner.ring.pop_front();
        }
        inner.ring.push_back(RingLine {
            text,
            normalized,
            original_len: line.len(),
            tokens,
        });
        inner.total_lines += 1;
        self.total_tokens.fetch_add(tokens, Ordering::Relaxed);
    }

    /// Up to `n` most recent lines, oldest first.
    pub fn last_lines(&self, n: usize) -> Vec<String> {
        self.last_entries(n).into_iter().map(|line| line.text).collect()
    }

    pub fn last_normalized(&self, n: usize) -> Vec<String> {
        self.last_entries(n)
            .into_iter()
            .map(|line| line.normalized)
            .collect()
    }

    pub fn last_entries(&self, n: usize) -> Vec<RingLine> {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let skip = inner.ring.len().saturating_sub(n);
        inner.ring.iter().skip(skip).cloned().collect()
    }

    pub fn total_tokens(&self) -> u64 {
        self.total_tokens.load(Ordering::Relaxed)
    }

    pub fn total_lines(&self) -> u64 {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.total_lines
    }
}

/// `Write` adapter that feeds a shared observer.
#[derive(Clone)]
pub struct ObserverSink(pub Arc<LogObserver>);

impl Write for ObserverSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write_bytes(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
