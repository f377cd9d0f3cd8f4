//! Thread-scoped output capture.
//!
//! Rust has no per-thread standard streams, so capture is an explicit
//! sink: while a [`CaptureScope`] is active on a thread, everything
//! written through [`write_stdout`], [`write_stderr`] or the
//! [`capture_print!`](crate::capture_print) family lands in that scope's
//! buffer instead of the process streams. Scopes on different threads
//! never see each other's text.
//!
//! The previous state is restored when the scope finishes or is dropped,
//! including during a panic unwind.
//!
//! # Example
//!
//! ```
//! use shardline::capture::{self, CaptureScope};
//!
//! let scope = CaptureScope::begin(false);
//! capture::write_stdout("hello\n");
//! let captured = scope.finish();
//! assert_eq!(captured.stdout, "hello\n");
//! assert!(!capture::is_active());
//! ```

use std::cell::RefCell;
use std::io::Write;
use std::marker::PhantomData;

/// Text captured by one scope.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Captured {
    pub stdout: String,
    pub stderr: String,
}

impl Captured {
    pub fn is_empty(&self) -> bool {
        self.stdout.is_empty() && self.stderr.is_empty()
    }
}

struct Sink {
    captured: Captured,
    echo: bool,
}

thread_local! {
    static ACTIVE: RefCell<Option<Sink>> = const { RefCell::new(None) };
}

/// Guard redirecting this thread's captured writes into a fresh buffer.
///
/// Not `Send`: a scope belongs to the thread that opened it.
pub struct CaptureScope {
    previous: Option<Sink>,
    finished: bool,
    _thread_bound: PhantomData<*const ()>,
}

impl CaptureScope {
    /// Opens a scope. With `echo`, writes also go to the process streams.
    pub fn begin(echo: bool) -> Self {
        let fresh = Sink {
            captured: Captured::default(),
            echo,
        };
        let previous = ACTIVE.with(|active| active.replace(Some(fresh)));
        Self {
            previous,
            finished: false,
            _thread_bound: PhantomData,
        }
    }

    /// Closes the scope, returning what was captured.
    pub fn finish(mut self) -> Captured {
        self.finished = true;
        let previous = self.previous.take();
        ACTIVE
            .with(|active| active.replace(previous))
            .map(|sink| sink.captured)
            .unwrap_or_default()
    }
}

impl Drop for CaptureScope {
    fn drop(&mut self) {
        if !self.finished {
            let previous = self.previous.take();
            let _ = ACTIVE.try_with(|active| active.replace(previous));
        }
    }
}

/// Returns true if a capture scope is active on this thread.
pub fn is_active() -> bool {
    ACTIVE.with(|active| active.borrow().is_some())
}

/// Writes to the active scope's stdout buffer, or to the process stdout.
pub fn write_stdout(text: &str) {
    write_to(text, false);
}

/// Writes to the active scope's stderr buffer, or to the process stderr.
pub fn write_stderr(text: &str) {
    write_to(text, true);
}

fn write_to(text: &str, is_err: bool) {
    let passthrough = ACTIVE.with(|active| match active.borrow_mut().as_mut() {
        Some(sink) => {
            if is_err {
                sink.captured.stderr.push_str(text);
            } else {
                sink.captured.stdout.push_str(text);
            }
            sink.echo
        }
        None => true,
    });

    if passthrough {
        if is_err {
            let _ = std::io::stderr().lock().write_all(text.as_bytes());
        } else {
            let _ = std::io::stdout().lock().write_all(text.as_bytes());
        }
    }
}

/// Like `print!`, but honors the active capture scope.
#[macro_export]
macro_rules! capture_print {
    ($($arg:tt)*) => {
        $crate::capture::write_stdout(&format!($($arg)*))
    };
}

/// Like `println!`, but honors the active capture scope.
#[macro_export]
macro_rules! capture_println {
    () => {
        $crate::capture::write_stdout("\n")
    };
    ($($arg:tt)*) => {{
        let mut line = format!($($arg)*);
        line.push('\n');
        $crate::capture::write_stdout(&line)
    }};
}

/// Like `eprintln!`, but honors the active capture scope.
#[macro_export]
macro_rules! capture_eprintln {
    ($($arg:tt)*) => {{
        let mut line = format!($($arg)*);
        line.push('\n');
        $crate::capture::write_stderr(&line)
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_stdout_and_stderr() {
        let scope = CaptureScope::begin(false);
        capture_println!("out {}", 1);
        capture_eprintln!("err {}", 2);
        capture_print!("tail");
        let captured = scope.finish();
        assert_eq!(captured.stdout, "out 1\ntail");
        assert_eq!(captured.stderr, "err 2\n");
        assert!(!is_active());
    }

    #[test]
    fn test_nested_scopes_restore_outer() {
        let outer = CaptureScope::begin(false);
        write_stdout("a");
        let inner = CaptureScope::begin(false);
        write_stdout("b");
        assert_eq!(inner.finish().stdout, "b");
        write_stdout("c");
        assert_eq!(outer.finish().stdout, "ac");
    }

    #[test]
    fn test_dropped_scope_restores_on_panic() {
        let outer = CaptureScope::begin(false);
        let result = std::panic::catch_unwind(|| {
            let _inner = CaptureScope::begin(false);
            write_stdout("lost");
            panic!("test body failed");
        });
        assert!(result.is_err());
        write_stdout("kept");
        assert_eq!(outer.finish().stdout, "kept");
        assert!(!is_active());
    }

    #[test]
    fn test_scopes_are_thread_local() {
        let handles: Vec<_> = (0..4)
            .map(|i| {
                std::thread::spawn(move || {
                    let scope = CaptureScope::begin(false);
                    for _ in 0..100 {
                        write_stdout(&i.to_string());
                        std::thread::yield_now();
                    }
                    scope.finish().stdout
                })
            })
            .collect();

        for (i, handle) in handles.into_iter().enumerate() {
            let out = handle.join().unwrap();
            assert_eq!(out, i.to_string().repeat(100));
        }
    }
}
