//! Warning sink for non-fatal degradations.
//!
//! Components never keep their own "already warned" flags. They receive a
//! [`Diagnostics`] handle and report through it; the sink owns de-duplication.

use crate::attention::AttentionImpl;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// Identity of a warning for de-duplication purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WarningKey {
    /// Attention weights were requested from a backend that cannot return
    /// them; the eager backend ran instead.
    AttentionWeightsFallback {
        /// Backend that was configured.
        requested: AttentionImpl,
    },
    /// Inputs arrived in a different dtype than the weights and were cast.
    InputUpcast {
        /// Input dtype.
        from: &'static str,
        /// Weight dtype.
        to: &'static str,
    },
    /// The rotary table was extended past the training length without a
    /// scaling policy.
    RopeTableRegrown,
}

/// Destination for de-duplicated warnings.
pub trait DiagnosticsSink: Send + Sync + fmt::Debug {
    /// Report `message` unless `key` was already reported. Returns whether the
    /// warning was emitted.
    fn warn_once(&self, key: WarningKey, message: &str) -> bool;

    /// Messages retained by the sink, if it retains any.
    fn recorded(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Sink that forwards the first occurrence of each warning to `tracing`.
#[derive(Debug, Default)]
pub struct TracingDiagnostics {
    seen: Mutex<HashSet<WarningKey>>,
}

impl DiagnosticsSink for TracingDiagnostics {
    fn warn_once(&self, key: WarningKey, message: &str) -> bool {
        if !self.seen.lock().insert(key) {
            return false;
        }
        tracing::warn!(?key, "{message}");
        true
    }
}

/// Sink that keeps warnings in memory so callers can surface them.
#[derive(Debug, Default)]
pub struct MemoryDiagnostics {
    seen: Mutex<HashSet<WarningKey>>,
    messages: Mutex<Vec<String>>,
}

impl DiagnosticsSink for MemoryDiagnostics {
    fn warn_once(&self, key: WarningKey, message: &str) -> bool {
        if !self.seen.lock().insert(key) {
            return false;
        }
        self.messages.lock().push(message.to_string());
        true
    }

    fn recorded(&self) -> Vec<String> {
        self.messages.lock().clone()
    }
}

/// Cloneable handle to a shared [`DiagnosticsSink`].
#[derive(Debug, Clone)]
pub struct Diagnostics {
    sink: Arc<dyn DiagnosticsSink>,
}

impl Diagnostics {
    /// Wrap a custom sink.
    pub fn new(sink: Arc<dyn DiagnosticsSink>) -> Self {
        Self { sink }
    }

    /// Handle backed by [`TracingDiagnostics`].
    pub fn tracing() -> Self {
        Self::new(Arc::new(TracingDiagnostics::default()))
    }

    /// Handle backed by [`MemoryDiagnostics`].
    pub fn memory() -> Self {
        Self::new(Arc::new(MemoryDiagnostics::default()))
    }

    /// Report a warning once per key.
    pub fn warn_once(&self, key: WarningKey, message: &str) -> bool {
        self.sink.warn_once(key, message)
    }

    /// Messages retained by the underlying sink.
    pub fn recorded(&self) -> Vec<String> {
        self.sink.recorded()
    }
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::tracing()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_sink_deduplicates() {
        let diagnostics = Diagnostics::memory();
        let key = WarningKey::AttentionWeightsFallback {
            requested: AttentionImpl::ScaledDotProduct,
        };

        assert!(diagnostics.warn_once(key, "falling back"));
        assert!(!diagnostics.warn_once(key, "falling back"));
        assert_eq!(diagnostics.recorded(), vec!["falling back".to_string()]);
    }

    #[test]
    fn distinct_keys_both_reported() {
        let diagnostics = Diagnostics::memory();
        assert!(diagnostics.warn_once(
            WarningKey::InputUpcast {
                from: "f16",
                to: "f32"
            },
            "upcast"
        ));
        assert!(diagnostics.warn_once(WarningKey::RopeTableRegrown, "regrown"));
        assert_eq!(diagnostics.recorded().len(), 2);
    }

    #[test]
    fn clones_share_state() {
        let diagnostics = Diagnostics::memory();
        let other = diagnostics.clone();
        assert!(diagnostics.warn_once(WarningKey::RopeTableRegrown, "once"));
        assert!(!other.warn_once(WarningKey::RopeTableRegrown, "once"));
    }

    /// Writer collecting formatted events for inspection.
    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn tracing_sink_deduplicates() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();

        let sink = TracingDiagnostics::default();
        tracing::subscriber::with_default(subscriber, || {
            assert!(sink.warn_once(WarningKey::RopeTableRegrown, "first"));
            assert!(!sink.warn_once(WarningKey::RopeTableRegrown, "second"));
        });
        assert!(sink.recorded().is_empty());

        let output = String::from_utf8(captured.0.lock().clone()).unwrap();
        assert_eq!(output.matches("WARN").count(), 1);
        assert!(output.contains("first"));
        assert!(!output.contains("second"));
        assert!(output.contains("RopeTableRegrown"));
    }
}
