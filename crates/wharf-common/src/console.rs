//! Console passthrough for worker scopes.
//!
//! Worker scripts get a `console` global; its output is forwarded to the
//! host's `tracing` subscriber rather than standard streams, so worker
//! output carries the same structure as the rest of the runtime's logs.

/// A named console handle injected into a worker scope.
#[derive(Debug, Clone)]
pub struct Console {
    name: String,
}

impl Console {
    /// Create a console labeled with the owning worker's name.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// The worker label attached to every emitted event.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn log(&self, message: &str) {
        tracing::info!(target: "wharf::console", worker = %self.name, "{}", message);
    }

    pub fn debug(&self, message: &str) {
        tracing::debug!(target: "wharf::console", worker = %self.name, "{}", message);
    }

    pub fn warn(&self, message: &str) {
        tracing::warn!(target: "wharf::console", worker = %self.name, "{}", message);
    }

    pub fn error(&self, message: &str) {
        tracing::error!(target: "wharf::console", worker = %self.name, "{}", message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_console_label() {
        let console = Console::new("https://example.com/worker.js");
        assert_eq!(console.name(), "https://example.com/worker.js");
    }

    #[test]
    fn test_console_emits_without_subscriber() {
        // Emitting with no subscriber installed must be a no-op, not a panic.
        let console = Console::new("worker");
        console.log("hello");
        console.debug("hello");
        console.warn("hello");
        console.error("hello");
    }
}
