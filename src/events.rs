//! Progress and error event streaming for long-running operations.
//!
//! Long-running operations (Init, install, upgrade) do not return a single
//! final result; they emit a sequence of discrete events through a
//! [`ProgressSink`]. Events are delivered synchronously, in call order, from
//! the thread driving the operation. A sink is optional: operations invoked
//! without one simply drop their events.
//!
//! Best-effort aggregate operations report every individual failure as an
//! [`Event::Error`] instead of aborting on the first one.

use std::sync::Arc;

/// One step of a multi-step task ("Installing avr-gcc@7.3.0").
#[derive(Debug, Clone, Default)]
pub struct TaskProgress {
    pub name: String,
    pub message: String,
    pub completed: bool,
}

/// Transfer progress for a single download.
#[derive(Debug, Clone, Default)]
pub struct DownloadProgress {
    pub file: String,
    pub total_size: u64,
    pub downloaded: u64,
    pub completed: bool,
}

/// A discrete progress event.
#[derive(Debug, Clone)]
pub enum Event {
    Task(TaskProgress),
    Download(DownloadProgress),
    /// A non-fatal failure inside a best-effort operation.
    Error(String),
}

/// Synchronous event consumer handed to long-running operations.
///
/// The callback is invoked inline and must not block the caller
/// indefinitely. Cloning a sink shares the underlying callback.
#[derive(Clone, Default)]
pub struct ProgressSink {
    callback: Option<Arc<dyn Fn(Event) + Send + Sync>>,
}

impl ProgressSink {
    pub fn new(callback: impl Fn(Event) + Send + Sync + 'static) -> Self {
        Self {
            callback: Some(Arc::new(callback)),
        }
    }

    /// A sink that drops every event.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn send(&self, event: Event) {
        if let Some(cb) = &self.callback {
            cb(event);
        }
    }

    pub fn task_started(&self, name: impl Into<String>) {
        self.send(Event::Task(TaskProgress {
            name: name.into(),
            ..Default::default()
        }));
    }

    pub fn task_message(&self, message: impl Into<String>) {
        self.send(Event::Task(TaskProgress {
            message: message.into(),
            ..Default::default()
        }));
    }

    pub fn task_completed(&self, message: impl Into<String>) {
        self.send(Event::Task(TaskProgress {
            message: message.into(),
            completed: true,
            ..Default::default()
        }));
    }

    pub fn error(&self, message: impl Into<String>) {
        self.send(Event::Error(message.into()));
    }

    pub fn download(&self, file: &str, total_size: u64, downloaded: u64, completed: bool) {
        self.send(Event::Download(DownloadProgress {
            file: file.to_string(),
            total_size,
            downloaded,
            completed,
        }));
    }
}

impl std::fmt::Debug for ProgressSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressSink")
            .field("attached", &self.callback.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_events_delivered_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let seen = Arc::clone(&seen);
            ProgressSink::new(move |ev| seen.lock().unwrap().push(ev))
        };

        sink.task_started("a");
        sink.error("b");
        sink.task_completed("c");

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert!(matches!(&seen[0], Event::Task(t) if t.name == "a" && !t.completed));
        assert!(matches!(&seen[1], Event::Error(m) if m == "b"));
        assert!(matches!(&seen[2], Event::Task(t) if t.completed));
    }

    #[test]
    fn test_task_message_is_an_intermediate_step() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let seen = Arc::clone(&seen);
            ProgressSink::new(move |ev| seen.lock().unwrap().push(ev))
        };

        sink.task_message("still working");

        let seen = seen.lock().unwrap();
        assert!(matches!(
            &seen[0],
            Event::Task(t) if t.name.is_empty() && t.message == "still working" && !t.completed
        ));
    }

    #[test]
    fn test_missing_sink_is_legal() {
        let sink = ProgressSink::none();
        sink.task_started("dropped");
        sink.error("also dropped");
    }
}
