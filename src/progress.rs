//! Progress reporting utilities for export operations
//!
//! This module provides progress callback functionality for the export pipeline,
//! allowing callers to follow individual transformation steps, checkpoint writes
//! and final assembly.

use std::path::PathBuf;

/// Progress callback function type
pub type ProgressFn = Box<dyn Fn(ExportEvent) + Send + Sync>;

/// Events reported during an export
#[derive(Debug, Clone, PartialEq)]
pub enum ExportEvent {
    /// Options validated, export starting
    Started {
        /// Module label used in diagnostics
        label: String,
    },

    /// A transformation step is about to run
    StepStarted {
        /// Step name
        step: String,
        /// Position in the sequence, starting at 1
        index: usize,
        /// Number of steps in the sequence
        total: usize,
    },

    /// A transformation step finished successfully
    StepCompleted {
        /// Step name
        step: String,
    },

    /// Writing externalized variables
    WritingCheckpoint {
        /// Target directory
        dir: PathBuf,
        /// Number of variables
        variables: usize,
    },

    /// Checkpoint written
    CheckpointWritten,

    /// Extracting the graph and assembling the artifact
    Assembling,

    /// Export finished
    Complete {
        /// Nodes in the exported graph
        node_count: usize,
    },
}

impl ExportEvent {
    /// Get a human-readable description of this event
    pub fn description(&self) -> String {
        match self {
            ExportEvent::Started { label } => format!("Exporting {}", label),
            ExportEvent::StepStarted { step, index, total } => {
                format!("Running step [{}/{}]: {}", index, total, step)
            }
            ExportEvent::StepCompleted { step } => format!("Step {} completed", step),
            ExportEvent::WritingCheckpoint { dir, variables } => {
                format!(
                    "Writing {} variable(s) to checkpoint {}",
                    variables,
                    dir.display()
                )
            }
            ExportEvent::CheckpointWritten => "Checkpoint written".to_string(),
            ExportEvent::Assembling => "Assembling exported model...".to_string(),
            ExportEvent::Complete { node_count } => {
                format!("✓ Export complete: {} graph nodes", node_count)
            }
        }
    }

    /// Check if this is a completion event
    pub fn is_complete(&self) -> bool {
        matches!(self, ExportEvent::Complete { .. })
    }
}

/// Default progress reporter that forwards events to `tracing`
pub fn default_progress() -> ProgressFn {
    Box::new(|event: ExportEvent| {
        if event.is_complete() {
            tracing::info!("{}", event.description());
        } else {
            tracing::debug!("{}", event.description());
        }
    })
}

/// Silent progress reporter (no-op)
pub fn silent_progress() -> ProgressFn {
    Box::new(|_event: ExportEvent| {})
}

/// Create a custom progress reporter from a closure
///
/// # Examples
/// ```rust
/// use quant_export::progress::{custom_progress, ExportEvent};
///
/// let progress_fn = custom_progress(|event: ExportEvent| {
///     if let ExportEvent::StepStarted { step, .. } = event {
///         println!("running {}", step);
///     }
/// });
/// ```
pub fn custom_progress<F>(f: F) -> ProgressFn
where
    F: Fn(ExportEvent) + Send + Sync + 'static,
{
    Box::new(f)
}

/// Report an event if a callback is installed
pub(crate) fn report(progress: Option<&ProgressFn>, event: ExportEvent) {
    if let Some(progress_fn) = progress {
        progress_fn(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_event_descriptions() {
        let event = ExportEvent::StepStarted {
            step: "insert_main_function".to_string(),
            index: 1,
            total: 4,
        };
        assert_eq!(
            event.description(),
            "Running step [1/4]: insert_main_function"
        );

        let event = ExportEvent::Complete { node_count: 12 };
        assert_eq!(event.description(), "✓ Export complete: 12 graph nodes");
        assert!(event.is_complete());
    }

    #[test]
    fn test_custom_progress_captures_events() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let events_clone = events.clone();

        let progress_fn = custom_progress(move |event: ExportEvent| {
            events_clone.lock().unwrap().push(event);
        });

        report(Some(&progress_fn), ExportEvent::Assembling);
        report(None, ExportEvent::CheckpointWritten);

        let captured = events.lock().unwrap();
        assert_eq!(captured.as_slice(), [ExportEvent::Assembling]);
    }
}
