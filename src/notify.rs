//! Escalation notifications.
//!
//! Delivery is fire-and-forget: a failed post is logged and never rolls back
//! state the engine already committed.

use std::sync::Mutex;

use thiserror::Error;

use crate::state::ProjectId;

/// Marker prefix external tooling can search for to detect a breaker escalation.
pub const ESCALATION_MARKER_PREFIX: &str = "STAGEWARDEN_CIRCUIT_BREAKER";

#[derive(Debug, Error)]
#[error("notification delivery failed: {0}")]
pub struct NotifyError(pub String);

/// Destination for human-facing escalation notices.
pub trait NotificationSink: Send + Sync {
    fn post_escalation(
        &self,
        project: &ProjectId,
        reason: &str,
        details: &str,
    ) -> Result<(), NotifyError>;
}

/// Post through `sink`, logging (not propagating) delivery failures.
pub fn post_escalation(sink: &dyn NotificationSink, project: &ProjectId, reason: &str, details: &str) {
    if let Err(e) = sink.post_escalation(project, reason, details) {
        tracing::warn!(project = %project, "escalation notice not delivered: {e}");
    }
}

/// Machine-detectable marker embedded in escalation messages.
pub fn escalation_marker(reason: &str) -> String {
    format!("<!-- {}:{} -->", ESCALATION_MARKER_PREFIX, reason.replace("-->", "->"))
}

/// Whether `content` already carries an escalation marker.
pub fn has_escalation_marker(content: &str) -> bool {
    content.contains(&format!("<!-- {}:", ESCALATION_MARKER_PREFIX))
}

/// Markdown escalation message with the marker and handle mentions.
pub fn escalation_message(project: &ProjectId, reason: &str, details: &str, notify: &[String]) -> String {
    let mentions = notify
        .iter()
        .map(|handle| format!("@{}", handle.trim_start_matches('@')))
        .collect::<Vec<_>>()
        .join(" ");

    let mut message = String::new();
    message.push_str("## Pipeline Escalated\n\n");
    message.push_str(&escalation_marker(reason));
    message.push_str("\n\n");
    message.push_str(&format!("**Reason:** {}\n", reason));
    message.push_str(&format!("**Project:** {}\n", project));
    if !details.is_empty() {
        message.push_str(&format!("**Details:** {}\n", details));
    }
    message.push('\n');
    if !mentions.is_empty() {
        message.push_str(&format!("{} - Human intervention required.\n\n", mentions));
    } else {
        message.push_str("Human intervention required.\n\n");
    }
    message.push_str(
        "Autonomous processing is paused. Review the project, then reset the tripped \
         ceiling or resolve the escalation to resume.\n",
    );
    message
}

/// Sink that writes escalation messages to the tracing log.
#[derive(Debug, Default, Clone)]
pub struct LogSink {
    pub notify: Vec<String>,
}

impl LogSink {
    pub fn new(notify: Vec<String>) -> Self {
        Self { notify }
    }
}

impl NotificationSink for LogSink {
    fn post_escalation(
        &self,
        project: &ProjectId,
        reason: &str,
        details: &str,
    ) -> Result<(), NotifyError> {
        let message = escalation_message(project, reason, details, &self.notify);
        tracing::warn!(project = %project, reason, "{message}");
        Ok(())
    }
}

/// Escalation notice captured by [`RecordingSink`].
#[derive(Debug, Clone, PartialEq)]
pub struct PostedEscalation {
    pub project: ProjectId,
    pub reason: String,
    pub details: String,
}

/// Sink that keeps every notice in memory, for embedding callers and tests.
#[derive(Debug, Default)]
pub struct RecordingSink {
    posted: Mutex<Vec<PostedEscalation>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn posted(&self) -> Vec<PostedEscalation> {
        self.posted
            .lock()
            .map(|posted| posted.clone())
            .unwrap_or_default()
    }
}

impl NotificationSink for RecordingSink {
    fn post_escalation(
        &self,
        project: &ProjectId,
        reason: &str,
        details: &str,
    ) -> Result<(), NotifyError> {
        let mut posted = self
            .posted
            .lock()
            .map_err(|_| NotifyError("recording sink poisoned".to_string()))?;
        posted.push(PostedEscalation {
            project: project.clone(),
            reason: reason.to_string(),
            details: details.to_string(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingSink;

    impl NotificationSink for FailingSink {
        fn post_escalation(&self, _: &ProjectId, _: &str, _: &str) -> Result<(), NotifyError> {
            Err(NotifyError("webhook unreachable".into()))
        }
    }

    fn id() -> ProjectId {
        ProjectId::parse("project-12").unwrap()
    }

    #[test]
    fn message_carries_marker_reason_and_mentions() {
        let msg = escalation_message(
            &id(),
            "Max agent invocations (20) reached",
            "",
            &["alice".into(), "@ops-team".into()],
        );
        assert!(msg.contains("<!-- STAGEWARDEN_CIRCUIT_BREAKER:Max agent invocations (20) reached -->"));
        assert!(msg.contains("@alice @ops-team - Human intervention required."));
        assert!(msg.contains("**Project:** project-12"));
        assert!(has_escalation_marker(&msg));
        assert!(!has_escalation_marker("plain comment"));
    }

    #[test]
    fn marker_cannot_be_closed_early_by_the_reason() {
        let marker = escalation_marker("bad --> reason");
        assert_eq!(marker.matches("-->").count(), 1);
    }

    #[test]
    fn failed_delivery_is_swallowed() {
        post_escalation(&FailingSink, &id(), "reason", "details");
    }

    #[test]
    fn recording_sink_keeps_posts_in_order() {
        let sink = RecordingSink::new();
        post_escalation(&sink, &id(), "first", "");
        post_escalation(&sink, &id(), "second", "d");
        let posted = sink.posted();
        assert_eq!(posted.len(), 2);
        assert_eq!(posted[1].reason, "second");
        assert_eq!(posted[1].details, "d");
    }
}
