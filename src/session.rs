//! Conversation session: turns a human's messages into reply and extraction
//! jobs for one subject.

use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use crate::error::PipelineError;
use crate::knowledge::Reply;
use crate::llm::ChatMessage;
use crate::pipeline::prompts::build_response_system_prompt;
use crate::pipeline::{ConversationMessage, ExtractionContext, ExtractionOrchestrator};
use crate::queue::JobId;
use crate::worker::WorkerLoop;

/// Earlier messages shown to extraction as background.
const CONTEXT_WINDOW: usize = 10;

/// Prior turns sent along with a reply request.
const HISTORY_WINDOW: usize = 20;

const HUMAN_SPEAKER: &str = "human";

/// Jobs queued for one human message.
#[derive(Debug)]
pub struct QueuedTurn {
    pub response: JobId,
    pub scans: Vec<JobId>,
}

pub struct Session {
    subject_id: String,
    display_name: String,
    orchestrator: ExtractionOrchestrator,
    worker: Arc<WorkerLoop>,
    messages: Vec<ConversationMessage>,
    /// Index of the first message not yet sent to extraction.
    unscanned_from: usize,
}

impl Session {
    pub fn new(
        subject_id: impl Into<String>,
        display_name: impl Into<String>,
        orchestrator: ExtractionOrchestrator,
        worker: Arc<WorkerLoop>,
    ) -> Self {
        Self {
            subject_id: subject_id.into(),
            display_name: display_name.into(),
            orchestrator,
            worker,
            messages: Vec::new(),
            unscanned_from: 0,
        }
    }

    pub fn messages(&self) -> &[ConversationMessage] {
        &self.messages
    }

    /// Record a human message, queue the subject's reply to it, and queue
    /// extraction over everything said since the last scan.
    ///
    /// A reply still being drafted for an earlier message is dropped, in the
    /// queue and in flight.
    pub async fn on_human_message(&mut self, text: &str) -> Result<QueuedTurn, PipelineError> {
        let message = ConversationMessage::new(Uuid::new_v4().to_string(), HUMAN_SPEAKER, text);
        let message_id = message.id.clone();
        self.messages.push(message);

        let superseded = self.worker.cancel_subject_responses(&self.subject_id).await;
        if superseded > 0 {
            debug!(subject_id = %self.subject_id, superseded, "Dropped stale reply");
        }

        let response = self
            .orchestrator
            .queue_subject_response(
                &self.subject_id,
                vec![message_id],
                build_response_system_prompt(&self.display_name),
                text,
                self.history(),
            )
            .await;

        let scans = self.orchestrator.queue_all_scans(self.extraction_context()).await?;
        self.unscanned_from = self.messages.len();
        Ok(QueuedTurn { response, scans })
    }

    /// Record the subject's reply so later turns see it.
    pub fn on_reply(&mut self, reply: &Reply) {
        if reply.subject_id != self.subject_id {
            return;
        }
        match &reply.content {
            Some(content) => self.messages.push(ConversationMessage::new(
                Uuid::new_v4().to_string(),
                self.display_name.clone(),
                content.clone(),
            )),
            None => debug!(subject_id = %self.subject_id, "Silence not added to conversation"),
        }
    }

    /// Chat turns before the newest message.
    fn history(&self) -> Vec<ChatMessage> {
        let earlier = &self.messages[..self.messages.len().saturating_sub(1)];
        let start = earlier.len().saturating_sub(HISTORY_WINDOW);
        earlier[start..]
            .iter()
            .map(|m| {
                if m.speaker == HUMAN_SPEAKER {
                    ChatMessage::user(&m.content)
                } else {
                    ChatMessage::assistant(&m.content)
                }
            })
            .collect()
    }

    fn extraction_context(&self) -> ExtractionContext {
        let context_start = self.unscanned_from.saturating_sub(CONTEXT_WINDOW);
        ExtractionContext::new(&self.subject_id, &self.display_name)
            .with_context(self.messages[context_start..self.unscanned_from].to_vec())
            .with_analyze(self.messages[self.unscanned_from..].to_vec())
    }
}
