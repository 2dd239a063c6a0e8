//! Prompt builders for the three extraction stages and subject replies.
//!
//! Each builder is pure: it validates its inputs and renders a system/user
//! pair. Nothing here touches the queue or the knowledge base.

use crate::error::PromptError;
use crate::knowledge::Entity;

use super::types::{Candidate, Category, ConversationMessage, ExtractionContext};

/// Max characters of a single message included in a prompt.
const MESSAGE_PREVIEW_CHARS: usize = 1000;

/// A rendered system/user prompt pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

// ── Stage 1: scan ───────────────────────────────────────────────────

/// Build the stage-1 prompt asking for candidates of one category.
pub fn build_scan_prompt(category: Category, ctx: &ExtractionContext) -> Result<Prompt, PromptError> {
    validate_context(ctx)?;

    let system = format!(
        "You read conversations between {name} and a human and detect {plural} about the human \
         worth remembering.\n\n\
         {focus}\n\n\
         Respond with ONLY a JSON object:\n\
         {{\"{plural}\": [{{\"typeHint\": \"...\", \"valueHint\": \"...\", \"reason\": \"...\", \"confidence\": 0.0}}]}}\n\n\
         Rules:\n\
         - Only use the messages under \"Analyze\"; earlier messages are background\n\
         - typeHint is a short label (e.g. \"Location\", \"Sibling\"), valueHint the concrete value\n\
         - reason quotes or paraphrases the evidence in one sentence\n\
         - Return an empty array when nothing qualifies",
        name = ctx.subject_display_name,
        plural = category.plural(),
        focus = scan_focus(category),
    );

    Ok(Prompt {
        system,
        user: render_conversation(ctx),
    })
}

fn scan_focus(category: Category) -> &'static str {
    match category {
        Category::Fact => {
            "Facts are stable, verifiable details: where they live, their job, birthdays, \
             possessions. Ignore opinions and moods."
        }
        Category::Trait => {
            "Traits are personality characteristics and habits that show across situations. \
             Ignore one-off reactions."
        }
        Category::Topic => {
            "Topics are subjects the human talks about or cares about: hobbies, projects, \
             interests, concerns."
        }
        Category::Person => {
            "People are individuals in the human's life, named or described by relationship \
             (\"my sister\"). Do not list the human or the assistant."
        }
    }
}

// ── Stage 2: match ──────────────────────────────────────────────────

/// Build the stage-2 prompt asking whether `candidate` is already known.
///
/// `existing` is every stored entity of the category; only names and
/// descriptions are shown to the model.
pub fn build_match_prompt(
    category: Category,
    ctx: &ExtractionContext,
    candidate: &Candidate,
    existing: &[Entity],
) -> Result<Prompt, PromptError> {
    validate_context(ctx)?;
    validate_candidate(candidate)?;

    let system = format!(
        "You decide whether a newly detected {category} is one we already know about.\n\n\
         Respond with ONLY a JSON object:\n\
         {{\"name\": \"...\", \"description\": \"...\", \"confidence\": 0.0}}\n\n\
         Rules:\n\
         - name must be copied exactly from the known list\n\
         - If nothing in the list is the same {category}, respond {{\"name\": \"Not Found\"}}\n\
         - Prefer \"Not Found\" over a loose match"
    );

    let mut user = String::with_capacity(512);
    user.push_str(&format!(
        "Detected {category}:\n  type: {}\n  value: {}\n",
        candidate.type_hint, candidate.value_hint
    ));
    if !candidate.reason.is_empty() {
        user.push_str(&format!("  evidence: {}\n", candidate.reason));
    }

    user.push_str(&format!("\nKnown {}:\n", category.plural()));
    if existing.is_empty() {
        user.push_str("  (none)\n");
    }
    for entity in existing {
        user.push_str(&format!("  - {}", entity.name()));
        if !entity.description().is_empty() {
            user.push_str(&format!(": {}", preview(entity.description(), 200)));
        }
        user.push('\n');
    }

    Ok(Prompt { system, user })
}

// ── Stage 3: update ─────────────────────────────────────────────────

/// Build the stage-3 prompt asking for the entity's updated fields.
///
/// `existing` is `None` when the entity is new.
pub fn build_update_prompt(
    category: Category,
    ctx: &ExtractionContext,
    candidate: &Candidate,
    existing: Option<&Entity>,
) -> Result<Prompt, PromptError> {
    validate_context(ctx)?;
    validate_candidate(candidate)?;

    let system = format!(
        "You maintain a knowledge base about a human. Given a conversation and a {category}, \
         produce its updated record.\n\n\
         Respond with ONLY a JSON object:\n\
         {shape}\n\n\
         Rules:\n\
         - sentiment is -1.0 (negative) to 1.0 (positive)\n\
         - Keep existing details unless the conversation contradicts them\n\
         - Respond {{}} if the conversation adds nothing new",
        shape = update_shape(category),
    );

    let mut user = String::with_capacity(1024);
    match existing {
        Some(entity) => {
            user.push_str(&format!("Existing {category}:\n  name: {}\n", entity.name()));
            if !entity.description().is_empty() {
                user.push_str(&format!("  description: {}\n", entity.description()));
            }
        }
        None => {
            user.push_str(&format!(
                "New {category}:\n  type: {}\n  value: {}\n",
                candidate.type_hint, candidate.value_hint
            ));
        }
    }
    if !candidate.reason.is_empty() {
        user.push_str(&format!("  evidence: {}\n", candidate.reason));
    }
    user.push('\n');
    user.push_str(&render_conversation(ctx));

    Ok(Prompt { system, user })
}

fn update_shape(category: Category) -> &'static str {
    match category {
        Category::Fact => {
            "{\"name\": \"...\", \"description\": \"...\", \"sentiment\": 0.0, \"confidence\": 0.0}"
        }
        Category::Trait => {
            "{\"name\": \"...\", \"description\": \"...\", \"sentiment\": 0.0, \"strength\": 0.0}"
        }
        Category::Topic => {
            "{\"name\": \"...\", \"description\": \"...\", \"sentiment\": 0.0, \"category\": \"...\", \
             \"exposureImpact\": \"high|medium|low|none\"}"
        }
        Category::Person => {
            "{\"name\": \"...\", \"description\": \"...\", \"sentiment\": 0.0, \"relationship\": \"...\", \
             \"exposureImpact\": \"high|medium|low|none\"}"
        }
    }
}

// ── Replies ─────────────────────────────────────────────────────────

/// System prompt for a subject's conversational reply.
pub fn build_response_system_prompt(display_name: &str) -> String {
    format!(
        "You are {display_name}, a companion having an ongoing conversation with a human.\n\n\
         Guidelines:\n\
         - Reply in 1-3 sentences, in your own voice\n\
         - Acknowledge what the human shared before adding anything\n\
         - If nothing needs saying, reply with exactly: no message"
    )
}

// ── Helpers ─────────────────────────────────────────────────────────

fn validate_context(ctx: &ExtractionContext) -> Result<(), PromptError> {
    if ctx.subject_id.trim().is_empty() {
        return Err(PromptError::Validation("subject id is empty".into()));
    }
    if ctx.messages_analyze.is_empty() {
        return Err(PromptError::Validation("no messages to analyze".into()));
    }
    Ok(())
}

fn validate_candidate(candidate: &Candidate) -> Result<(), PromptError> {
    if candidate.value_hint.trim().is_empty() {
        return Err(PromptError::Validation("candidate value is empty".into()));
    }
    Ok(())
}

fn render_conversation(ctx: &ExtractionContext) -> String {
    let mut out = String::with_capacity(1024);
    if !ctx.messages_context.is_empty() {
        out.push_str("Earlier conversation:\n");
        push_messages(&mut out, &ctx.messages_context);
        out.push('\n');
    }
    out.push_str("Analyze:\n");
    push_messages(&mut out, &ctx.messages_analyze);
    out
}

fn push_messages(out: &mut String, messages: &[ConversationMessage]) {
    for msg in messages {
        out.push_str(&format!(
            "[{}] {}: {}\n",
            msg.timestamp.format("%Y-%m-%d %H:%M"),
            msg.speaker,
            preview(&msg.content, MESSAGE_PREVIEW_CHARS)
        ));
    }
}

fn preview(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}
