//! Prompt assembly. Pure text building: the full-context prompt for the
//! first turn and the sliding-window transcript prompt afterwards. File
//! selection iterates the ordered content map, so the files included under
//! the cap are the same on every run.

use crate::models::chat::ChatMessage;
use crate::models::context::CodeContext;

/// At most this many file bodies go into the initial prompt.
pub const MAX_PROMPT_FILES: usize = 10;
/// Per-file character cap inside the initial prompt.
pub const MAX_FILE_CHARS: usize = 5_000;
/// Number of trailing messages rendered into follow-up prompts.
pub const HISTORY_WINDOW: usize = 10;

const TRUNCATION_MARKER: &str = "... (content truncated)";

const ASSISTANT_FRAMING: &str = "You are a code analysis assistant examining a code base \
and answering questions about it. Answer based on the file structure, file contents and \
project analysis below.";

/// Build the full-context prompt sent on the first turn of a session.
/// Caps the worst case independent of archive size: up to 10 non-binary
/// files, each truncated to 5,000 characters.
pub fn build_initial_prompt(context: &CodeContext, analysis: Option<&str>) -> String {
    let mut prompt = String::new();
    prompt.push_str(ASSISTANT_FRAMING);
    prompt.push('\n');

    if let Some(analysis) = analysis {
        prompt.push_str("\n## Project Analysis\n");
        prompt.push_str(analysis);
        prompt.push('\n');
    }

    prompt.push_str("\n## File Structure\n");
    prompt.push_str(&context.file_tree.render());

    prompt.push_str("\n## File Contents\n");
    let mut included = 0;
    for content in context.file_contents.values() {
        if included >= MAX_PROMPT_FILES {
            break;
        }
        // Binary payloads are useless as prompt text.
        if content.is_base64 {
            continue;
        }

        prompt.push_str("\n### ");
        prompt.push_str(&content.path);
        prompt.push_str("\n```\n");
        prompt.push_str(&truncate_chars(&content.content, MAX_FILE_CHARS));
        prompt.push_str("\n```\n");
        included += 1;
    }

    prompt
}

/// First turn: the full context plus the question itself.
pub fn first_turn_prompt(initial_prompt: &str, question: &str) -> String {
    format!("{initial_prompt}\n## Question\n{question}")
}

/// Later turns: the full context plus only the most recent `window`
/// messages. Older turns are forgotten rather than growing the request
/// without bound.
pub fn build_followup_prompt(
    initial_prompt: &str,
    messages: &[ChatMessage],
    window: usize,
) -> String {
    let mut prompt = String::with_capacity(initial_prompt.len() + 256);
    prompt.push_str(initial_prompt);
    prompt.push_str("\n## Conversation History\n");

    let start = messages.len().saturating_sub(window);
    for message in &messages[start..] {
        prompt.push('\n');
        prompt.push_str(message.role.as_str());
        prompt.push_str(": ");
        prompt.push_str(&message.content);
        prompt.push('\n');
    }

    prompt
}

fn truncate_chars(content: &str, max_chars: usize) -> String {
    let mut out = String::with_capacity(content.len().min(max_chars));
    let mut truncated = false;
    for (i, ch) in content.chars().enumerate() {
        if i >= max_chars {
            truncated = true;
            break;
        }
        out.push(ch);
    }
    if truncated {
        out.push_str(TRUNCATION_MARKER);
    }
    out
}
