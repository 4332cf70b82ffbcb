//! Grounded prompt assembly and answer post-processing.
//!
//! # Prompt layout
//!
//! ```text
//! system:    <instruction>
//!
//!            Context passages:
//!
//!            [1] (PDF: manual.pdf, page 12) (relevance: 0.82)
//!            <passage text>
//!
//!            [2] (Web: https://…) (relevance: 0.64)
//!            <passage text>
//! user/assistant: last `max_history` turns, oldest first
//! user:      <query>
//! ```
//!
//! Passages are placed in rank order until `max_context_chars` is spent.
//! The first passage is always placed, truncated if it alone exceeds the
//! budget. Only placed passages get a marker, so only they can be cited.
//!
//! # Post-processing
//!
//! [`finalize_answer`] maps `[n]` / `[n, m]` markers in the model output
//! back to source URIs, and marks the answer grounded only when at least
//! one marker resolved and the text carries none of the fixed
//! "insufficient information" phrases.

use std::collections::BTreeSet;
use std::sync::OnceLock;

use regex::{Regex, RegexSet};

use crate::llm::ChatMessage;
use crate::models::{AnswerResult, AnswerStatus, ConversationTurn, RetrievedPassage, Role};
use crate::text::{floor_char_boundary, straighten_quotes};

pub const SYSTEM_INSTRUCTION: &str = "You are an assistant that answers questions about \
university policies. Answer ONLY from the context passages below. Cite every passage you \
use with its bracketed number, for example [1] or [2, 3]. If the passages do not contain \
the answer, say: \"I don't have enough information about this in the policy documents.\" \
Do not use outside knowledge and do not guess.";

const TRUNCATION_NOTE: &str = "[Context truncated]";

#[derive(Debug, Clone)]
pub struct PromptConfig {
    /// Most recent conversation turns included in the prompt.
    pub max_history: usize,
    /// Character budget for the passage block.
    pub max_context_chars: usize,
    pub system_instruction: String,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            max_history: 10,
            max_context_chars: 4000,
            system_instruction: SYSTEM_INSTRUCTION.to_string(),
        }
    }
}

/// A passage that made it into the prompt, addressable as `[marker]`.
#[derive(Debug, Clone, PartialEq)]
pub struct PlacedSource {
    pub marker: usize,
    pub chunk_id: String,
    pub source_uri: String,
}

#[derive(Debug, Clone)]
pub struct Prompt {
    pub messages: Vec<ChatMessage>,
    /// `sources[i].marker == i + 1`.
    pub sources: Vec<PlacedSource>,
    /// True when some passages did not fit the budget.
    pub truncated: bool,
}

pub fn build_prompt(
    query: &str,
    passages: &[RetrievedPassage],
    history: &[ConversationTurn],
    config: &PromptConfig,
) -> Prompt {
    let mut context = String::new();
    let mut used = 0usize;
    let mut sources = Vec::new();
    let mut truncated = false;

    for passage in passages {
        let marker = sources.len() + 1;
        let block = format!(
            "[{}] ({}) (relevance: {:.2})\n{}\n\n",
            marker,
            passage.label(),
            passage.similarity_score,
            passage.text.trim()
        );
        let block_chars = block.chars().count();

        if used + block_chars > config.max_context_chars {
            truncated = true;
            if !sources.is_empty() {
                break;
            }
            let cut = char_prefix(&block, config.max_context_chars);
            context.push_str(cut.trim_end());
            context.push_str("\n\n");
        } else {
            context.push_str(&block);
            used += block_chars;
        }

        sources.push(PlacedSource {
            marker,
            chunk_id: passage.chunk_id.clone(),
            source_uri: passage.source_uri.clone(),
        });
        if truncated {
            break;
        }
    }
    if truncated {
        context.push_str(TRUNCATION_NOTE);
    }

    let mut messages = Vec::with_capacity(history.len().min(config.max_history) + 2);
    messages.push(ChatMessage::system(format!(
        "{}\n\nContext passages:\n\n{}",
        config.system_instruction,
        context.trim_end()
    )));

    let tail = history.len().saturating_sub(config.max_history);
    for turn in &history[tail..] {
        messages.push(match turn.role {
            Role::User => ChatMessage::user(turn.text.clone()),
            Role::Assistant => ChatMessage::assistant(turn.text.clone()),
        });
    }
    messages.push(ChatMessage::user(query));

    Prompt {
        messages,
        sources,
        truncated,
    }
}

/// Turn raw model output into an [`AnswerResult`].
pub fn finalize_answer(raw: &str, prompt: &Prompt) -> AnswerResult {
    let text = raw.trim().to_string();
    let citations = extract_citations(&text, &prompt.sources);
    let grounded = !citations.is_empty() && !signals_insufficient(&text);
    AnswerResult {
        text,
        citations,
        grounded,
        status: AnswerStatus::Answered,
    }
}

/// Source URIs referenced by `[n]` or `[n, m, ...]` markers in `text`.
/// Markers that do not match a placed source are ignored.
pub fn extract_citations(text: &str, sources: &[PlacedSource]) -> BTreeSet<String> {
    let mut cited = BTreeSet::new();
    for caps in marker_regex().captures_iter(text) {
        for n in caps[1].split(',') {
            let Ok(n) = n.trim().parse::<usize>() else {
                continue;
            };
            if let Some(source) = n.checked_sub(1).and_then(|i| sources.get(i)) {
                cited.insert(source.source_uri.clone());
            }
        }
    }
    cited
}

/// Whether the text admits the passages were insufficient.
pub fn signals_insufficient(text: &str) -> bool {
    insufficient_patterns().is_match(&straighten_quotes(text))
}

fn marker_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\[\s*(\d+(?:\s*,\s*\d+)*)\s*\]").expect("citation marker pattern is valid")
    })
}

fn insufficient_patterns() -> &'static RegexSet {
    static SET: OnceLock<RegexSet> = OnceLock::new();
    SET.get_or_init(|| {
        RegexSet::new([
            r"(?i)\b(don't|do not|doesn't|does not) (have|contain|provide) (enough|sufficient|any) (information|details|context)",
            r"(?i)\bnot enough (information|context|detail)",
            r"(?i)\binsufficient (information|context|evidence)",
            r"(?i)\b(cannot|can't|unable to) (find|answer|determine|locate)\b",
            r"(?i)\bno (relevant )?information (about|on|regarding)\b",
            r"(?i)\bnot (mentioned|covered|addressed|specified) in the (provided )?(context|passages|documents)",
        ])
        .expect("insufficiency patterns are valid")
    })
}

fn char_prefix(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((i, _)) => &s[..floor_char_boundary(s, i)],
        None => s,
    }
}
