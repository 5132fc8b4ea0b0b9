//! Prompt templates for the four analysis types.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::embeddings::ScoredChunk;
use crate::retriever::RetrievalResult;

/// Answer given whenever the tender document does not cover a question.
pub const NOT_SPECIFIED_SENTINEL: &str = "This information is not specified in the tender document";

/// Rendered in place of an empty chunk list.
pub const NO_CONTEXT: &str = "No relevant content found.";

/// Conversation turns carried into a chat prompt.
pub const CHAT_HISTORY_TURNS: usize = 3;

/// Which template a prompt was rendered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisKind {
    /// Whole-tender structured overview.
    Overview,
    /// Per-section summary.
    SectionSummary,
    /// Comparison against the reference corpus.
    Insights,
    /// Free-text question answering.
    Chat,
}

impl AnalysisKind {
    /// Stable label used in logs and error messages.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Overview => "overview",
            Self::SectionSummary => "section_summary",
            Self::Insights => "insights",
            Self::Chat => "chat",
        }
    }

    /// System message sent alongside the rendered prompt.
    pub fn system_role(self) -> &'static str {
        match self {
            Self::Overview | Self::SectionSummary | Self::Insights => {
                "You are a tender analysis expert. Use only the supplied context and reply with a single valid JSON object."
            }
            Self::Chat => {
                "You are an assistant helping a bidder understand a tender document. Use only the supplied context."
            }
        }
    }
}

impl fmt::Display for AnalysisKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Speaker of a chat turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    /// The bidder.
    User,
    /// A previous model answer.
    Assistant,
}

/// One prior message in a chat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    /// Who said it.
    pub role: ChatRole,
    /// What was said.
    pub content: String,
}

/// Renders the fixed analysis templates.
#[derive(Debug, Clone, Copy, Default)]
pub struct PromptBuilder;

impl PromptBuilder {
    /// Structured overview prompt.
    pub fn overview(context: &RetrievalResult) -> String {
        format!(
            r#"You are a tender analysis expert. Analyze the following tender document and provide a structured overview.

TENDER DOCUMENT CONTEXT:
{session}

REFERENCE TENDERS (for comparison):
{global}

Using ONLY the tender document context above, respond with this JSON object:

{{
  "estimatedValue": "Estimated value or budget as written in the document, or 'Not specified'",
  "totalSections": <number of distinct sections identified>,
  "mandatorySections": <number of mandatory sections>,
  "readTime": <estimated read time in minutes>,
  "competition": "Low/Medium/High based on complexity and requirements",
  "keyDeadlines": ["deadline 1", "deadline 2"],
  "eligibilitySummary": "Brief summary of eligibility requirements"
}}

RULES:
- Use only the supplied context
- When a field is not covered by the context, use "Not specified"
- Never invent figures, dates, or requirements
- Return ONLY the JSON object, no additional text"#,
            session = format_chunks(&context.session_chunks),
            global = format_chunks(&context.global_chunks),
        )
    }

    /// Summary prompt for a single named section.
    pub fn section_summary(context: &RetrievalResult, section: &str) -> String {
        format!(
            r#"You are analyzing the "{section}" section of a tender document.

TENDER SECTION CONTENT:
{session}

REFERENCE SECTIONS FROM OTHER TENDERS:
{global}

Respond with this JSON object:

{{
  "summary": "Concise 2-3 sentence summary of this section",
  "isMandatory": true or false,
  "riskLevel": "Low/Medium/High",
  "keyRequirements": ["requirement 1", "requirement 2"],
  "concerns": ["concern 1"] or []
}}

RULES:
- Use only the supplied context
- If the section content is missing, set "summary" to "{sentinel}"
- Judge risk from complexity, penalties, and strictness
- Return ONLY the JSON object"#,
            session = format_chunks(&context.session_chunks),
            global = format_chunks(&context.global_chunks),
            sentinel = NOT_SPECIFIED_SENTINEL,
        )
    }

    /// Comparative risk prompt against the reference corpus.
    pub fn insights(context: &RetrievalResult) -> String {
        format!(
            r#"You are a tender risk analyst comparing this tender against standard industry practice.

THIS TENDER:
{session}

REFERENCE TENDERS (industry standard):
{global}

Respond with this JSON object:

{{
  "unusualClauses": [
    {{"clause": "Brief description", "concern": "Why it is unusual or risky", "comparison": "How it differs from standard practice"}}
  ],
  "highPenalties": [
    {{"type": "Type of penalty", "details": "Specific details", "severity": "Low/Medium/High"}}
  ],
  "missingClauses": [
    {{"expectedClause": "Clause usually present but missing", "impact": "Potential impact"}}
  ],
  "overallRiskAssessment": "Low/Medium/High",
  "recommendations": ["recommendation 1", "recommendation 2"]
}}

RULES:
- Compare using only the supplied context
- Report genuine differences, not minor wording variations
- Use empty arrays when nothing qualifies
- Return ONLY the JSON object"#,
            session = format_chunks(&context.session_chunks),
            global = format_chunks(&context.global_chunks),
        )
    }

    /// Conversational prompt carrying the last few turns of history.
    pub fn chat(context: &RetrievalResult, question: &str, history: &[ChatTurn]) -> String {
        let start = history.len().saturating_sub(CHAT_HISTORY_TURNS);
        let rendered_history = history[start..]
            .iter()
            .map(|turn| {
                let speaker = match turn.role {
                    ChatRole::User => "User",
                    ChatRole::Assistant => "Assistant",
                };
                format!("{speaker}: {}", turn.content)
            })
            .collect::<Vec<_>>()
            .join("\n\n");
        let history_block = if rendered_history.is_empty() {
            String::new()
        } else {
            format!("CONVERSATION HISTORY:\n{rendered_history}\n\n")
        };
        format!(
            r#"You are an assistant helping a bidder understand this tender document.

TENDER DOCUMENT:
{session}

REFERENCE KNOWLEDGE:
{global}

{history_block}USER QUESTION: {question}

Answer using ONLY the supplied context.

RULES:
- Treat "TENDER DOCUMENT" as the primary source
- Use "REFERENCE KNOWLEDGE" only for comparison
- If the answer is not in the document, say: "{sentinel}"
- Be concise but complete and use bullet points for lists

Your answer:"#,
            session = format_chunks(&context.session_chunks),
            global = format_chunks(&context.global_chunks),
            sentinel = NOT_SPECIFIED_SENTINEL,
        )
    }
}

/// `[Chunk n] source (Page p):\ntext` blocks separated by `---` rules.
pub fn format_chunks(chunks: &[ScoredChunk]) -> String {
    if chunks.is_empty() {
        return NO_CONTEXT.to_string();
    }
    chunks
        .iter()
        .enumerate()
        .map(|(idx, chunk)| {
            let page = chunk
                .page_no
                .map(|page| format!(" (Page {page})"))
                .unwrap_or_default();
            format!("[Chunk {}] {}{page}:\n{}", idx + 1, chunk.source, chunk.text)
        })
        .collect::<Vec<_>>()
        .join("\n\n---\n\n")
}
