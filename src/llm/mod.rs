//! LLM providers plus the gateway that turns completions into typed analysis results.

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{RagError, RagResult};
use crate::prompt::AnalysisKind;

pub mod anthropic;
pub mod openai;

pub use anthropic::AnthropicProvider;
pub use openai::OpenAiChatProvider;

/// Request envelope shared by the providers.
#[derive(Debug, Clone, PartialEq)]
pub struct LlmRequest {
    /// System message.
    pub system: String,
    /// User message (the rendered prompt).
    pub user: String,
    /// Sampling temperature.
    pub temperature: f32,
    /// Completion token cap.
    pub max_tokens: usize,
}

/// Chat-completion backend.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Short provider label for logs.
    fn name(&self) -> &'static str;

    /// Returns the completion text; empty completions are errors.
    async fn complete(&self, request: &LlmRequest) -> RagResult<String>;
}

/// Low/Medium/High grading used across the structured responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskLevel {
    /// Low.
    #[serde(alias = "low", alias = "LOW")]
    Low,
    /// Medium.
    #[serde(alias = "medium", alias = "MEDIUM")]
    Medium,
    /// High.
    #[serde(alias = "high", alias = "HIGH")]
    High,
}

/// Structured whole-tender overview.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TenderOverview {
    /// Value or budget as written, or `Not specified`.
    pub estimated_value: String,
    /// Distinct sections identified.
    pub total_sections: u32,
    /// Sections marked mandatory.
    pub mandatory_sections: u32,
    /// Estimated read time in minutes.
    pub read_time: u32,
    /// Expected competition.
    pub competition: RiskLevel,
    /// Deadlines in document order.
    pub key_deadlines: Vec<String>,
    /// Eligibility in brief.
    pub eligibility_summary: String,
}

/// Structured summary of one tender section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SectionSummary {
    /// Two or three sentence summary.
    pub summary: String,
    /// Whether bidders must respond to the section.
    pub is_mandatory: bool,
    /// Risk grade.
    pub risk_level: RiskLevel,
    /// Requirements a bidder must meet.
    pub key_requirements: Vec<String>,
    /// Points worth flagging.
    pub concerns: Vec<String>,
}

/// A clause that departs from common practice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UnusualClause {
    /// Brief description.
    pub clause: String,
    /// Why it is risky.
    pub concern: String,
    /// How it differs from the reference tenders.
    pub comparison: String,
}

/// A penalty worth flagging.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PenaltyFinding {
    /// Penalty type, e.g. liquidated damages.
    #[serde(rename = "type")]
    pub kind: String,
    /// Specifics from the document.
    pub details: String,
    /// Severity grade.
    pub severity: RiskLevel,
}

/// A clause the reference tenders carry but this one lacks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct MissingClause {
    /// The absent clause.
    pub expected_clause: String,
    /// What its absence means for a bidder.
    pub impact: String,
}

/// Comparative risk analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TenderInsights {
    /// Clauses departing from standard practice.
    pub unusual_clauses: Vec<UnusualClause>,
    /// Significant penalties.
    pub high_penalties: Vec<PenaltyFinding>,
    /// Expected but absent clauses.
    pub missing_clauses: Vec<MissingClause>,
    /// Overall grade.
    pub overall_risk_assessment: RiskLevel,
    /// Suggested bidder actions.
    pub recommendations: Vec<String>,
}

/// Sends prompts to a provider and validates structured replies.
#[derive(Clone)]
pub struct LlmGateway {
    provider: Arc<dyn LlmProvider>,
    temperature: f32,
    max_tokens: usize,
}

impl LlmGateway {
    /// Wraps `provider` with fixed sampling settings.
    pub fn new(provider: Arc<dyn LlmProvider>, temperature: f32, max_tokens: usize) -> Self {
        Self {
            provider,
            temperature,
            max_tokens,
        }
    }

    /// Raw completion for `prompt` under `system_role`.
    pub async fn call(&self, prompt: &str, system_role: &str) -> RagResult<String> {
        let request = LlmRequest {
            system: system_role.to_string(),
            user: prompt.to_string(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };
        let started = std::time::Instant::now();
        let answer = self.provider.complete(&request).await?;
        tracing::debug!(
            provider = self.provider.name(),
            prompt_chars = prompt.len(),
            answer_chars = answer.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "llm call complete"
        );
        Ok(answer)
    }

    /// Overview prompt -> [`TenderOverview`].
    pub async fn overview(&self, prompt: &str) -> RagResult<TenderOverview> {
        self.structured(AnalysisKind::Overview, prompt).await
    }

    /// Section prompt -> [`SectionSummary`].
    pub async fn section_summary(&self, prompt: &str) -> RagResult<SectionSummary> {
        self.structured(AnalysisKind::SectionSummary, prompt).await
    }

    /// Insights prompt -> [`TenderInsights`].
    pub async fn insights(&self, prompt: &str) -> RagResult<TenderInsights> {
        self.structured(AnalysisKind::Insights, prompt).await
    }

    /// Chat prompt -> free text.
    pub async fn chat(&self, prompt: &str) -> RagResult<String> {
        self.call(prompt, AnalysisKind::Chat.system_role()).await
    }

    async fn structured<T: DeserializeOwned>(
        &self,
        kind: AnalysisKind,
        prompt: &str,
    ) -> RagResult<T> {
        let raw = self.call(prompt, kind.system_role()).await?;
        parse_structured(kind, &raw)
    }
}

/// Parses `raw` as `T`, tolerating one surrounding markdown code fence.
pub fn parse_structured<T: DeserializeOwned>(kind: AnalysisKind, raw: &str) -> RagResult<T> {
    serde_json::from_str(strip_code_fence(raw)).map_err(|err| {
        tracing::warn!(kind = %kind, error = %err, "structured LLM response rejected");
        RagError::LlmResponseFormat {
            kind: kind.as_str(),
            message: err.to_string(),
        }
    })
}

/// Removes a single ```` ``` ```` / ```` ```json ```` wrapper, if present.
pub fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let Some(body) = rest.strip_suffix("```") else {
        return trimmed;
    };
    match body.find('\n') {
        Some(newline) => body[newline + 1..].trim(),
        None => body.trim(),
    }
}

pub(crate) fn llm_transport_error(err: reqwest::Error) -> RagError {
    RagError::LlmProvider {
        status: err.status().map(|status| status.as_u16()),
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct ScriptedProvider {
        reply: String,
        seen: Mutex<Vec<LlmRequest>>,
    }

    impl ScriptedProvider {
        fn new(reply: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: reply.to_string(),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn complete(&self, request: &LlmRequest) -> RagResult<String> {
            self.seen.lock().unwrap().push(request.clone());
            Ok(self.reply.clone())
        }
    }

    const SECTION_JSON: &str = r#"{
        "summary": "Bidders must show three similar projects.",
        "isMandatory": true,
        "riskLevel": "Medium",
        "keyRequirements": ["Three completed projects"],
        "concerns": []
    }"#;

    #[test]
    fn fences_are_stripped_once() {
        assert_eq!(strip_code_fence("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fence("```\n{\"a\":1}```"), "{\"a\":1}");
        assert_eq!(strip_code_fence("  {\"a\":1} "), "{\"a\":1}");
        assert_eq!(strip_code_fence("```json\n{\"a\":1}"), "```json\n{\"a\":1}");
    }

    #[tokio::test]
    async fn section_summary_parses_fenced_json() {
        let provider = ScriptedProvider::new(&format!("```json\n{SECTION_JSON}\n```"));
        let gateway = LlmGateway::new(provider.clone(), 0.3, 2048);
        let summary = gateway.section_summary("prompt body").await.unwrap();
        assert!(summary.is_mandatory);
        assert_eq!(summary.risk_level, RiskLevel::Medium);
        assert!(summary.concerns.is_empty());

        let seen = provider.seen.lock().unwrap();
        assert_eq!(seen[0].user, "prompt body");
        assert_eq!(seen[0].system, AnalysisKind::SectionSummary.system_role());
        assert_eq!(seen[0].max_tokens, 2048);
    }

    #[tokio::test]
    async fn unknown_and_missing_fields_are_rejected() {
        let extra = SECTION_JSON.replace("\"concerns\": []", "\"concerns\": [], \"score\": 4");
        let gateway = LlmGateway::new(ScriptedProvider::new(&extra), 0.3, 2048);
        let err = gateway.section_summary("p").await.unwrap_err();
        assert!(matches!(
            err,
            RagError::LlmResponseFormat {
                kind: "section_summary",
                ..
            }
        ));

        let missing = r#"{"unusualClauses": [], "highPenalties": [], "missingClauses": [], "recommendations": []}"#;
        let gateway = LlmGateway::new(ScriptedProvider::new(missing), 0.3, 2048);
        let err = gateway.insights("p").await.unwrap_err();
        match err {
            RagError::LlmResponseFormat { kind, message } => {
                assert_eq!(kind, "insights");
                assert!(message.contains("overallRiskAssessment"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn prose_is_not_accepted_as_overview() {
        let gateway = LlmGateway::new(
            ScriptedProvider::new("The tender looks fine to me."),
            0.3,
            2048,
        );
        assert!(matches!(
            gateway.overview("p").await,
            Err(RagError::LlmResponseFormat { kind: "overview", .. })
        ));
    }

    #[tokio::test]
    async fn insights_accept_lowercase_grades() {
        let body = r#"{
            "unusualClauses": [{"clause": "Unlimited liability", "concern": "Uncapped exposure", "comparison": "References cap at contract value"}],
            "highPenalties": [{"type": "liquidated damages", "details": "1% per week", "severity": "high"}],
            "missingClauses": [{"expectedClause": "Force majeure", "impact": "No relief for delays"}],
            "overallRiskAssessment": "HIGH",
            "recommendations": ["Seek a liability cap"]
        }"#;
        let gateway = LlmGateway::new(ScriptedProvider::new(body), 0.3, 2048);
        let insights = gateway.insights("p").await.unwrap();
        assert_eq!(insights.high_penalties[0].kind, "liquidated damages");
        assert_eq!(insights.high_penalties[0].severity, RiskLevel::High);
        assert_eq!(insights.overall_risk_assessment, RiskLevel::High);
    }
}
