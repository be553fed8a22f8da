//! Recovered AI response documents and command batches.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use taverndb_domain::TavernCommand;

/// A repair or extraction step that fired while recovering a response
///
/// Each strategy renders a stable marker into `repair_note` so telemetry can
/// tell a clean parse from a reconstruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairStrategy {
    /// Prose around the first JSON object was dropped
    OutsideTextTruncated,
    /// A code fence wrapper was removed
    FenceStripped,
    TrailingCommasRemoved,
    ControlCharsEscaped,
    BracketsBalanced,
    /// A trailing `action_options` block was merged into the primary document
    ActionOptionsMerged,
    /// Repaired, but no individual repair reported a change
    StructureRepaired,
    /// Commands came from a chat-completion/responses envelope
    EnvelopeExtracted,
    /// Commands came from concatenated SSE deltas
    SseExtracted,
    /// Only the balanced `tavern_commands` array could be recovered
    BalancedArrayExtracted,
}

impl RepairStrategy {
    pub fn marker(self) -> &'static str {
        match self {
            RepairStrategy::OutsideTextTruncated => "已截断JSON之外内容",
            RepairStrategy::FenceStripped => "已移除代码块包裹",
            RepairStrategy::TrailingCommasRemoved => "已移除尾随逗号",
            RepairStrategy::ControlCharsEscaped => "已转义字符串内控制字符",
            RepairStrategy::BracketsBalanced => "已补齐缺失括号",
            RepairStrategy::ActionOptionsMerged => "已合并追加的action_options块",
            RepairStrategy::StructureRepaired => "已自动修复JSON结构",
            RepairStrategy::EnvelopeExtracted => "Envelope content extraction",
            RepairStrategy::SseExtracted => "SSE payload extraction",
            RepairStrategy::BalancedArrayExtracted => "Balanced tavern_commands extraction",
        }
    }

    /// Parse-level markers are joined with `，`.
    pub fn join_parse_notes(strategies: &[RepairStrategy]) -> Option<String> {
        if strategies.is_empty() {
            return None;
        }
        Some(
            strategies
                .iter()
                .map(|s| s.marker())
                .collect::<Vec<_>>()
                .join("，"),
        )
    }
}

/// Outcome of recovering a structured document from raw model text
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    pub repaired: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repair_note: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Strategies that fired, in order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub strategies: Vec<RepairStrategy>,
}

impl ParsedResponse {
    pub fn clean(response: Value) -> Self {
        Self {
            response: Some(response),
            ..Self::default()
        }
    }

    pub fn repaired(response: Value, strategies: Vec<RepairStrategy>) -> Self {
        Self {
            response: Some(response),
            repaired: true,
            repair_note: RepairStrategy::join_parse_notes(&strategies),
            error: None,
            strategies,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }

    /// `tavern_commands` of the recovered document, when it is an array.
    pub fn tavern_commands(&self) -> Option<&Vec<Value>> {
        self.response
            .as_ref()?
            .get("tavern_commands")?
            .as_array()
    }

    /// `logs` of the recovered document, when it is an array.
    pub fn logs(&self) -> Option<&Vec<Value>> {
        self.response.as_ref()?.get("logs")?.as_array()
    }

    /// Typed view of the recovered document; `None` when its known keys have the wrong shape.
    pub fn document(&self) -> Option<AiResponse> {
        serde_json::from_value(self.response.clone()?).ok()
    }
}

/// A service response document
///
/// Only the keys the engine reads are typed. Thinking fields and any other
/// siblings are kept in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AiResponse {
    pub tavern_commands: Vec<Value>,
    pub logs: Vec<Value>,
    pub action_options: Vec<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AiResponse {
    /// Non-blank string options, trimmed.
    pub fn action_option_texts(&self) -> Vec<String> {
        self.action_options
            .iter()
            .filter_map(Value::as_str)
            .map(str::trim)
            .filter(|option| !option.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// Commands recovered from one service response
///
/// `tavern_commands` is always present, possibly empty; `raw_response` is the
/// input verbatim for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedCommands {
    #[serde(rename = "tavern_commands")]
    pub tavern_commands: Vec<Value>,
    pub raw_response: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repair_note: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub strategies: Vec<RepairStrategy>,
    /// Set when nothing parseable was found at all
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parse_error: Option<String>,
    /// Player choices offered by the response document
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub action_options: Vec<String>,
}

impl ExtractedCommands {
    /// Decode the raw elements into commands; non-object elements are skipped.
    pub fn commands(&self) -> Vec<TavernCommand> {
        let commands: Vec<TavernCommand> = self
            .tavern_commands
            .iter()
            .filter_map(TavernCommand::from_json)
            .collect();
        let skipped = self.tavern_commands.len() - commands.len();
        if skipped > 0 {
            tracing::warn!(skipped, "Skipped non-object tavern_commands elements");
        }
        commands
    }

    /// True when recovery needed a fallback beyond direct/repair parsing.
    pub fn used_fallback(&self) -> bool {
        self.strategies.iter().any(|s| {
            matches!(
                s,
                RepairStrategy::EnvelopeExtracted
                    | RepairStrategy::SseExtracted
                    | RepairStrategy::BalancedArrayExtracted
            )
        })
    }

    /// Nothing recoverable: no commands and no parsed document.
    pub fn is_unparseable(&self) -> bool {
        self.tavern_commands.is_empty() && self.parse_error.is_some()
    }
}
