//! Completion Detector: a pure function over a parsed tail of
//! `sdk-output.json` messages, looking for an assistant-originated
//! completion sentinel.
//!
//! Deliberately not a streaming parser: `sdk-output.json` is small and
//! fully materialized by the runner before the Run Manager checks it, so
//! reading it whole and scanning the in-memory tail is simpler and just as
//! correct.

use std::path::Path;

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::CoreResult;
use crate::state_store::read_json;

/// How many trailing messages the detector scans by default.
pub const DEFAULT_TAIL: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    ToolResult {
        #[serde(default)]
        content: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SdkMessage {
    pub role: Role,
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SdkOutput {
    #[serde(default)]
    pub messages: Vec<SdkMessage>,
}

static SENTINEL: OnceLock<Regex> = OnceLock::new();

fn sentinel() -> &'static Regex {
    SENTINEL.get_or_init(|| Regex::new(r"<promise>\s*COMPLETE\s*</promise>").unwrap())
}

/// Whether `messages`' trailing `tail` entries contain the completion
/// sentinel inside a `Text` block attributed to `Role::Assistant`. A
/// `ToolResult` echoing the same literal text never counts.
pub fn is_complete(messages: &[SdkMessage], tail: usize) -> bool {
    let start = messages.len().saturating_sub(tail);
    messages[start..].iter().any(|m| {
        m.role == Role::Assistant
            && m.content.iter().any(|block| match block {
                ContentBlock::Text { text } => sentinel().is_match(text),
                _ => false,
            })
    })
}

/// Read `<stateDir>/sdk-output.json`, if present, and check its trailing
/// `tail` messages for the completion sentinel. A missing or unparsable
/// file is simply "not complete" — the Run Manager falls back to
/// state-driven completion in that case.
pub async fn check_completion(state_dir: &Path, tail: usize) -> CoreResult<bool> {
    let path = state_dir.join("sdk-output.json");
    match read_json::<SdkOutput>(&path).await {
        Ok(Some(output)) => Ok(is_complete(&output.messages, tail)),
        Ok(None) => Ok(false),
        Err(_) => Ok(false),
    }
}
