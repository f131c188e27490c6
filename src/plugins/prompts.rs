use crate::core::assets::{AssetTree, EmbeddedTree, PromptAssets};
use crate::core::error::{Result, StoreError};
use crate::core::fts::{FtsColumn, FtsValues};
use crate::core::model::Item;
use crate::plugins::{ItemDomain, validate_tags};
use regex::Regex;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, LazyLock};

pub const COL_VARS: &str = "vars";

static PLACEHOLDER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").expect("static placeholder regex")
});
static VAR_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("static variable regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptRole {
    System,
    Developer,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageBlock {
    pub role: PromptRole,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptVariable {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptTemplate {
    pub blocks: Vec<MessageBlock>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub variables: Vec<PromptVariable>,
}

impl PromptTemplate {
    /// Placeholder names in block order, first occurrence only.
    pub fn placeholders(&self) -> Vec<String> {
        let mut seen = FxHashSet::default();
        let mut out = Vec::new();
        for block in &self.blocks {
            for cap in PLACEHOLDER_RE.captures_iter(&block.content) {
                let name = cap[1].to_string();
                if seen.insert(name.clone()) {
                    out.push(name);
                }
            }
        }
        out
    }
}

/// Prompt templates.
pub struct Prompts;

impl ItemDomain for Prompts {
    type Payload = PromptTemplate;

    const NAME: &'static str = "prompts";
    const FTS_TABLE: &'static str = "prompts";

    fn extra_columns() -> Vec<FtsColumn> {
        vec![FtsColumn::indexed(COL_VARS, 1.5)]
    }

    fn body_text(payload: &PromptTemplate) -> String {
        payload
            .blocks
            .iter()
            .map(|b| b.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn extra_values(payload: &PromptTemplate) -> FtsValues {
        let vars: Vec<&str> = payload.variables.iter().map(|v| v.name.as_str()).collect();
        FtsValues::from([(COL_VARS.to_string(), vars.join(" "))])
    }

    fn validate(item: &Item<PromptTemplate>) -> Result<()> {
        validate_tags(&item.tags)?;
        let template = &item.payload;
        if template.blocks.is_empty() {
            return Err(StoreError::InvalidRequest(
                "prompt needs at least one message block".to_string(),
            ));
        }
        if let Some(i) = template.blocks.iter().position(|b| b.content.trim().is_empty()) {
            return Err(StoreError::InvalidRequest(format!(
                "message block {} has empty content",
                i
            )));
        }

        let mut declared = FxHashSet::default();
        for var in &template.variables {
            if !VAR_NAME_RE.is_match(&var.name) {
                return Err(StoreError::InvalidRequest(format!(
                    "invalid variable name {:?}",
                    var.name
                )));
            }
            if !declared.insert(var.name.as_str()) {
                return Err(StoreError::InvalidRequest(format!(
                    "variable {:?} declared twice",
                    var.name
                )));
            }
        }
        for name in template.placeholders() {
            if !declared.contains(name.as_str()) {
                return Err(StoreError::InvalidRequest(format!(
                    "placeholder {{{{{}}}}} has no variable declaration",
                    name
                )));
            }
        }
        Ok(())
    }

    fn builtin_tree() -> Arc<dyn AssetTree> {
        Arc::new(EmbeddedTree::<PromptAssets>::new())
    }
}
