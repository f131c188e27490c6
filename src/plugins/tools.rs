use crate::core::assets::{AssetTree, EmbeddedTree, ToolAssets};
use crate::core::error::{Result, StoreError};
use crate::core::fts::{FtsColumn, FtsValues};
use crate::core::model::Item;
use crate::plugins::{ItemDomain, validate_tags};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};

pub const COL_PARAMS: &str = "params";
pub const COL_IMPL: &str = "impl";

const HTTP_METHODS: &[&str] = &["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD"];
const MAX_TIMEOUT_MS: u64 = 300_000;

static NATIVE_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_.-]+$").expect("static native name regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolType {
    Http,
    Native,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpImpl {
    pub method: String,
    /// Request URL; `{{arg}}` placeholders are filled from the call arguments.
    pub url_template: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_template: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NativeImpl {
    /// Name the host resolves to a registered function.
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSpec {
    pub arg_schema: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
    #[serde(rename = "type")]
    pub tool_type: ToolType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_impl: Option<HttpImpl>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub native_impl: Option<NativeImpl>,
}

impl ToolSpec {
    /// Top-level argument names declared under `argSchema.properties`.
    pub fn param_names(&self) -> Vec<String> {
        match self.arg_schema.get("properties") {
            Some(Value::Object(props)) => props.keys().cloned().collect(),
            _ => Vec::new(),
        }
    }

    fn param_descriptions(&self) -> Vec<String> {
        match self.arg_schema.get("properties") {
            Some(Value::Object(props)) => props
                .values()
                .filter_map(|p| p.get("description").and_then(Value::as_str))
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        }
    }
}

fn invalid(msg: impl Into<String>) -> StoreError {
    StoreError::InvalidRequest(msg.into())
}

fn check_http(http: &HttpImpl) -> Result<()> {
    if !HTTP_METHODS.contains(&http.method.as_str()) {
        return Err(invalid(format!("unsupported HTTP method {:?}", http.method)));
    }
    let url = http.url_template.trim();
    if !(url.starts_with("http://") || url.starts_with("https://") || url.starts_with("{{")) {
        return Err(invalid(format!(
            "urlTemplate {:?} must be an http(s) URL or a placeholder",
            http.url_template
        )));
    }
    if let Some(ms) = http.timeout_ms
        && (ms == 0 || ms > MAX_TIMEOUT_MS)
    {
        return Err(invalid(format!("timeoutMs must be in 1..={}", MAX_TIMEOUT_MS)));
    }
    if http.headers.keys().any(|k| k.trim().is_empty()) {
        return Err(invalid("empty HTTP header name"));
    }
    Ok(())
}

/// Tool specifications.
pub struct Tools;

impl ItemDomain for Tools {
    type Payload = ToolSpec;

    const NAME: &'static str = "tools";
    const FTS_TABLE: &'static str = "tools";

    fn extra_columns() -> Vec<FtsColumn> {
        vec![
            FtsColumn::indexed(COL_PARAMS, 1.5),
            FtsColumn::indexed(COL_IMPL, 1.0),
        ]
    }

    fn body_text(payload: &ToolSpec) -> String {
        payload.param_descriptions().join("\n")
    }

    fn extra_values(payload: &ToolSpec) -> FtsValues {
        let impl_text = match (payload.tool_type, &payload.http_impl, &payload.native_impl) {
            (ToolType::Http, Some(h), _) => format!("http {} {}", h.method, h.url_template),
            (ToolType::Native, _, Some(n)) => format!("native {}", n.name),
            (ToolType::Http, None, _) => "http".to_string(),
            (ToolType::Native, _, None) => "native".to_string(),
        };
        FtsValues::from([
            (COL_PARAMS.to_string(), payload.param_names().join(" ")),
            (COL_IMPL.to_string(), impl_text),
        ])
    }

    fn validate(item: &Item<ToolSpec>) -> Result<()> {
        validate_tags(&item.tags)?;
        let spec = &item.payload;
        if !spec.arg_schema.is_object() {
            return Err(invalid("argSchema must be a JSON object"));
        }
        if let Some(out) = &spec.output_schema
            && !out.is_object()
        {
            return Err(invalid("outputSchema must be a JSON object"));
        }
        match spec.tool_type {
            ToolType::Http => {
                if spec.native_impl.is_some() {
                    return Err(invalid("http tool must not carry nativeImpl"));
                }
                let http = spec
                    .http_impl
                    .as_ref()
                    .ok_or_else(|| invalid("http tool needs httpImpl"))?;
                check_http(http)
            }
            ToolType::Native => {
                if spec.http_impl.is_some() {
                    return Err(invalid("native tool must not carry httpImpl"));
                }
                let native = spec
                    .native_impl
                    .as_ref()
                    .ok_or_else(|| invalid("native tool needs nativeImpl"))?;
                if !NATIVE_NAME_RE.is_match(&native.name) {
                    return Err(invalid(format!("invalid native impl name {:?}", native.name)));
                }
                Ok(())
            }
        }
    }

    fn builtin_tree() -> Arc<dyn AssetTree> {
        Arc::new(EmbeddedTree::<ToolAssets>::new())
    }
}
