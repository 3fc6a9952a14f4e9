use serde::{Deserialize, Serialize};

/// POST /compress request — shorten one tool output.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompressRequest {
    pub tool_output: String,
    /// Last user query, omitted for query-agnostic compressors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    /// Target model the compressed text will be replayed to.
    pub model: String,
    /// Caller tag for the service's own accounting.
    pub source: String,
}

/// POST /compress response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompressResponse {
    pub compressed_output: String,
}

/// POST /filter_tools request — select relevant tools from a catalog.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FilterToolsRequest {
    pub query: String,
    pub tools: Vec<ToolSummary>,
    #[serde(default)]
    pub always_keep: Vec<String>,
    pub max_tools: usize,
    pub source: String,
}

/// Name + description pair the selector scores against the query.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolSummary {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// POST /filter_tools response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FilterToolsResponse {
    pub selected_names: Vec<String>,
}
