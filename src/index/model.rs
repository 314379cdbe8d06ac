use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;

#[derive(Deserialize, Debug)]
pub struct BulkResponse {
    #[serde(default)]
    pub errors: bool,
    #[serde(default)]
    pub items: Vec<HashMap<String, BulkItem>>,
}

/// Result of one action line; keyed by the action name (`index`) in the response.
#[derive(Deserialize, Debug)]
pub struct BulkItem {
    #[serde(rename = "_id")]
    pub id: Option<String>,
    pub status: u16,
    pub result: Option<String>,
    pub error: Option<Value>,
}
