//! Mapping from GitLab merge requests to Notion page properties.

use serde_json::{json, Map, Value};

use crate::gitlab::model::{Label, MergeRequest};

/// Stable per-record sync key, `"MR-{iid}"`. The Notion key property holds
/// this value and existence checks query on it.
pub fn sync_key(iid: i64) -> String {
    format!("MR-{}", iid)
}

/// Title-typed value for the key property. Set on create only; updates leave
/// the key untouched.
pub fn key_property_value(key: &str) -> Value {
    json!({
        "title": [
            {
                "text": { "content": key }
            }
        ]
    })
}

/// Map one merge request to its Notion property representation.
///
/// Merged Date is set only when the record was actually merged; Labels only
/// when present and non-empty. Pure and non-mutating.
pub fn merge_request_properties(mr: &MergeRequest) -> Map<String, Value> {
    let mut properties = Map::new();

    properties.insert(
        "Title".into(),
        json!({
            "rich_text": [
                {
                    "text": { "content": mr.title }
                }
            ]
        }),
    );
    properties.insert(
        "Author".into(),
        json!({
            "rich_text": [
                {
                    "text": { "content": mr.author.name }
                }
            ]
        }),
    );
    properties.insert("URL".into(), json!({ "url": mr.web_url }));
    properties.insert(
        "State".into(),
        json!({ "select": { "name": mr.state.as_str() } }),
    );
    properties.insert(
        "Source Branch".into(),
        json!({
            "rich_text": [
                {
                    "text": { "content": mr.source_branch }
                }
            ]
        }),
    );
    properties.insert(
        "Target Branch".into(),
        json!({
            "rich_text": [
                {
                    "text": { "content": mr.target_branch }
                }
            ]
        }),
    );
    properties.insert(
        "Created Date".into(),
        json!({ "date": { "start": mr.created_at.to_rfc3339() } }),
    );
    properties.insert(
        "Updated Date".into(),
        json!({ "date": { "start": mr.updated_at.to_rfc3339() } }),
    );

    if let Some(merged_at) = mr.merged_at {
        properties.insert(
            "Merged Date".into(),
            json!({ "date": { "start": merged_at.to_rfc3339() } }),
        );
    }

    if let Some(labels) = mr.labels.as_deref().filter(|l| !l.is_empty()) {
        let options: Vec<Value> = labels
            .iter()
            .map(|label| json!({ "name": label.name() }))
            .collect();
        properties.insert("Labels".into(), json!({ "multi_select": options }));
    }

    properties
}
