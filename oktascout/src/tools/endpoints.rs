//! Catalog tools: `load_read_endpoints` and `filter_endpoints`.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::catalog::EndpointKind;

use super::{parse_args, Tool, ToolCallContext, ToolError, ToolSpec};

/// Lists every READ operation of the catalog. No arguments.
pub struct LoadReadEndpointsTool;

#[async_trait]
impl Tool for LoadReadEndpointsTool {
    fn name(&self) -> &str {
        "load_read_endpoints"
    }

    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name().to_string(),
            description: Some(
                "List all read-only Okta API operations (id, method, path, entity, summary)."
                    .to_string(),
            ),
            input_schema: json!({
                "type": "object",
                "properties": {},
                "additionalProperties": false
            }),
        }
    }

    async fn call(&self, _args: Value, ctx: &ToolCallContext) -> Result<Value, ToolError> {
        let endpoints: Vec<_> = ctx
            .catalog
            .filter(&[EndpointKind::Read])
            .into_iter()
            .map(endpoint_view)
            .collect();
        Ok(json!({
            "success": true,
            "count": endpoints.len(),
            "endpoints": endpoints,
        }))
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct FilterArgs {
    /// Operation ids to keep, e.g. `["list_groups", "list_group_users"]`.
    ids: Vec<String>,
}

/// Narrows the catalog to the named operation ids.
pub struct FilterEndpointsTool;

#[async_trait]
impl Tool for FilterEndpointsTool {
    fn name(&self) -> &str {
        "filter_endpoints"
    }

    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name().to_string(),
            description: Some(
                "Return full summaries for the given operation ids; unknown ids are reported."
                    .to_string(),
            ),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "ids": {
                        "type": "array",
                        "items": { "type": "string" },
                        "minItems": 1
                    }
                },
                "required": ["ids"],
                "additionalProperties": false
            }),
        }
    }

    async fn call(&self, args: Value, ctx: &ToolCallContext) -> Result<Value, ToolError> {
        let args: FilterArgs = parse_args(args)?;
        if args.ids.is_empty() {
            return Err(ToolError::InvalidArguments(
                "`ids` must not be empty".into(),
            ));
        }
        let (found, unknown) = ctx.catalog.select(&args.ids);
        Ok(json!({
            "success": true,
            "endpoints": found.into_iter().map(endpoint_view).collect::<Vec<_>>(),
            "unknown_ids": unknown,
        }))
    }
}

fn endpoint_view(e: &crate::catalog::EndpointSummary) -> Value {
    json!({
        "id": e.id,
        "method": e.method,
        "path": e.path,
        "entity": e.entity,
        "summary": e.summary,
        "params": e.params,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::test_support::context_with_db;

    #[tokio::test]
    async fn read_endpoints_exclude_writes() {
        let (ctx, _dir, _rx) = context_with_db();
        let out = LoadReadEndpointsTool
            .call(json!({}), &ctx)
            .await
            .unwrap();
        let endpoints = out["endpoints"].as_array().unwrap();
        assert!(!endpoints.is_empty());
        assert!(endpoints.iter().all(|e| e["method"] == "GET"));
    }

    #[tokio::test]
    async fn filter_reports_unknown_ids() {
        let (ctx, _dir, _rx) = context_with_db();
        let out = FilterEndpointsTool
            .call(json!({"ids": ["list_groups", "nope"]}), &ctx)
            .await
            .unwrap();
        assert_eq!(out["endpoints"].as_array().unwrap().len(), 1);
        assert_eq!(out["unknown_ids"][0], "nope");
    }

    #[tokio::test]
    async fn malformed_arguments_are_recoverable() {
        let (ctx, _dir, _rx) = context_with_db();
        let err = FilterEndpointsTool
            .call(json!({"ids": "list_groups"}), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
        assert_eq!(err.to_model_view()["success"], false);
    }
}
