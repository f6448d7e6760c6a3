//! `load_sql_schema`: the snapshot's table/column catalog for the model.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{parse_args, Tool, ToolCallContext, ToolError, ToolSpec};

#[derive(Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct SchemaArgs {
    /// Restrict to these tables; empty or omitted returns everything.
    #[serde(default)]
    tables: Vec<String>,
}

pub struct LoadSqlSchemaTool;

#[async_trait]
impl Tool for LoadSqlSchemaTool {
    fn name(&self) -> &str {
        "load_sql_schema"
    }

    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name().to_string(),
            description: Some(
                "Describe the read-only tenant snapshot: tables, columns, types and semantics. \
                 Optionally filter by table name."
                    .to_string(),
            ),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "tables": {
                        "type": "array",
                        "items": { "type": "string" }
                    }
                },
                "additionalProperties": false
            }),
        }
    }

    async fn call(&self, args: Value, ctx: &ToolCallContext) -> Result<Value, ToolError> {
        let args: SchemaArgs = if args.is_null() {
            SchemaArgs::default()
        } else {
            parse_args(args)?
        };
        let tables = ctx.schema.filtered(&args.tables);
        if !args.tables.is_empty() && tables.is_empty() {
            return Err(ToolError::InvalidArguments(format!(
                "no snapshot tables match {:?}",
                args.tables
            )));
        }
        let views: Vec<Value> = tables
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "columns": t.columns.iter().map(|c| json!({
                        "name": c.name,
                        "type": c.sql_type,
                        "description": c.description,
                    })).collect::<Vec<_>>(),
                })
            })
            .collect();
        Ok(json!({ "success": true, "tables": views }))
    }
}
