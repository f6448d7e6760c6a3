//! `synthesize_final_script`: the terminal tool call.
//!
//! The tool itself only records the synthesis request and freezes
//! exploration; the ReAct loop recognizes the name and hands control to the
//! synthesis phase.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{parse_args, Tool, ToolCallContext, ToolError, ToolSpec};

/// Tool name the loop watches for.
pub const SYNTHESIZE_FINAL_SCRIPT: &str = "synthesize_final_script";

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct FinalizeArgs {
    /// What the final script should produce, in the model's words.
    description: String,
}

pub struct SynthesizeFinalScriptTool;

#[async_trait]
impl Tool for SynthesizeFinalScriptTool {
    fn name(&self) -> &str {
        SYNTHESIZE_FINAL_SCRIPT
    }

    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name().to_string(),
            description: Some(
                "Finish exploration: compile the stored steps into one standalone script that \
                 produces the complete answer. Call only when the stored steps cover the \
                 question."
                    .to_string(),
            ),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "description": { "type": "string" }
                },
                "required": ["description"],
                "additionalProperties": false
            }),
        }
    }

    async fn call(&self, args: Value, ctx: &ToolCallContext) -> Result<Value, ToolError> {
        let args: FinalizeArgs = parse_args(args)?;
        if ctx.library.is_empty() {
            return Err(ToolError::InvalidArguments(
                "no steps stored yet; execute and store at least one step first".into(),
            ));
        }
        *ctx.final_request.lock().unwrap() = Some(args.description);
        Ok(json!({
            "success": true,
            "total_steps": ctx.library.len(),
        }))
    }
}
