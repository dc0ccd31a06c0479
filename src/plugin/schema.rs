use jsonschema::Validator;
use lazy_static::lazy_static;
use serde_json::{json, Value};
use tracing::error;

lazy_static! {
    static ref CONDITION_TYPE_SCHEMA: Option<Validator> = compile(
        "condition",
        json!({
            "type": "object",
            "required": ["id"],
            "properties": {
                "id": { "type": "string", "minLength": 1 },
                "tags": { "type": "array", "items": { "type": "string" } },
                "systemTags": { "type": "array", "items": { "type": "string" } },
                "parentCondition": {
                    "type": "object",
                    "required": ["conditionTypeId"]
                },
                "parameters": { "type": "array" }
            }
        })
    );
    static ref ACTION_TYPE_SCHEMA: Option<Validator> = compile(
        "action",
        json!({
            "type": "object",
            "required": ["id", "actionExecutor"],
            "properties": {
                "id": { "type": "string", "minLength": 1 },
                "actionExecutor": { "type": "string", "minLength": 1 },
                "tags": { "type": "array", "items": { "type": "string" } },
                "systemTags": { "type": "array", "items": { "type": "string" } },
                "parameters": { "type": "array" }
            }
        })
    );
}

fn compile(name: &str, schema: Value) -> Option<Validator> {
    match jsonschema::validator_for(&schema) {
        Ok(validator) => Some(validator),
        Err(e) => {
            error!(schema = %name, error = %e, "Invalid built-in schema");
            None
        }
    }
}

fn check(validator: &Option<Validator>, document: &Value) -> Result<(), String> {
    let Some(validator) = validator else {
        return Ok(());
    };
    let errors: Vec<String> = validator.iter_errors(document).map(|e| e.to_string()).collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors.join("; "))
    }
}

pub fn validate_condition_type(document: &Value) -> Result<(), String> {
    check(&CONDITION_TYPE_SCHEMA, document)
}

pub fn validate_action_type(document: &Value) -> Result<(), String> {
    check(&ACTION_TYPE_SCHEMA, document)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_requires_executor() {
        assert!(validate_action_type(&json!({ "id": "mail", "actionExecutor": "mail" })).is_ok());
        assert!(validate_action_type(&json!({ "id": "mail" })).is_err());
    }

    #[test]
    fn condition_parent_needs_type_id() {
        assert!(validate_condition_type(&json!({ "id": "c", "systemTags": ["eventCondition"] })).is_ok());
        assert!(validate_condition_type(&json!({ "id": "c", "parentCondition": {} })).is_err());
        assert!(validate_condition_type(&json!({ "tags": [] })).is_err());
    }
}
