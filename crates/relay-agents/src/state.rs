use serde_json::{Map, Value};

/// Graph state is a flat JSON object; node functions return partial-state
/// patches that merge over it.
pub type AgentState = Map<String, Value>;

/// Keys the runtime owns. Node patches may read them but writes to the
/// counters are overridden by the runtime after each step.
pub mod keys {
    pub const RUN_ID: &str = "run_id";
    pub const STEP_COUNT: &str = "step_count";
    pub const TOKEN_COUNT: &str = "token_count";
    pub const ERROR: &str = "error";
    pub const NEEDS_SUSPENSION: &str = "needs_suspension";
    pub const SUSPENSION_REASON: &str = "suspension_reason";
    pub const CURRENT_STEP: &str = "current_step";
}

pub fn merge_patch(state: &mut AgentState, patch: Map<String, Value>) {
    for (key, value) in patch {
        state.insert(key, value);
    }
}

pub fn get_i64(state: &AgentState, key: &str) -> i64 {
    state.get(key).and_then(Value::as_i64).unwrap_or(0)
}

pub fn get_f64(state: &AgentState, key: &str) -> f64 {
    state.get(key).and_then(Value::as_f64).unwrap_or(0.0)
}

pub fn get_bool(state: &AgentState, key: &str) -> bool {
    state.get(key).and_then(Value::as_bool).unwrap_or(false)
}

pub fn get_str<'a>(state: &'a AgentState, key: &str) -> &'a str {
    state.get(key).and_then(Value::as_str).unwrap_or("")
}

/// Seed the runtime-owned keys over a caller-provided initial state.
pub fn base_state(initial: AgentState, run_id: i64) -> AgentState {
    let mut state = initial;
    state.insert(keys::RUN_ID.to_string(), Value::from(run_id));
    state.insert(keys::STEP_COUNT.to_string(), Value::from(0));
    state.insert(keys::TOKEN_COUNT.to_string(), Value::from(0));
    state.insert(keys::ERROR.to_string(), Value::Null);
    state.insert(keys::NEEDS_SUSPENSION.to_string(), Value::from(false));
    state.insert(keys::SUSPENSION_REASON.to_string(), Value::Null);
    state.insert(keys::CURRENT_STEP.to_string(), Value::from(""));
    state
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn patches_overwrite_existing_keys() {
        let mut state = AgentState::new();
        state.insert("a".to_string(), json!(1));
        let mut patch = Map::new();
        patch.insert("a".to_string(), json!(2));
        patch.insert("b".to_string(), json!("x"));
        merge_patch(&mut state, patch);
        assert_eq!(get_i64(&state, "a"), 2);
        assert_eq!(get_str(&state, "b"), "x");
    }

    #[test]
    fn base_state_seeds_runtime_keys() {
        let mut initial = AgentState::new();
        initial.insert("invoice_id".to_string(), json!(7));
        let state = base_state(initial, 42);
        assert_eq!(get_i64(&state, keys::RUN_ID), 42);
        assert_eq!(get_i64(&state, keys::STEP_COUNT), 0);
        assert!(!get_bool(&state, keys::NEEDS_SUSPENSION));
        assert_eq!(get_i64(&state, "invoice_id"), 7);
    }
}
