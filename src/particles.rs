//! Typed helpers for the particle-physics tool server.
//!
//! Each helper builds the argument object for one server tool, calls it
//! through [`ToolClient::call_tool`] and returns the normalized value, which
//! is `{"error": ...}` on failure. Extra keyword arguments are merged into the
//! argument object and may override the named ones.

use serde_json::{json, Map, Value};

use crate::tool_client::codec::float_value;
use crate::tool_client::ToolClient;

/// Extra tool arguments, merged over the named ones.
pub type Extra = Map<String, Value>;

pub mod tools {
    pub const SEARCH_PARTICLE: &str = "search_particle";
    pub const GET_PARTICLE_PROPERTIES: &str = "get_particle_properties";
    pub const GET_PARTICLE_QUANTUM_NUMBERS: &str = "get_particle_quantum_numbers";
    pub const GET_BRANCHING_FRACTIONS: &str = "get_branching_fractions";
    pub const COMPARE_PARTICLES: &str = "compare_particles";
    pub const CONVERT_UNITS: &str = "convert_units_advanced";
    pub const CHECK_PARTICLE_PROPERTIES: &str = "check_particle_properties";
}

fn arguments(named: Value, extra: Extra) -> Value {
    let mut args = match named {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    args.extend(extra);
    Value::Object(args)
}

/// Search by free-text query.
///
/// A `{"results": [...]}` answer is reshaped to `{"particles", "total_found"}`,
/// keeping only entries that carry a `name`.
pub async fn search_particle(client: &ToolClient, query: &str, extra: Extra) -> Value {
    let result = client
        .call_tool(tools::SEARCH_PARTICLE, arguments(json!({ "query": query }), extra))
        .await;
    reshape_search(result)
}

/// Full property record for one particle, always as `{"particle": {...}}`.
pub async fn get_particle_properties(client: &ToolClient, particle_name: &str, extra: Extra) -> Value {
    let result = client
        .call_tool(
            tools::GET_PARTICLE_PROPERTIES,
            arguments(json!({ "particle_name": particle_name }), extra),
        )
        .await;
    reshape_properties(result)
}

pub async fn get_particle_quantum_numbers(client: &ToolClient, particle_name: &str, extra: Extra) -> Value {
    client
        .call_tool(
            tools::GET_PARTICLE_QUANTUM_NUMBERS,
            arguments(json!({ "particle_name": particle_name }), extra),
        )
        .await
}

pub async fn get_branching_fractions(client: &ToolClient, particle_name: &str, extra: Extra) -> Value {
    client
        .call_tool(
            tools::GET_BRANCHING_FRACTIONS,
            arguments(json!({ "particle_name": particle_name }), extra),
        )
        .await
}

pub async fn compare_particles(client: &ToolClient, particle_names: &[&str], extra: Extra) -> Value {
    client
        .call_tool(
            tools::COMPARE_PARTICLES,
            arguments(json!({ "particle_names": particle_names }), extra),
        )
        .await
}

/// Convert `value` between units. Non-finite values are sent as sentinels.
pub async fn convert_units(
    client: &ToolClient,
    value: f64,
    from_units: &str,
    to_units: &str,
    extra: Extra,
) -> Value {
    let named = json!({
        "value": float_value(value),
        "from_units": from_units,
        "to_units": to_units,
    });
    client
        .call_tool(tools::CONVERT_UNITS, arguments(named, extra))
        .await
}

pub async fn check_particle_properties(client: &ToolClient, particle_name: &str, extra: Extra) -> Value {
    client
        .call_tool(
            tools::CHECK_PARTICLE_PROPERTIES,
            arguments(json!({ "particle_name": particle_name }), extra),
        )
        .await
}

// ─── Result Reshaping ────────────────────────────────────────────────────────

fn reshape_search(result: Value) -> Value {
    let Some(results) = result.get("results") else {
        return result;
    };

    let particles: Vec<Value> = results
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter(|r| r.get("name").is_some())
                .cloned()
                .collect()
        })
        .unwrap_or_default();

    let total_found = result
        .get("total_found")
        .cloned()
        .unwrap_or_else(|| json!(particles.len()));

    json!({ "particles": particles, "total_found": total_found })
}

fn reshape_properties(result: Value) -> Value {
    if result.get("particle").is_some() || result.get("name").is_none() {
        return result;
    }
    json!({ "particle": result })
}
