//! Traffic-derived client filter
//!
//! Drops clients the usage collector has disabled (expired or over quota)
//! from an inbound's settings before they reach the engine.

use crate::model::ClientTraffic;
use serde_json::Value;
use std::collections::HashSet;
use tracing::info;

/// Identity field of a client entry
const CLIENT_IDENTITY: &str = "email";

fn client_identity(client: &Value) -> Option<&str> {
    match client {
        Value::Object(fields) => match fields.get(CLIENT_IDENTITY) {
            Some(Value::String(email)) => Some(email.as_str()),
            _ => None,
        },
        _ => None,
    }
}

/// Remove every client whose identity has a disabled usage record.
///
/// Clients without a usage record are kept. Survivors keep their order.
pub fn filter_clients(clients: Vec<Value>, stats: &[ClientTraffic]) -> Vec<Value> {
    let disabled: HashSet<&str> = stats
        .iter()
        .filter(|s| !s.enable)
        .map(|s| s.email.as_str())
        .collect();

    if disabled.is_empty() {
        return clients;
    }

    clients
        .into_iter()
        .filter(|client| match client_identity(client) {
            Some(email) if disabled.contains(email) => {
                info!(client = email, "remove inbound client: expired or over traffic limit");
                false
            }
            _ => true,
        })
        .collect()
}

/// Apply [`filter_clients`] to the `clients` list of a settings object.
///
/// Settings without a `clients` list are left untouched. Returns the number
/// of removed clients.
pub fn filter_settings(settings: &mut Value, stats: &[ClientTraffic]) -> usize {
    let Value::Object(fields) = settings else {
        return 0;
    };
    let Some(Value::Array(clients)) = fields.get_mut("clients") else {
        return 0;
    };

    let before = clients.len();
    let kept = filter_clients(std::mem::take(clients), stats);
    let removed = before - kept.len();
    *clients = kept;
    removed
}
