//! Backend forwarding injection
//!
//! For every inbound that forwards to a secondary backend, adds an
//! outbound named after the inbound and a routing rule binding the two.
//! Rules are prepended so they win over template rules under the engine's
//! first-match routing.

use crate::config::SynthesizedConfig;
use crate::error::{EngineError, EngineResult};
use crate::model::{BackendProtocol, InboundRecord};
use serde_json::{json, Map, Value};
use tracing::{debug, info};

/// Tag given to an untagged first outbound
pub const DEFAULT_OUTBOUND_TAG: &str = "direct";

/// Outbound tag for an inbound's backend
pub fn backend_outbound_tag(inbound_tag: &str) -> String {
    format!("backend-proxy-{}", inbound_tag)
}

fn backend_outbound(tag: &str, protocol: BackendProtocol, address: &str, port: u16) -> Value {
    match protocol {
        BackendProtocol::Socks => json!({
            "tag": tag,
            "protocol": "socks",
            "settings": {
                "servers": [{"address": address, "port": port}]
            }
        }),
        BackendProtocol::Dokodemo => json!({
            "tag": tag,
            "protocol": "freedom",
            "settings": {"domainStrategy": "UseIP"},
            "streamSettings": {
                "sockopt": {"dialerProxy": format!("{}:{}", address, port)}
            }
        }),
        BackendProtocol::Http => json!({
            "tag": tag,
            "protocol": "http",
            "settings": {
                "servers": [{"address": address, "port": port}]
            }
        }),
    }
}

fn parse_outbounds(blob: Option<&Value>) -> EngineResult<Vec<Value>> {
    match blob {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::Object(_) => Ok(item.clone()),
                other => Err(EngineError::Serialization(format!(
                    "outbound entry is not an object: {}",
                    other
                ))),
            })
            .collect(),
        Some(other) => Err(EngineError::Serialization(format!(
            "outbounds must be a list, got {}",
            other
        ))),
    }
}

fn parse_routing(blob: Option<&Value>) -> EngineResult<(Map<String, Value>, Vec<Value>)> {
    let routing = match blob {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(fields)) => fields.clone(),
        Some(other) => {
            return Err(EngineError::Serialization(format!(
                "routing must be an object, got {}",
                other
            )))
        }
    };

    let rules = match routing.get("rules") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(rules)) => rules.clone(),
        Some(other) => {
            return Err(EngineError::Serialization(format!(
                "routing rules must be a list, got {}",
                other
            )))
        }
    };

    Ok((routing, rules))
}

/// Add backend outbounds and routing rules for `backends`.
///
/// Works on copies of the outbound and routing blobs; `config` is only
/// written once everything succeeded.
pub fn inject_backend_routes(
    config: &mut SynthesizedConfig,
    backends: &[&InboundRecord],
) -> EngineResult<()> {
    let mut outbounds = parse_outbounds(config.outbounds.as_ref())?;
    let (mut routing, mut rules) = parse_routing(config.routing.as_ref())?;

    if let Some(Value::Object(first)) = outbounds.first_mut() {
        if !first.contains_key("tag") {
            debug!("tagging first outbound as {}", DEFAULT_OUTBOUND_TAG);
            first.insert("tag".into(), Value::String(DEFAULT_OUTBOUND_TAG.into()));
        }
    }

    for record in backends {
        let Some((address, port)) = record.backend_target() else {
            continue;
        };
        let outbound_tag = backend_outbound_tag(&record.tag);
        let protocol = record.backend_protocol();

        outbounds.push(backend_outbound(&outbound_tag, protocol, address, port));

        rules.insert(
            0,
            json!({
                "type": "field",
                "inboundTag": [record.tag],
                "outboundTag": outbound_tag,
            }),
        );

        info!(
            inbound = %record.tag,
            backend = %format!("{}:{}", address, port),
            protocol = ?protocol,
            "backend forwarding enabled"
        );
    }

    routing.insert("rules".into(), Value::Array(rules));
    config.outbounds = Some(Value::Array(outbounds));
    config.routing = Some(Value::Object(routing));

    Ok(())
}
