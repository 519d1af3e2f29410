//! Synthesized Xray configuration
//!
//! The document handed to the engine: template blobs kept as generic JSON
//! values plus the typed inbound list built from the database.

use crate::error::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Tag of the inbound the engine exposes its stats API on
pub const API_INBOUND_TAG: &str = "api";

/// Inbound fields used only by the backend injector; never handed to the engine
const BACKEND_EXTENSION_KEYS: [&str; 3] = ["backendAddress", "backendPort", "enableBackend"];

/// One entry of the engine's `inbounds` list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen: Option<Value>,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub protocol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_settings: Option<Value>,
    #[serde(default)]
    pub tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sniffing: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_port: Option<u16>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub enable_backend: bool,
    /// Backend protocol name as stored on the record
    #[serde(skip)]
    pub backend_protocol: Option<String>,
}

impl InboundConfig {
    /// Field-by-field comparison; JSON blobs compare by canonical bytes
    pub fn equals(&self, other: &InboundConfig) -> bool {
        canonical_bytes(self.listen.as_ref()) == canonical_bytes(other.listen.as_ref())
            && self.port == other.port
            && self.protocol == other.protocol
            && canonical_bytes(self.settings.as_ref()) == canonical_bytes(other.settings.as_ref())
            && canonical_bytes(self.stream_settings.as_ref())
                == canonical_bytes(other.stream_settings.as_ref())
            && self.tag == other.tag
            && canonical_bytes(self.sniffing.as_ref()) == canonical_bytes(other.sniffing.as_ref())
            && self.backend_address == other.backend_address
            && self.backend_port == other.backend_port
            && self.enable_backend == other.enable_backend
            && self.backend_protocol == other.backend_protocol
    }
}

/// Full engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SynthesizedConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns: Option<Value>,
    #[serde(default)]
    pub inbounds: Vec<InboundConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outbounds: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reverse: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fakedns: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<Value>,
}

impl SynthesizedConfig {
    /// Parse a config template
    pub fn from_template(template: &str) -> EngineResult<Self> {
        serde_json::from_str(template).map_err(EngineError::TemplateParse)
    }

    /// Conservative structural equality.
    ///
    /// Never reports equal when the engine would behave differently; it may
    /// report unequal for semantically identical documents (for example
    /// `1` vs `1.0`), which only costs a restart.
    pub fn equals(&self, other: &SynthesizedConfig) -> bool {
        if self.inbounds.len() != other.inbounds.len() {
            return false;
        }
        if !self
            .inbounds
            .iter()
            .zip(&other.inbounds)
            .all(|(a, b)| a.equals(b))
        {
            return false;
        }

        self.blobs()
            .iter()
            .zip(other.blobs().iter())
            .all(|(a, b)| canonical_bytes(*a) == canonical_bytes(*b))
    }

    fn blobs(&self) -> [Option<&Value>; 10] {
        [
            self.log.as_ref(),
            self.api.as_ref(),
            self.dns.as_ref(),
            self.outbounds.as_ref(),
            self.routing.as_ref(),
            self.policy.as_ref(),
            self.stats.as_ref(),
            self.reverse.as_ref(),
            self.fakedns.as_ref(),
            self.transport.as_ref(),
        ]
    }

    /// Document written for the engine, with injector bookkeeping stripped
    pub fn to_engine_json(&self) -> EngineResult<Value> {
        let mut doc =
            serde_json::to_value(self).map_err(|e| EngineError::Serialization(e.to_string()))?;

        if let Some(Value::Array(inbounds)) = doc.get_mut("inbounds") {
            for inbound in inbounds.iter_mut() {
                if let Value::Object(fields) = inbound {
                    for key in BACKEND_EXTENSION_KEYS {
                        fields.remove(key);
                    }
                }
            }
        }

        Ok(doc)
    }

    /// Port of the stats API inbound, if the template declares one
    pub fn api_port(&self) -> Option<u16> {
        self.inbounds
            .iter()
            .find(|inbound| inbound.tag == API_INBOUND_TAG)
            .map(|inbound| inbound.port)
            .filter(|port| *port > 0)
    }
}

/// Recursively sort object keys so serialization is deterministic.
///
/// `serde_json::Map` is only sorted while the `preserve_order` feature is
/// off; sorting here keeps equality stable if any dependency turns it on.
pub fn normalize_value(value: Value) -> Value {
    match value {
        Value::Object(mut fields) => {
            let mut keys: Vec<String> = fields.keys().cloned().collect();
            keys.sort_unstable();
            let mut sorted = Map::new();
            for key in keys {
                if let Some(v) = fields.remove(&key) {
                    sorted.insert(key, normalize_value(v));
                }
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(normalize_value).collect()),
        scalar => scalar,
    }
}

/// Canonical byte form of an optional blob; absent blobs map to no bytes
pub fn canonical_bytes(value: Option<&Value>) -> Vec<u8> {
    match value {
        // Serializing a `Value` cannot fail: keys are always strings.
        Some(v) => serde_json::to_vec(&normalize_value(v.clone())).unwrap_or_default(),
        None => Vec::new(),
    }
}
