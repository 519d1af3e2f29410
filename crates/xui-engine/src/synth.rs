//! Config synthesis
//!
//! Template + enabled inbound records (with disabled clients filtered out)
//! + backend forwarding = the document the engine runs with.

use crate::config::{InboundConfig, SynthesizedConfig};
use crate::error::{EngineError, EngineResult};
use crate::filter::filter_settings;
use crate::inject::inject_backend_routes;
use crate::model::InboundRecord;
use crate::store::InboundStore;
use crate::template::TemplateSource;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Listen address used when a record leaves it empty
pub const WILDCARD_LISTEN: &str = "0.0.0.0";

/// Builds engine configs from the template and the inbound store
#[derive(Clone)]
pub struct ConfigSynthesizer {
    store: Arc<dyn InboundStore>,
    template: Arc<dyn TemplateSource>,
}

impl ConfigSynthesizer {
    pub fn new(store: Arc<dyn InboundStore>, template: Arc<dyn TemplateSource>) -> Self {
        Self { store, template }
    }

    /// Build a complete config. Fails as a whole if any record is malformed.
    pub async fn build(&self) -> EngineResult<SynthesizedConfig> {
        let template = self.template.config_template().await?;
        let mut config = SynthesizedConfig::from_template(&template)?;

        let disabled = self.store.disable_invalid_clients().await?;
        if disabled > 0 {
            info!(count = disabled, "disabled expired or exhausted clients");
        }

        let records = self.store.all_inbounds().await?;
        let mut backends = Vec::new();
        let mut seen_tags = HashSet::new();
        let mut seen_ports = HashSet::new();

        for mut record in records.into_iter().filter(|r| r.enable) {
            if !seen_tags.insert(record.tag.clone()) {
                warn!(tag = %record.tag, "duplicate inbound tag in database");
            }
            if !seen_ports.insert(record.port) {
                warn!(port = record.port, "duplicate inbound port in database");
            }

            config.inbounds.push(translate_record(&mut record)?);
            if record.backend_target().is_some() {
                backends.push(record);
            }
        }

        if !backends.is_empty() {
            let backends: Vec<&InboundRecord> = backends.iter().collect();
            inject_backend_routes(&mut config, &backends)?;
        }

        debug!(inbounds = config.inbounds.len(), "config synthesized");
        Ok(config)
    }
}

fn parse_blob(tag: &str, field: &'static str, raw: &str) -> EngineResult<Option<Value>> {
    if raw.trim().is_empty() {
        return Ok(None);
    }
    serde_json::from_str(raw)
        .map(Some)
        .map_err(|source| EngineError::SettingsParse {
            tag: tag.to_string(),
            field,
            source,
        })
}

/// Turn one enabled record into an inbound entry.
///
/// Filtered settings are written back into `record.settings` for the rest
/// of this pass; nothing is persisted.
pub fn translate_record(record: &mut InboundRecord) -> EngineResult<InboundConfig> {
    let mut settings = parse_blob(&record.tag, "settings", &record.settings)?;
    if let Some(settings) = settings.as_mut() {
        if filter_settings(settings, &record.client_stats) > 0 {
            record.settings = serde_json::to_string(settings)
                .map_err(|e| EngineError::Serialization(e.to_string()))?;
        }
    }

    let stream_settings = parse_blob(&record.tag, "streamSettings", &record.stream_settings)?;
    let sniffing = parse_blob(&record.tag, "sniffing", &record.sniffing)?;

    let listen = if record.listen.is_empty() {
        WILDCARD_LISTEN.to_string()
    } else {
        record.listen.clone()
    };

    let mut inbound = InboundConfig {
        listen: Some(Value::String(listen)),
        port: record.port,
        protocol: record.protocol.as_str().to_string(),
        settings,
        stream_settings,
        tag: record.tag.clone(),
        sniffing,
        backend_address: None,
        backend_port: None,
        enable_backend: false,
        backend_protocol: None,
    };

    if let Some((address, port)) = record.backend_target() {
        inbound.backend_address = Some(address.to_string());
        inbound.backend_port = Some(port);
        inbound.enable_backend = true;
        inbound.backend_protocol = record.backend_protocol.clone();
    }

    Ok(inbound)
}
