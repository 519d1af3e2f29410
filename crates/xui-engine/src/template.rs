//! Base config template source
//!
//! The template supplies everything the database does not own: logging,
//! the stats API, policy and the default outbounds/routing.

use crate::error::StoreError;
use async_trait::async_trait;
use std::path::PathBuf;

/// Built-in Xray template
pub const DEFAULT_TEMPLATE: &str = r#"{
  "log": {
    "loglevel": "warning",
    "access": "none"
  },
  "api": {
    "services": ["HandlerService", "LoggerService", "StatsService"],
    "tag": "api"
  },
  "inbounds": [
    {
      "listen": "127.0.0.1",
      "port": 62789,
      "protocol": "dokodemo-door",
      "settings": {
        "address": "127.0.0.1"
      },
      "tag": "api"
    }
  ],
  "outbounds": [
    {
      "protocol": "freedom",
      "settings": {}
    },
    {
      "protocol": "blackhole",
      "settings": {},
      "tag": "blocked"
    }
  ],
  "policy": {
    "levels": {
      "0": {
        "statsUserUplink": true,
        "statsUserDownlink": true
      }
    },
    "system": {
      "statsInboundDownlink": true,
      "statsInboundUplink": true
    }
  },
  "routing": {
    "domainStrategy": "IPIfNonMatch",
    "rules": [
      {
        "inboundTag": ["api"],
        "outboundTag": "api",
        "type": "field"
      },
      {
        "ip": ["geoip:private"],
        "outboundTag": "blocked",
        "type": "field"
      },
      {
        "outboundTag": "blocked",
        "protocol": ["bittorrent"],
        "type": "field"
      }
    ]
  },
  "stats": {}
}"#;

/// Provider of the base config template text
#[async_trait]
pub trait TemplateSource: Send + Sync {
    async fn config_template(&self) -> Result<String, StoreError>;
}

/// Template held in memory
#[derive(Debug, Clone)]
pub struct StaticTemplate(String);

impl StaticTemplate {
    pub fn new(template: impl Into<String>) -> Self {
        Self(template.into())
    }
}

impl Default for StaticTemplate {
    fn default() -> Self {
        Self::new(DEFAULT_TEMPLATE)
    }
}

#[async_trait]
impl TemplateSource for StaticTemplate {
    async fn config_template(&self) -> Result<String, StoreError> {
        Ok(self.0.clone())
    }
}

/// Template read from disk on every synthesis, so edits apply on the next restart check
#[derive(Debug, Clone)]
pub struct FileTemplate {
    path: PathBuf,
}

impl FileTemplate {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl TemplateSource for FileTemplate {
    async fn config_template(&self) -> Result<String, StoreError> {
        Ok(tokio::fs::read_to_string(&self.path).await?)
    }
}
