//! Traffic counters reported by the engine's stats API
//!
//! `xray api statsquery` prints `{"stat": [{"name": ..., "value": ...}]}`
//! where names look like `inbound>>>TAG>>>traffic>>>uplink`.

use crate::config::API_INBOUND_TAG;
use crate::error::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Per-inbound (or outbound) byte counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundTraffic {
    pub is_inbound: bool,
    pub tag: String,
    pub up: i64,
    pub down: i64,
}

/// Per-client byte counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientTrafficSample {
    pub email: String,
    pub up: i64,
    pub down: i64,
}

/// Everything one stats query returned
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficReport {
    pub inbounds: Vec<InboundTraffic>,
    pub clients: Vec<ClientTrafficSample>,
}

#[derive(Debug, Deserialize)]
struct StatsResponse {
    #[serde(default)]
    stat: Vec<StatEntry>,
}

#[derive(Debug, Deserialize)]
struct StatEntry {
    name: String,
    #[serde(default)]
    value: Value,
}

fn counter(value: &Value) -> i64 {
    match value {
        Value::Number(n) => n.as_i64().unwrap_or(0),
        Value::String(s) => s.parse().unwrap_or(0),
        _ => 0,
    }
}

#[derive(Clone, Copy)]
enum Direction {
    Up,
    Down,
}

impl Direction {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "uplink" => Some(Direction::Up),
            "downlink" => Some(Direction::Down),
            _ => None,
        }
    }
}

fn add(up: &mut i64, down: &mut i64, direction: Direction, value: i64) {
    match direction {
        Direction::Up => *up += value,
        Direction::Down => *down += value,
    }
}

/// Fold raw stats query output into per-inbound and per-client counters.
///
/// First-seen order is kept. The stats API inbound itself is skipped.
pub fn parse_stats(output: &str) -> EngineResult<TrafficReport> {
    if output.trim().is_empty() {
        return Ok(TrafficReport::default());
    }
    let response: StatsResponse = serde_json::from_str(output)
        .map_err(|e| EngineError::Telemetry(format!("malformed stats output: {}", e)))?;

    let mut report = TrafficReport::default();
    for entry in response.stat {
        let parts: Vec<&str> = entry.name.split(">>>").collect();
        let [kind, name, "traffic", direction] = parts.as_slice() else {
            debug!(stat = %entry.name, "ignoring stat");
            continue;
        };
        let Some(direction) = Direction::parse(direction) else {
            continue;
        };
        let value = counter(&entry.value);

        match *kind {
            "inbound" | "outbound" => {
                if *name == API_INBOUND_TAG {
                    continue;
                }
                let is_inbound = *kind == "inbound";
                let idx = match report
                    .inbounds
                    .iter()
                    .position(|t| t.is_inbound == is_inbound && t.tag == *name)
                {
                    Some(idx) => idx,
                    None => {
                        report.inbounds.push(InboundTraffic {
                            is_inbound,
                            tag: name.to_string(),
                            ..Default::default()
                        });
                        report.inbounds.len() - 1
                    }
                };
                let traffic = &mut report.inbounds[idx];
                add(&mut traffic.up, &mut traffic.down, direction, value);
            }
            "user" => {
                let idx = match report.clients.iter().position(|c| c.email == *name) {
                    Some(idx) => idx,
                    None => {
                        report.clients.push(ClientTrafficSample {
                            email: name.to_string(),
                            ..Default::default()
                        });
                        report.clients.len() - 1
                    }
                };
                let sample = &mut report.clients[idx];
                add(&mut sample.up, &mut sample.down, direction, value);
            }
            _ => {}
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_folds_directions_and_kinds() {
        let output = r#"{"stat": [
            {"name": "inbound>>>in1>>>traffic>>>uplink", "value": 100},
            {"name": "inbound>>>in1>>>traffic>>>downlink", "value": "2500"},
            {"name": "outbound>>>direct>>>traffic>>>downlink", "value": 7},
            {"name": "inbound>>>api>>>traffic>>>uplink", "value": 9},
            {"name": "user>>>a@x>>>traffic>>>uplink", "value": 3},
            {"name": "user>>>a@x>>>traffic>>>downlink"}
        ]}"#;

        let report = parse_stats(output).unwrap();
        assert_eq!(
            report.inbounds,
            vec![
                InboundTraffic { is_inbound: true, tag: "in1".into(), up: 100, down: 2500 },
                InboundTraffic { is_inbound: false, tag: "direct".into(), up: 0, down: 7 },
            ]
        );
        assert_eq!(
            report.clients,
            vec![ClientTrafficSample { email: "a@x".into(), up: 3, down: 0 }]
        );
    }

    #[test]
    fn test_unknown_names_ignored() {
        let output = r#"{"stat": [
            {"name": "inbound>>>in1>>>traffic", "value": 1},
            {"name": "inbound>>>in1>>>traffic>>>sideways", "value": 1},
            {"name": "node>>>x>>>traffic>>>uplink", "value": 1}
        ]}"#;
        assert_eq!(parse_stats(output).unwrap(), TrafficReport::default());
    }

    #[test]
    fn test_empty_and_malformed_output() {
        assert_eq!(parse_stats("  \n").unwrap(), TrafficReport::default());
        assert_eq!(parse_stats("{}").unwrap(), TrafficReport::default());
        assert!(matches!(parse_stats("not json"), Err(EngineError::Telemetry(_))));
    }
}
