//! Proxy core config validation and API injection.
//!
//! The control-plane hands us an arbitrary JSON document. Before it reaches
//! the proxy core we make sure the core's own control API is reachable on
//! the configured port, and drop inbounds the node is not allowed to serve.

use std::{
    collections::BTreeSet,
    net::{IpAddr, Ipv4Addr},
    path::PathBuf,
};

use serde::Serialize;
use serde_json::{Map, Value, json};
use thiserror::Error;

/// Tag of the injected API inbound.
pub const API_INBOUND_TAG: &str = "API_INBOUND";

/// Tag of the API outbound the routing rule targets.
pub const API_OUTBOUND_TAG: &str = "API";

/// Protocol the proxy core's API feature listens with.
pub const API_INBOUND_PROTOCOL: &str = "dokodemo-door";

/// API services enabled on the proxy core.
const API_SERVICES: [&str; 3] = ["HandlerService", "StatsService", "LoggerService"];

/// Config error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to decode config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Malformed config: {0}")]
    Malformed(String),
}

/// Where the injected API inbound listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiEndpoint {
    pub host: String,
    pub port: u16,
    /// Certificate and key securing the API inbound.
    pub certificate: Option<(PathBuf, PathBuf)>,
}

impl ApiEndpoint {
    /// Plain endpoint without TLS.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            certificate: None,
        }
    }
}

/// Typed view over a proxy core configuration document.
///
/// The shape of `inbounds`, `outbounds` and `routing.rules` is checked on
/// construction; everything else is carried through untouched.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ConfigDocument(Map<String, Value>);

impl ConfigDocument {
    /// Parse a JSON-encoded document.
    ///
    /// # Errors
    /// Returns error if the text is not JSON or has the wrong shape.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        Self::from_value(serde_json::from_str(text)?)
    }

    /// Validate the shape of a JSON value.
    ///
    /// # Errors
    /// Returns error if the value is not an object, or a known section has
    /// the wrong type.
    pub fn from_value(value: Value) -> Result<Self, ConfigError> {
        let Value::Object(map) = value else {
            return Err(ConfigError::Malformed("config is not a JSON object".into()));
        };

        for key in ["inbounds", "outbounds"] {
            if map.get(key).is_some_and(|v| !v.is_array()) {
                return Err(ConfigError::Malformed(format!("`{key}` must be an array")));
            }
        }
        if let Some(routing) = map.get("routing") {
            let Some(routing) = routing.as_object() else {
                return Err(ConfigError::Malformed("`routing` must be an object".into()));
            };
            if routing.get("rules").is_some_and(|v| !v.is_array()) {
                return Err(ConfigError::Malformed(
                    "`routing.rules` must be an array".into(),
                ));
            }
        }

        Ok(Self(map))
    }

    /// Inbound entries, in document order.
    #[must_use]
    pub fn inbounds(&self) -> &[Value] {
        array_of(&self.0, "inbounds")
    }

    /// Outbound entries, in document order.
    #[must_use]
    pub fn outbounds(&self) -> &[Value] {
        array_of(&self.0, "outbounds")
    }

    /// Routing rules, in precedence order.
    #[must_use]
    pub fn routing_rules(&self) -> &[Value] {
        self.0
            .get("routing")
            .and_then(Value::as_object)
            .map(|routing| array_of(routing, "rules"))
            .unwrap_or_default()
    }

    /// Tags of the inbounds; `None` for untagged entries.
    pub fn inbound_tags(&self) -> impl Iterator<Item = Option<&str>> {
        self.inbounds().iter().map(tag_of)
    }

    /// Raw access to the document.
    #[must_use]
    pub const fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Mutable access for launch-time adjustments.
    pub const fn as_map_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.0
    }

    /// Convert back into a plain JSON value.
    #[must_use]
    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    /// Serialize to compact JSON.
    #[must_use]
    pub fn to_json(&self) -> String {
        Value::Object(self.0.clone()).to_string()
    }

    fn inbounds_mut(&mut self) -> &mut Vec<Value> {
        array_entry(&mut self.0, "inbounds")
    }

    fn routing_rules_mut(&mut self) -> &mut Vec<Value> {
        let routing = self
            .0
            .entry("routing")
            .or_insert_with(|| Value::Object(Map::new()));
        if !routing.is_object() {
            *routing = Value::Object(Map::new());
        }
        match routing {
            Value::Object(routing) => array_entry(routing, "rules"),
            _ => unreachable!("routing was just made an object"),
        }
    }
}

fn tag_of(entry: &Value) -> Option<&str> {
    entry.get("tag").and_then(Value::as_str)
}

fn array_of<'a>(map: &'a Map<String, Value>, key: &str) -> &'a [Value] {
    map.get(key)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

fn array_entry<'a>(map: &'a mut Map<String, Value>, key: &str) -> &'a mut Vec<Value> {
    let entry = map
        .entry(key)
        .or_insert_with(|| Value::Array(Vec::new()));
    if !entry.is_array() {
        *entry = Value::Array(Vec::new());
    }
    match entry {
        Value::Array(items) => items,
        _ => unreachable!("entry was just made an array"),
    }
}

/// Validate `raw` and inject the proxy core's API plumbing.
///
/// The API routing rule only admits loopback and `peer`, the control-plane
/// address the session was opened from.
///
/// Deterministic and idempotent: feeding the output back in with the same
/// arguments yields the same document.
///
/// # Errors
/// Returns [`ConfigError::Malformed`] if `raw` has the wrong shape.
pub fn transform(
    raw: Value,
    allowed_tags: &BTreeSet<String>,
    api: &ApiEndpoint,
    peer: IpAddr,
) -> Result<ConfigDocument, ConfigError> {
    let mut doc = ConfigDocument::from_value(raw)?;

    doc.inbounds_mut().retain(|inbound| match tag_of(inbound) {
        Some(API_INBOUND_TAG) => false,
        Some(tag) => allowed_tags.is_empty() || allowed_tags.contains(tag),
        None => allowed_tags.is_empty(),
    });

    let previous_api_tag = doc
        .as_map()
        .get("api")
        .and_then(|api| api.get("tag"))
        .and_then(Value::as_str)
        .map(str::to_owned);
    doc.routing_rules_mut().retain(|rule| {
        let outbound = rule.get("outboundTag").and_then(Value::as_str);
        !matches!(
            outbound,
            Some(tag) if tag == API_OUTBOUND_TAG || Some(tag) == previous_api_tag.as_deref()
        )
    });

    let map = doc.as_map_mut();
    map.insert(
        "api".to_string(),
        json!({ "tag": API_OUTBOUND_TAG, "services": API_SERVICES }),
    );
    if !map.get("stats").is_some_and(Value::is_object) {
        map.insert("stats".to_string(), json!({}));
    }

    let inbound = api_inbound(api);
    doc.inbounds_mut().push(inbound);
    doc.routing_rules_mut().insert(
        0,
        json!({
            "type": "field",
            "inboundTag": [API_INBOUND_TAG],
            "source": api_sources(peer),
            "outboundTag": API_OUTBOUND_TAG,
        }),
    );

    Ok(doc)
}

fn api_sources(peer: IpAddr) -> Vec<String> {
    let loopback = IpAddr::V4(Ipv4Addr::LOCALHOST);
    let mut sources = vec![loopback.to_string()];
    if peer.to_canonical() != loopback {
        sources.push(peer.to_canonical().to_string());
    }
    sources
}

fn api_inbound(api: &ApiEndpoint) -> Value {
    let mut inbound = json!({
        "listen": api.host,
        "port": api.port,
        "protocol": API_INBOUND_PROTOCOL,
        "settings": { "address": "127.0.0.1" },
        "tag": API_INBOUND_TAG,
    });
    if let (Some((cert, key)), Value::Object(map)) = (&api.certificate, &mut inbound) {
        map.insert(
            "streamSettings".to_string(),
            json!({
                "security": "tls",
                "tlsSettings": {
                    "certificates": [{
                        "certificateFile": cert.display().to_string(),
                        "keyFile": key.display().to_string(),
                    }]
                }
            }),
        );
    }
    inbound
}
