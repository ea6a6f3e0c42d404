//! Serverset member records: decoding of the JSON payload stored in each
//! ephemeral member node, and the label set a member contributes to its
//! target group.

use crate::error::{DiscoveryError, Result};
use serde::{Deserialize, Deserializer, Serialize};
use serverset_core::{LabelSet, ADDRESS_LABEL, META_LABEL_PREFIX};
use std::collections::BTreeMap;
use std::fmt;

/// A host/port pair advertised by a member.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    #[serde(alias = "Host")]
    pub host: String,
    #[serde(alias = "Port")]
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Formats the endpoint as `host:port`, bracketing IPv6 hosts.
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Member health as published by the service. Values other than the three
/// known ones are carried through untouched.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MemberStatus {
    Alive,
    Dead,
    Warning,
    Other(String),
}

impl MemberStatus {
    pub fn as_str(&self) -> &str {
        match self {
            MemberStatus::Alive => "ALIVE",
            MemberStatus::Dead => "DEAD",
            MemberStatus::Warning => "WARNING",
            MemberStatus::Other(s) => s,
        }
    }
}

impl From<String> for MemberStatus {
    fn from(s: String) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "ALIVE" => MemberStatus::Alive,
            "DEAD" => MemberStatus::Dead,
            "WARNING" => MemberStatus::Warning,
            _ => MemberStatus::Other(s),
        }
    }
}

impl From<MemberStatus> for String {
    fn from(status: MemberStatus) -> Self {
        status.as_str().to_string()
    }
}

impl fmt::Display for MemberStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decoded payload of one member node.
///
/// Identity belongs to the node name, not to this record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServersetMember {
    #[serde(alias = "ServiceEndpoint")]
    pub service_endpoint: Endpoint,

    #[serde(
        default,
        alias = "AdditionalEndpoints",
        deserialize_with = "null_as_empty",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub additional_endpoints: BTreeMap<String, Endpoint>,

    #[serde(default, alias = "Shard", skip_serializing_if = "Option::is_none")]
    pub shard: Option<i32>,

    #[serde(default, alias = "Status", skip_serializing_if = "Option::is_none")]
    pub status: Option<MemberStatus>,
}

fn null_as_empty<'de, D>(deserializer: D) -> std::result::Result<BTreeMap<String, Endpoint>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<BTreeMap<String, Endpoint>>::deserialize(deserializer).map(Option::unwrap_or_default)
}

impl ServersetMember {
    /// Creates a member with only a primary service endpoint.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            service_endpoint: Endpoint::new(host, port),
            additional_endpoints: BTreeMap::new(),
            shard: None,
            status: None,
        }
    }

    pub fn with_endpoint(mut self, name: impl Into<String>, endpoint: Endpoint) -> Self {
        self.additional_endpoints.insert(name.into(), endpoint);
        self
    }

    pub fn with_shard(mut self, shard: i32) -> Self {
        self.shard = Some(shard);
        self
    }

    pub fn with_status(mut self, status: MemberStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Labels this member contributes, `path` being its node path.
    pub fn labels(&self, path: &str) -> LabelSet {
        let mut labels = LabelSet::new();
        labels.insert(ADDRESS_LABEL.to_string(), self.service_endpoint.address());
        labels.insert(meta("path"), path.to_string());
        labels.insert(meta("endpoint_host"), self.service_endpoint.host.clone());
        labels.insert(meta("endpoint_port"), self.service_endpoint.port.to_string());

        for (name, endpoint) in &self.additional_endpoints {
            let name = sanitize_label_name(name);
            labels.insert(meta(&format!("endpoint_host_{}", name)), endpoint.host.clone());
            labels.insert(meta(&format!("endpoint_port_{}", name)), endpoint.port.to_string());
        }

        if let Some(shard) = self.shard {
            labels.insert(meta("shard"), shard.to_string());
        }
        if let Some(status) = &self.status {
            labels.insert(meta("status"), status.to_string());
        }
        labels
    }
}

fn meta(name: &str) -> String {
    format!("{}{}", META_LABEL_PREFIX, name)
}

/// Replaces every character outside `[a-zA-Z0-9_]` with `_`.
pub fn sanitize_label_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

/// Returns true if `name` is a member node: `prefix` followed by a sequence
/// number.
pub fn is_member_node(name: &str, prefix: &str) -> bool {
    name.strip_prefix(prefix)
        .is_some_and(|seq| !seq.is_empty() && seq.bytes().all(|b| b.is_ascii_digit()))
}

/// Decodes a member payload. Unknown fields are ignored.
pub fn decode(bytes: &[u8]) -> Result<ServersetMember> {
    serde_json::from_slice(bytes).map_err(|e| DiscoveryError::MalformedPayload {
        reason: e.to_string(),
    })
}

/// Encodes a member payload, the inverse of [`decode`].
pub fn encode(member: &ServersetMember) -> Result<Vec<u8>> {
    serde_json::to_vec(member)
        .map_err(|e| DiscoveryError::Internal(format!("encoding serverset member: {}", e)))
}
