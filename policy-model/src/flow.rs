use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Transport protocol carried by a flow or policy port rule.
///
/// Declaration order is significant: `PortMerger` sorts ascending by
/// protocol before port, and this derive gives exactly that order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Allow,
    Drop,
}

/// One line of an append-only network flow log, ingested in order of
/// `monotonic_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowRecord {
    pub src_id: String,
    pub dst_id: String,
    pub src_labels: BTreeMap<String, String>,
    pub dst_labels: BTreeMap<String, String>,
    pub src_namespace: String,
    pub dst_namespace: String,
    pub dst_ip: String,
    pub dst_port: u16,
    pub protocol: Protocol,
    pub verdict: Verdict,
    pub dns_query: Option<String>,
    pub http: Option<HttpInfo>,
    pub timestamp: DateTime<Utc>,
    pub monotonic_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpInfo {
    pub method: String,
    pub path: String,
}
