//! Master lifecycle state shared with [`MasterHandle`](crate::MasterHandle).

use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Where the master is in its lifecycle.
///
/// ```text
/// Initializing ─► DetectingPorts ─► ForkingAgent ─► WaitingAgent
///      ─► ForkingApps ─► WaitingApps ─► Ready ─► Closing ─► Exited
/// ```
///
/// Fatal boot failures jump straight to `Exited`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Initializing,
    DetectingPorts,
    ForkingAgent,
    WaitingAgent,
    ForkingApps,
    WaitingApps,
    Ready,
    Closing,
    Exited,
}

/// Payload of the `egg-ready` message sent to the parent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadyInfo {
    pub port: Option<u16>,
    pub debug_port: Option<u16>,
    pub address: String,
    pub protocol: String,
}

/// Outcome of the boot sequence.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Readiness {
    Pending,
    Ready(ReadyInfo),
    Failed(Arc<str>),
}

/// Address reported by an app worker in `app-start`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ListeningAddress {
    pub address: Option<String>,
    pub port: Option<u16>,
    /// `4`, `6` or `-1` for a Unix socket.
    pub address_type: Option<i32>,
}

impl ListeningAddress {
    pub fn is_unix_socket(&self) -> bool {
        self.address_type == Some(-1)
    }
}

/// URL announced once the cluster is ready.
///
/// Unix sockets are announced by path. Otherwise the reported address wins, then
/// `host` unless it is `0.0.0.0`, then `127.0.0.1`.
pub fn ready_address(address: &ListeningAddress, port: Option<u16>, protocol: &str, host: Option<&str>) -> String {
    if address.is_unix_socket() {
        return address.address.clone().unwrap_or_default();
    }
    let hostname = address
        .address
        .as_deref()
        .filter(|a| !a.is_empty())
        .or(host.filter(|h| *h != "0.0.0.0"))
        .unwrap_or("127.0.0.1");
    match port {
        Some(port) => format!("{protocol}://{hostname}:{port}"),
        None => format!("{protocol}://{hostname}"),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn tcp(address: Option<&str>) -> ListeningAddress {
        ListeningAddress {
            address: address.map(str::to_string),
            port: Some(7001),
            address_type: Some(4),
        }
    }

    #[test]
    fn test_unix_socket_is_announced_by_path() {
        let addr: ListeningAddress =
            serde_json::from_value(json!({ "address": "/tmp/app.sock", "port": null, "addressType": -1 })).unwrap();
        assert_eq!(ready_address(&addr, None, "http", Some("example.com")), "/tmp/app.sock");
    }

    #[test]
    fn test_hostname_fallbacks() {
        assert_eq!(ready_address(&tcp(Some("10.0.0.1")), Some(7001), "http", Some("h")), "http://10.0.0.1:7001");
        assert_eq!(ready_address(&tcp(None), Some(7001), "https", Some("h")), "https://h:7001");
        assert_eq!(ready_address(&tcp(None), Some(7001), "http", Some("0.0.0.0")), "http://127.0.0.1:7001");
        assert_eq!(ready_address(&tcp(None), Some(7001), "http", None), "http://127.0.0.1:7001");
    }

    #[test]
    fn test_ready_info_wire_shape() {
        let info = ReadyInfo {
            port: Some(7001),
            debug_port: None,
            address: "http://127.0.0.1:7001".into(),
            protocol: "http".into(),
        };
        assert_eq!(
            serde_json::to_value(&info).unwrap(),
            json!({ "port": 7001, "debugPort": null, "address": "http://127.0.0.1:7001", "protocol": "http" })
        );
    }
}
