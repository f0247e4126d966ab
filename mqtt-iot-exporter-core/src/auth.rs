//! Device authorization and connection lifecycle hooks.
//!
//! Every topic a device touches must be scoped to its own identifier:
//! a client whose declared username is `sensor-7` may only publish or
//! subscribe below `device/sensor-7/`.

use tracing::warn;

use crate::topics;

/// Identity a client declared when it connected.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientInfo {
    /// MQTT client identifier.
    pub client_id: String,
    /// Declared username, empty when the client sent none.
    pub username: String,
}

impl ClientInfo {
    /// Create client info from an id and a username.
    pub fn new(client_id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            username: username.into(),
        }
    }
}

/// Kind of topic access being checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Publish,
    Subscribe,
}

/// Decides whether clients may connect and which topics they may use.
pub trait Authorizer: Send + Sync {
    /// Check a client at connection time.
    fn on_connect(&self, client: &ClientInfo) -> bool;

    /// Check a single publish or subscribe attempt.
    fn on_acl_check(&self, client: &ClientInfo, topic: &str, access: Access) -> bool;
}

/// Observer of connection lifecycle events.
pub trait ConnectionEvents: Send + Sync {
    /// A client completed its handshake.
    fn on_connect(&self, client: &ClientInfo);

    /// A connected client went away. `clean` is false when the connection
    /// ended without a DISCONNECT packet.
    fn on_disconnect(&self, client: &ClientInfo, clean: bool);
}

/// Authorizer tying topic access to the device id in the topic.
///
/// Connections are always accepted: the username is taken as claimed and
/// the real trust anchor is the transport (mutual TLS).
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceTopicAuthorizer;

impl Authorizer for DeviceTopicAuthorizer {
    fn on_connect(&self, _client: &ClientInfo) -> bool {
        true
    }

    fn on_acl_check(&self, client: &ClientInfo, topic: &str, access: Access) -> bool {
        let Ok(device_id) = topics::device_id(topic) else {
            warn!(
                client_id = %client.client_id,
                topic = %topic,
                ?access,
                "Denied access to topic outside the device namespace"
            );
            return false;
        };

        if device_id.contains(['+', '#']) || device_id != client.username {
            warn!(
                client_id = %client.client_id,
                topic = %topic,
                username = %client.username,
                ?access,
                "Client tried to access another device's topic"
            );
            return false;
        }

        true
    }
}
