use std::sync::Arc;
use num_enum::TryFromPrimitive;
use tracing::{debug, trace, warn};
use crate::message_types::{MessageChannel, MessageId, MessagePriority, MessageReliability, TunnelMsgType};
use crate::network_connection::{NetworkConnection, NetworkConnectionListener};
use crate::network_message::NetworkInMessage;

/// Relays tunnel traffic between two connections. Each side is told through a tunnel control
///  message when the other side becomes reachable or unreachable.
///
/// Tunnel messages carry the settings for sending them on in their header:
///
/// ```ascii
/// 0: MessageId::Tunnel
/// 1: priority
/// 2: reliability
/// 3: channel
/// 4: payload
/// ```
///
/// They are forwarded unmodified. Tunnel control messages concern only the side that received
///  them and are never forwarded.
pub struct TunnelBridge {
    inner: Arc<BridgeInner>,
}

struct BridgeInner {
    primary: NetworkConnection,
    secondary: NetworkConnection,
}

const BRIDGED_TAGS: [MessageId; 2] = [MessageId::Tunnel, MessageId::TunnelControl];

impl TunnelBridge {
    pub fn new(primary: NetworkConnection, secondary: NetworkConnection) -> TunnelBridge {
        let inner = Arc::new(BridgeInner { primary, secondary });

        for side in [&inner.primary, &inner.secondary] {
            for tag in BRIDGED_TAGS {
                side.add_listener_async(tag.into(), inner.clone());
            }
        }
        inner.send_connection_messages();

        TunnelBridge { inner }
    }

    /// Both sides are connected
    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }
}

impl Drop for TunnelBridge {
    fn drop(&mut self) {
        let listener: Arc<dyn NetworkConnectionListener> = self.inner.clone();
        for side in [&self.inner.primary, &self.inner.secondary] {
            for tag in BRIDGED_TAGS {
                side.remove_listener_async(tag.into(), &listener);
            }
        }

        if self.inner.is_connected() {
            self.inner.send_control(&self.inner.primary, TunnelMsgType::RemotePeerDisconnected);
            self.inner.send_control(&self.inner.secondary, TunnelMsgType::RemotePeerDisconnected);
        }
    }
}

impl BridgeInner {
    fn is_connected(&self) -> bool {
        self.primary.is_connected() && self.secondary.is_connected()
    }

    fn other_side(&self, connection: &NetworkConnection) -> &NetworkConnection {
        if connection.connection_guid() == self.primary.connection_guid() {
            &self.secondary
        }
        else {
            &self.primary
        }
    }

    fn send_connection_messages(&self) {
        if self.is_connected() {
            debug!("both sides of tunnel are connected");
            self.send_control(&self.primary, TunnelMsgType::RemotePeerConnected);
            self.send_control(&self.secondary, TunnelMsgType::RemotePeerConnected);
        }
    }

    fn send_control(&self, side: &NetworkConnection, msg_type: TunnelMsgType) {
        let mut message = side.create_message(MessageId::TunnelControl.into());
        message.write_u8(msg_type.into());
        side.send_and_release(message, MessagePriority::Medium, MessageReliability::ReliableOrdered, MessageChannel::DEFAULT);
    }
}

impl NetworkConnectionListener for BridgeInner {
    fn on_connected(&self, _connection: &NetworkConnection) {
        self.send_connection_messages();
    }

    fn on_disconnected(&self, connection: &NetworkConnection) {
        let other = self.other_side(connection);
        if other.is_connected() {
            self.send_control(other, TunnelMsgType::RemotePeerDisconnected);
        }
    }

    fn on_message_received(&self, connection: &NetworkConnection, message: &mut NetworkInMessage) {
        let tunnel_tag: u8 = MessageId::Tunnel.into();
        if message.tag() != Some(tunnel_tag) {
            trace!("{:?}: tunnel control message is not forwarded", connection);
            return;
        }

        let other = self.other_side(connection);
        if !other.is_connected() {
            warn!("received tunnel message while the other side is not connected - dropping");
            return;
        }

        let (priority, reliability, channel) = match read_header(message) {
            Ok(header) => header,
            Err(e) => {
                warn!("invalid tunnel header: {} - dropping", e);
                return;
            }
        };

        let mut forwarded = other.create_message(tunnel_tag);
        forwarded.write_array(&message.message()[1..]);
        other.send_and_release(forwarded, priority, reliability, channel);
    }
}

/// reads the send settings following the message tag
fn read_header(message: &mut NetworkInMessage) -> anyhow::Result<(MessagePriority, MessageReliability, MessageChannel)> {
    let priority = MessagePriority::try_from_primitive(message.read_u8()?)?;
    let reliability = MessageReliability::try_from_primitive(message.read_u8()?)?;
    let channel = MessageChannel::try_from(message.read_u8()?)?;
    Ok((priority, reliability, channel))
}
