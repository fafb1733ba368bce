//! Channel membership and fan-out
//!
//! The relay groups connections into named channels and forwards signaling
//! messages to every other member of a channel. It never looks inside a
//! payload, and every failure it could observe (unknown channel, empty channel,
//! unknown connection) degrades to a no-op.

use std::collections::{HashMap, HashSet};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::model::message::{ClientFrame, ConnectionId, ServerFrame, SignalingMessage};

type Outbox = mpsc::UnboundedSender<ServerFrame>;

#[derive(Debug, Default)]
pub struct Relay {
    /// channel -> (member -> outbox). A channel's members are only touched
    /// under its shard lock, so fan-out never sees a half-removed member.
    channels: DashMap<String, HashMap<ConnectionId, Outbox>>,
    /// connection -> channels it joined, for disconnect cleanup.
    memberships: DashMap<ConnectionId, HashSet<String>>,
    connections: DashMap<ConnectionId, Outbox>,
}

impl Relay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new connection. The receiver yields every frame addressed
    /// to it, starting with a `welcome` carrying its id.
    pub fn connect(&self) -> (ConnectionId, mpsc::UnboundedReceiver<ServerFrame>) {
        let id = ConnectionId::generate();
        let (tx, rx) = mpsc::unbounded_channel();

        let _ = tx.send(ServerFrame::Welcome {
            connection_id: id.clone(),
        });
        self.connections.insert(id.clone(), tx);

        debug!("Connection {} registered", id.short());
        (id, rx)
    }

    /// Applies one frame received from `conn`.
    pub fn handle(&self, conn: &ConnectionId, frame: ClientFrame) {
        match frame {
            ClientFrame::Join { channel } => self.join(conn, &channel),
            ClientFrame::Leave { channel } => self.leave(conn, &channel),
            ClientFrame::Signal { message } => {
                self.relay(conn, message);
            }
        }
    }

    pub fn join(&self, conn: &ConnectionId, channel: &str) {
        let Some(outbox) = self.connections.get(conn).map(|tx| tx.value().clone()) else {
            debug!("Join from unknown connection {} ignored", conn.short());
            return;
        };

        {
            let mut members = self.channels.entry(channel.to_string()).or_default();
            members.insert(conn.clone(), outbox);

            // Re-joining still announces, members may have missed the first one.
            broadcast_except(
                &members,
                conn,
                ServerFrame::MemberJoined {
                    channel: channel.to_string(),
                    member: conn.clone(),
                },
            );
            info!(
                "Connection {} joined '{}' ({} members)",
                conn.short(),
                channel,
                members.len()
            );
        }

        self.memberships
            .entry(conn.clone())
            .or_default()
            .insert(channel.to_string());
    }

    pub fn leave(&self, conn: &ConnectionId, channel: &str) {
        if let Some(mut channels) = self.memberships.get_mut(conn) {
            channels.remove(channel);
        }

        if self.remove_member(channel, conn) {
            info!("Connection {} left '{}'", conn.short(), channel);
        } else {
            debug!(
                "Leave of '{}' by non-member {} ignored",
                channel,
                conn.short()
            );
        }
    }

    /// Forwards the message to every member of its channel except `from`.
    /// Returns how many members it was handed to.
    pub fn relay(&self, from: &ConnectionId, message: SignalingMessage) -> usize {
        let Some(members) = self.channels.get(&message.channel) else {
            debug!(
                "Dropping {} for unknown channel '{}'",
                message.kind, message.channel
            );
            return 0;
        };

        let delivered = broadcast_except(
            &members,
            from,
            ServerFrame::Signal {
                from: from.clone(),
                message: message.clone(),
            },
        );

        debug!(
            "Relayed {} from {} on '{}' to {} member(s)",
            message.kind,
            from.short(),
            message.channel,
            delivered
        );
        delivered
    }

    /// Forgets a terminated connection, leaving every channel it was in.
    pub fn disconnect(&self, conn: &ConnectionId) {
        self.connections.remove(conn);

        let channels = self
            .memberships
            .remove(conn)
            .map(|(_, channels)| channels)
            .unwrap_or_default();

        for channel in &channels {
            self.remove_member(channel, conn);
        }

        info!(
            "Connection {} disconnected, left {} channel(s)",
            conn.short(),
            channels.len()
        );
    }

    pub fn members(&self, channel: &str) -> Vec<ConnectionId> {
        self.channels
            .get(channel)
            .map(|members| members.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Removes `conn` from `channel` and tells the remaining members. Returns
    /// false if it was not a member.
    fn remove_member(&self, channel: &str, conn: &ConnectionId) -> bool {
        let removed = match self.channels.get_mut(channel) {
            Some(mut members) => {
                let removed = members.remove(conn).is_some();
                if removed {
                    broadcast_except(
                        &members,
                        conn,
                        ServerFrame::MemberLeft {
                            channel: channel.to_string(),
                            member: conn.clone(),
                        },
                    );
                }
                removed
            }
            None => false,
        };

        // The guard above must be gone before touching the entry again.
        self.channels
            .remove_if(channel, |_, members| members.is_empty());

        removed
    }
}

fn broadcast_except(
    members: &HashMap<ConnectionId, Outbox>,
    sender: &ConnectionId,
    frame: ServerFrame,
) -> usize {
    members
        .iter()
        .filter(|(id, _)| *id != sender)
        .filter(|(_, tx)| tx.send(frame.clone()).is_ok())
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::message::SignalKind;

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerFrame>) -> Vec<ServerFrame> {
        let mut frames = vec![];
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    fn connected(relay: &Relay) -> (ConnectionId, mpsc::UnboundedReceiver<ServerFrame>) {
        let (id, mut rx) = relay.connect();
        assert_eq!(
            drain(&mut rx),
            vec![ServerFrame::Welcome {
                connection_id: id.clone()
            }]
        );
        (id, rx)
    }

    #[test]
    fn relays_to_the_other_member_exactly_once() {
        let relay = Relay::new();
        let (a, mut rx_a) = connected(&relay);
        let (b, mut rx_b) = connected(&relay);
        relay.join(&a, "room-42");
        relay.join(&b, "room-42");
        drain(&mut rx_a);

        let message = SignalingMessage::new("room-42", SignalKind::Offer, "P1");
        assert_eq!(relay.relay(&a, message.clone()), 1);

        assert_eq!(
            drain(&mut rx_b),
            vec![ServerFrame::Signal {
                from: a.clone(),
                message
            }]
        );
        assert!(drain(&mut rx_a).is_empty());
    }

    #[test]
    fn join_then_leave_is_a_net_no_op() {
        let relay = Relay::new();
        let (a, mut rx_a) = connected(&relay);
        let (b, _rx_b) = connected(&relay);
        relay.join(&a, "room");
        let before = relay.members("room");

        relay.join(&b, "room");
        relay.leave(&b, "room");

        assert_eq!(relay.members("room"), before);
        assert_eq!(
            drain(&mut rx_a),
            vec![
                ServerFrame::MemberJoined {
                    channel: "room".into(),
                    member: b.clone()
                },
                ServerFrame::MemberLeft {
                    channel: "room".into(),
                    member: b.clone()
                },
            ]
        );
    }

    #[test]
    fn rejoin_keeps_one_membership_but_announces_again() {
        let relay = Relay::new();
        let (a, mut rx_a) = connected(&relay);
        let (b, _rx_b) = connected(&relay);
        relay.join(&a, "room");
        relay.join(&b, "room");
        relay.join(&b, "room");

        assert_eq!(relay.members("room").len(), 2);
        assert_eq!(drain(&mut rx_a).len(), 2);
    }

    #[test]
    fn leave_by_non_member_is_silent() {
        let relay = Relay::new();
        let (a, mut rx_a) = connected(&relay);
        let (b, _rx_b) = connected(&relay);
        relay.join(&a, "room");

        relay.leave(&b, "room");
        relay.leave(&b, "nowhere");

        assert_eq!(relay.members("room"), vec![a]);
        assert!(drain(&mut rx_a).is_empty());
    }

    #[test]
    fn disconnect_removes_connection_from_every_channel() {
        let relay = Relay::new();
        let (a, mut rx_a) = connected(&relay);
        let (b, mut rx_b) = connected(&relay);
        for channel in ["one", "two"] {
            relay.join(&a, channel);
            relay.join(&b, channel);
        }
        drain(&mut rx_a);

        relay.disconnect(&b);

        assert_eq!(relay.members("one"), vec![a.clone()]);
        assert_eq!(relay.members("two"), vec![a.clone()]);
        assert_eq!(relay.connection_count(), 1);
        assert_eq!(drain(&mut rx_a).len(), 2);

        drain(&mut rx_b);
        let delivered = relay.relay(&a, SignalingMessage::new("one", SignalKind::Candidate, "c"));
        assert_eq!(delivered, 0);
        assert!(drain(&mut rx_b).is_empty());
    }

    #[test]
    fn empty_channels_are_dropped_and_sends_to_them_ignored() {
        let relay = Relay::new();
        let (a, _rx_a) = connected(&relay);
        relay.join(&a, "room");
        relay.leave(&a, "room");

        assert_eq!(relay.channel_count(), 0);
        assert_eq!(
            relay.relay(&a, SignalingMessage::new("room", SignalKind::Answer, "")),
            0
        );
    }

    #[test]
    fn lone_member_gets_no_echo() {
        let relay = Relay::new();
        let (a, mut rx_a) = connected(&relay);
        relay.join(&a, "room");

        assert_eq!(
            relay.relay(&a, SignalingMessage::new("room", SignalKind::Offer, "P")),
            0
        );
        assert!(drain(&mut rx_a).is_empty());
    }

    #[test]
    fn non_member_may_send_into_a_channel() {
        let relay = Relay::new();
        let (a, mut rx_a) = connected(&relay);
        let (b, _rx_b) = connected(&relay);
        relay.join(&a, "room");

        assert_eq!(
            relay.relay(&b, SignalingMessage::new("room", SignalKind::Offer, "P")),
            1
        );
        assert_eq!(drain(&mut rx_a).len(), 1);
    }
}
