//! Per-connection MQTT session.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use mqttbytes::QoS;
use mqttbytes::v4::{
    ConnAck, ConnectReturnCode, Packet, PingResp, PubAck, PubComp, PubRec, Publish, SubAck,
    SubscribeReasonCode, UnsubAck,
};
use mqtt_iot_exporter_core::topics::{DEFINE_FILTER, PUSH_FILTER};
use mqtt_iot_exporter_core::{Access, ClientInfo, InboundMessage};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, info, trace};

use super::subscriptions::{self, Outbound};
use super::{BrokerContext, BrokerError};

/// Human-readable packet type name.
fn packet_type_name(packet: &Packet) -> &'static str {
    match packet {
        Packet::Connect(_) => "CONNECT",
        Packet::ConnAck(_) => "CONNACK",
        Packet::Publish(_) => "PUBLISH",
        Packet::PubAck(_) => "PUBACK",
        Packet::PubRec(_) => "PUBREC",
        Packet::PubRel(_) => "PUBREL",
        Packet::PubComp(_) => "PUBCOMP",
        Packet::Subscribe(_) => "SUBSCRIBE",
        Packet::SubAck(_) => "SUBACK",
        Packet::Unsubscribe(_) => "UNSUBSCRIBE",
        Packet::UnsubAck(_) => "UNSUBACK",
        Packet::PingReq => "PINGREQ",
        Packet::PingResp => "PINGRESP",
        Packet::Disconnect => "DISCONNECT",
    }
}

fn encoded(result: Result<usize, mqttbytes::Error>) -> Result<(), BrokerError> {
    result
        .map(|_| ())
        .map_err(|e| BrokerError::Protocol(format!("failed to encode packet: {:?}", e)))
}

/// Read one packet, pulling more bytes from the socket as needed.
///
/// Returns `None` once the peer closes the connection between packets.
/// Cancel safe: partially read bytes stay in `buf`.
async fn read_packet<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut BytesMut,
    max_packet_size: usize,
) -> Result<Option<Packet>, BrokerError> {
    loop {
        match mqttbytes::v4::read(buf, max_packet_size) {
            Ok(packet) => return Ok(Some(packet)),
            Err(mqttbytes::Error::InsufficientBytes(_)) => {}
            Err(e) => return Err(BrokerError::Protocol(format!("{:?}", e))),
        }

        if reader.read_buf(buf).await? == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(BrokerError::Protocol(
                "connection closed mid-packet".to_string(),
            ));
        }
    }
}

struct Session<S> {
    session_id: u64,
    peer: SocketAddr,
    client: ClientInfo,
    ctx: Arc<BrokerContext>,
    reader: ReadHalf<S>,
    writer: WriteHalf<S>,
    read_buf: BytesMut,
    write_buf: BytesMut,
}

/// Drive one connection from CONNECT to disconnect.
pub(super) async fn run<S>(
    stream: S,
    peer: SocketAddr,
    ctx: Arc<BrokerContext>,
    shutdown: watch::Receiver<bool>,
) -> Result<(), BrokerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut read_buf = BytesMut::with_capacity(4096);
    let mut write_buf = BytesMut::with_capacity(1024);

    let connect_timeout = ctx.config.connect_timeout_secs;
    let first = timeout(
        Duration::from_secs(connect_timeout),
        read_packet(&mut reader, &mut read_buf, ctx.config.max_packet_size),
    )
    .await
    .map_err(|_| BrokerError::ConnectTimeout(connect_timeout))??;

    let connect = match first {
        Some(Packet::Connect(connect)) => connect,
        Some(other) => {
            return Err(BrokerError::Protocol(format!(
                "expected CONNECT, got {}",
                packet_type_name(&other)
            )));
        }
        None => {
            debug!(peer = %peer, "Connection closed before CONNECT");
            return Ok(());
        }
    };

    let client = ClientInfo::new(
        connect.client_id,
        connect.login.map(|login| login.username).unwrap_or_default(),
    );

    if !ctx.authorizer.on_connect(&client) {
        info!(peer = %peer, client_id = %client.client_id, "Connection refused");
        encoded(ConnAck::new(ConnectReturnCode::NotAuthorized, false).write(&mut write_buf))?;
        writer.write_all(&write_buf).await?;
        writer.flush().await?;
        return Ok(());
    }

    encoded(ConnAck::new(ConnectReturnCode::Success, false).write(&mut write_buf))?;
    writer.write_all(&write_buf).await?;
    writer.flush().await?;
    write_buf.clear();

    let session_id = ctx.next_session_id();
    let (tx, rx) = mpsc::channel(ctx.config.outbound_queue);
    ctx.subscriptions.register(session_id, &client.client_id, tx);
    ctx.events.on_connect(&client);

    info!(
        session_id,
        peer = %peer,
        client_id = %client.client_id,
        username = %client.username,
        keep_alive = connect.keep_alive,
        "Client connected"
    );

    let keep_alive = match connect.keep_alive {
        0 => None,
        secs => Some(Duration::from_millis(u64::from(secs) * 1500)),
    };

    let mut session = Session {
        session_id,
        peer,
        client,
        ctx: ctx.clone(),
        reader,
        writer,
        read_buf,
        write_buf,
    };

    let result = session.run(rx, keep_alive, shutdown).await;

    ctx.subscriptions.remove(session_id);
    let clean = matches!(result, Ok(true));
    ctx.events.on_disconnect(&session.client, clean);

    info!(
        session_id,
        client_id = %session.client.client_id,
        clean,
        "Client disconnected"
    );

    result.map(|_| ())
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Returns `Ok(true)` when the session ended cleanly.
    async fn run(
        &mut self,
        mut outbound: mpsc::Receiver<Outbound>,
        keep_alive: Option<Duration>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<bool, BrokerError> {
        let max_packet_size = self.ctx.config.max_packet_size;
        let mut last_activity = Instant::now();

        loop {
            let remaining = keep_alive
                .map(|ka| ka.saturating_sub(last_activity.elapsed()))
                .unwrap_or_default();

            tokio::select! {
                packet = read_packet(&mut self.reader, &mut self.read_buf, max_packet_size) => {
                    let Some(packet) = packet? else {
                        debug!(session_id = self.session_id, "Client closed connection");
                        return Ok(false);
                    };
                    last_activity = Instant::now();

                    trace!(
                        session_id = self.session_id,
                        packet = packet_type_name(&packet),
                        "Received packet"
                    );

                    if self.handle_packet(packet).await? {
                        return Ok(true);
                    }
                }

                Some(message) = outbound.recv() => {
                    let publish = Publish::new(message.topic, QoS::AtMostOnce, message.payload.to_vec());
                    encoded(publish.write(&mut self.write_buf))?;
                    self.flush().await?;
                }

                _ = sleep(remaining), if keep_alive.is_some() => {
                    info!(
                        session_id = self.session_id,
                        peer = %self.peer,
                        "Keep-alive timeout"
                    );
                    return Ok(false);
                }

                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!(session_id = self.session_id, "Closing session on shutdown");
                        return Ok(true);
                    }
                }
            }
        }
    }

    /// Handle one packet. Returns `true` on DISCONNECT.
    async fn handle_packet(&mut self, packet: Packet) -> Result<bool, BrokerError> {
        match packet {
            Packet::Publish(publish) => {
                self.handle_publish(&publish);
                match publish.qos {
                    QoS::AtMostOnce => return Ok(false),
                    QoS::AtLeastOnce => encoded(PubAck::new(publish.pkid).write(&mut self.write_buf))?,
                    QoS::ExactlyOnce => encoded(PubRec::new(publish.pkid).write(&mut self.write_buf))?,
                }
            }
            Packet::PubRel(pubrel) => {
                encoded(PubComp::new(pubrel.pkid).write(&mut self.write_buf))?;
            }
            Packet::PubAck(_) | Packet::PubRec(_) | Packet::PubComp(_) => {
                // Deliveries are QoS 0, nothing is in flight.
                return Ok(false);
            }
            Packet::Subscribe(subscribe) => {
                let codes = subscribe
                    .filters
                    .iter()
                    .map(|filter| self.handle_subscribe(&filter.path))
                    .collect();
                encoded(SubAck::new(subscribe.pkid, codes).write(&mut self.write_buf))?;
            }
            Packet::Unsubscribe(unsubscribe) => {
                for topic in &unsubscribe.topics {
                    self.ctx.subscriptions.unsubscribe(self.session_id, topic);
                }
                encoded(UnsubAck::new(unsubscribe.pkid).write(&mut self.write_buf))?;
            }
            Packet::PingReq => {
                encoded(PingResp.write(&mut self.write_buf))?;
            }
            Packet::Disconnect => return Ok(true),
            other => {
                return Err(BrokerError::Protocol(format!(
                    "unexpected {} from client",
                    packet_type_name(&other)
                )));
            }
        }

        self.flush().await?;
        Ok(false)
    }

    fn handle_publish(&self, publish: &Publish) {
        if !subscriptions::valid_topic(&publish.topic) {
            debug!(
                session_id = self.session_id,
                topic = %publish.topic,
                "Ignoring publish to invalid topic"
            );
            return;
        }

        if !self
            .ctx
            .authorizer
            .on_acl_check(&self.client, &publish.topic, Access::Publish)
        {
            debug!(
                session_id = self.session_id,
                topic = %publish.topic,
                "Publish denied"
            );
            return;
        }

        self.ctx
            .subscriptions
            .route(&publish.topic, publish.payload.clone());

        if subscriptions::matches(&publish.topic, DEFINE_FILTER)
            || subscriptions::matches(&publish.topic, PUSH_FILTER)
        {
            let outcome = self.ctx.dispatcher.handle(&InboundMessage {
                topic: &publish.topic,
                payload: &publish.payload,
                client: &self.client,
            });
            trace!(session_id = self.session_id, ?outcome, "Dispatched");
        }
    }

    fn handle_subscribe(&self, filter: &str) -> SubscribeReasonCode {
        if !subscriptions::valid_filter(filter)
            || !self
                .ctx
                .authorizer
                .on_acl_check(&self.client, filter, Access::Subscribe)
        {
            debug!(session_id = self.session_id, filter = %filter, "Subscribe denied");
            return SubscribeReasonCode::Failure;
        }

        self.ctx.subscriptions.subscribe(self.session_id, filter);
        debug!(session_id = self.session_id, filter = %filter, "Subscribed");
        SubscribeReasonCode::Success(QoS::AtMostOnce)
    }

    async fn flush(&mut self) -> Result<(), BrokerError> {
        self.writer.write_all(&self.write_buf).await?;
        self.writer.flush().await?;
        self.write_buf.clear();
        Ok(())
    }
}
