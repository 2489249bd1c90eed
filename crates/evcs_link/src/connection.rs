//! One station connection: handshake, reader, telemetry worker, heartbeat and
//! serialized command exchanges.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use evcs_core::Telemetry;
use evcs_engine::{Engine, StationHandle};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, mpsc};
use tokio::time;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::handshake::read_hello;
use crate::messages::{self, ACK_OK, Inbound, Request};
use crate::{FrameCodec, LinkError};

/// Telemetry frames waiting for the worker. A full backlog stops reading from
/// the socket until the worker catches up.
const TELEMETRY_BACKLOG: usize = 8;

#[derive(Debug, Clone)]
pub struct LinkSettings {
    pub heartbeat_interval: Duration,
    pub response_timeout: Duration,
    pub handshake_timeout: Duration,
    pub firmware_chunk_size: usize,
}

impl Default for LinkSettings {
    fn default() -> Self {
        LinkSettings {
            heartbeat_interval: Duration::from_secs(5),
            response_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(10),
            firmware_chunk_size: 4096,
        }
    }
}

#[derive(Debug)]
enum Reply {
    Pong { firmware_version: u8 },
    Ack { request_type: u8, status: u8 },
}

/// Writer and reply queue; whoever holds the lock owns the exchange.
struct CommandChannel {
    writer: FramedWrite<OwnedWriteHalf, FrameCodec>,
    replies: mpsc::Receiver<Reply>,
}

pub struct StationConnection {
    client_id: String,
    connection_id: Uuid,
    settings: LinkSettings,
    commands: Mutex<CommandChannel>,
    shutdown: CancellationToken,
}

impl StationConnection {
    fn new(
        client_id: String,
        writer: OwnedWriteHalf,
        replies: mpsc::Receiver<Reply>,
        settings: LinkSettings,
        shutdown: CancellationToken,
    ) -> Self {
        StationConnection {
            client_id,
            connection_id: Uuid::new_v4(),
            settings,
            commands: Mutex::new(CommandChannel {
                writer: FramedWrite::new(writer, FrameCodec),
                replies,
            }),
            shutdown,
        }
    }

    async fn exchange(
        &self,
        channel: &mut CommandChannel,
        request: Request,
    ) -> Result<Reply, LinkError> {
        if self.shutdown.is_cancelled() {
            return Err(LinkError::Closed);
        }
        // a reply that arrived after its exchange timed out
        while channel.replies.try_recv().is_ok() {}
        channel.writer.send(request.into_frame()).await?;
        time::timeout(self.settings.response_timeout, channel.replies.recv())
            .await
            .map_err(|_| LinkError::Timeout("reply"))?
            .ok_or(LinkError::Closed)
    }

    async fn acknowledged(
        &self,
        channel: &mut CommandChannel,
        request: Request,
    ) -> Result<(), LinkError> {
        let request_type = request.message_type();
        match self.exchange(channel, request).await? {
            Reply::Ack {
                request_type: acked,
                status: ACK_OK,
            } if acked == request_type => Ok(()),
            Reply::Ack {
                request_type: acked,
                status,
            } if acked == request_type => Err(LinkError::Rejected {
                request_type,
                status,
            }),
            other => Err(LinkError::UnexpectedReply {
                expected: "ack",
                got: format!("{other:?}"),
            }),
        }
    }

    async fn command(&self, request: Request) -> Result<(), LinkError> {
        let mut channel = self.commands.lock().await;
        self.acknowledged(&mut channel, request).await
    }

    /// Heartbeat exchange, returns the firmware version in the reply.
    async fn ping(&self) -> Result<u8, LinkError> {
        let mut channel = self.commands.lock().await;
        match self.exchange(&mut channel, Request::Ping).await? {
            Reply::Pong { firmware_version } => Ok(firmware_version),
            other => Err(LinkError::UnexpectedReply {
                expected: "pong",
                got: format!("{other:?}"),
            }),
        }
    }

    /// Outcome of a command as the engine sees it; transport failures close the connection.
    fn settle(&self, what: &'static str, result: Result<(), LinkError>) -> bool {
        match result {
            Ok(()) => true,
            Err(error @ LinkError::Rejected { .. }) => {
                warn!(client_id = %self.client_id, %error, "Station rejected {what}");
                false
            }
            Err(error) => {
                warn!(client_id = %self.client_id, %error, "Failed to {what}, closing connection");
                self.shutdown.cancel();
                false
            }
        }
    }

    async fn upload(&self, image: &Bytes) -> Result<(), LinkError> {
        // hold the channel for the whole image so no other command interleaves
        let mut channel = self.commands.lock().await;
        let chunks = messages::firmware_chunks(image, self.settings.firmware_chunk_size);
        let count = chunks.len();
        for (index, chunk) in chunks.into_iter().enumerate() {
            self.acknowledged(&mut channel, chunk).await?;
            debug!(client_id = %self.client_id, chunk = index + 1, of = count, "Firmware chunk acknowledged");
        }
        Ok(())
    }
}

#[async_trait]
impl StationHandle for StationConnection {
    fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    async fn set_contactor_state(&self, on: bool) -> bool {
        let result = self.command(Request::SetContactor(on)).await;
        self.settle("set contactor state", result)
    }

    async fn set_pwm_percent(&self, duty: u8) -> bool {
        let result = self.command(Request::SetPwm(duty)).await;
        self.settle("set pwm", result)
    }

    async fn upload_firmware_and_reboot(&self, image: Bytes) -> bool {
        if image.is_empty() {
            warn!(client_id = %self.client_id, "Refusing to upload an empty firmware image");
            return false;
        }
        let result = self.upload(&image).await;
        self.settle("upload firmware", result)
    }

    async fn request_data(&self) -> bool {
        let result = self.command(Request::CollectData).await;
        self.settle("request data", result)
    }

    fn close(&self) {
        self.shutdown.cancel();
    }
}

/// Run a station connection until it is closed from either side.
pub async fn serve_connection(
    engine: Arc<Engine>,
    mut stream: TcpStream,
    peer: SocketAddr,
    settings: LinkSettings,
    shutdown: CancellationToken,
) -> Result<(), LinkError> {
    let hello = read_hello(&mut stream, settings.handshake_timeout).await?;
    let client = engine.identify(&hello.serial_number(), hello.firmware_version, peer);
    let client_id = client.client_id.clone();

    let (read_half, write_half) = stream.into_split();
    let (reply_tx, reply_rx) = mpsc::channel(1);
    let (telemetry_tx, telemetry_rx) = mpsc::channel(TELEMETRY_BACKLOG);
    let connection = Arc::new(StationConnection::new(
        client_id.clone(),
        write_half,
        reply_rx,
        settings,
        shutdown,
    ));
    let connection_id = connection.connection_id;
    engine.station_connected(client, connection.clone());

    let reader = tokio::spawn(read_frames(
        FramedRead::new(read_half, FrameCodec),
        engine.clone(),
        connection.clone(),
        reply_tx,
        telemetry_tx,
    ));
    let worker = tokio::spawn(station_worker(
        engine.clone(),
        connection.clone(),
        telemetry_rx,
    ));
    let heartbeat = tokio::spawn(heartbeat(engine.clone(), connection.clone()));

    connection.shutdown.cancelled().await;
    engine.station_disconnected(&client_id, connection_id);
    info!(client_id, %connection_id, %peer, "Station connection closed");

    let _ = tokio::join!(reader, worker, heartbeat);
    Ok(())
}

/// Route inbound frames: replies to the pending command, telemetry to the worker.
async fn read_frames(
    mut frames: FramedRead<OwnedReadHalf, FrameCodec>,
    engine: Arc<Engine>,
    connection: Arc<StationConnection>,
    replies: mpsc::Sender<Reply>,
    telemetry: mpsc::Sender<Telemetry>,
) {
    let client_id = connection.client_id.as_str();
    let result: Result<(), LinkError> = async {
        loop {
            let frame = tokio::select! {
                _ = connection.shutdown.cancelled() => return Ok(()),
                frame = frames.next() => frame,
            };
            let frame = frame.ok_or(LinkError::Closed)??;
            match Inbound::from_frame(&frame, engine.now())? {
                Inbound::Telemetry(data) => {
                    tokio::select! {
                        _ = connection.shutdown.cancelled() => return Ok(()),
                        sent = telemetry.send(data) => {
                            if sent.is_err() {
                                return Ok(());
                            }
                        }
                    }
                }
                Inbound::Pong { firmware_version } => {
                    if replies.try_send(Reply::Pong { firmware_version }).is_err() {
                        debug!(client_id, "Unsolicited pong");
                    }
                }
                Inbound::Ack {
                    request_type,
                    status,
                } => {
                    if replies
                        .try_send(Reply::Ack {
                            request_type,
                            status,
                        })
                        .is_err()
                    {
                        debug!(client_id, request_type, "Unsolicited ack");
                    }
                }
            }
        }
    }
    .await;

    match result {
        Ok(()) => {}
        Err(LinkError::Closed) => debug!(client_id, "Station closed the connection"),
        Err(error) => warn!(client_id, %error, "Dropping station connection"),
    }
    connection.shutdown.cancel();
}

/// Process telemetry strictly in order; each frame reallocates the circuit.
async fn station_worker(
    engine: Arc<Engine>,
    connection: Arc<StationConnection>,
    mut telemetry: mpsc::Receiver<Telemetry>,
) {
    loop {
        let data = tokio::select! {
            _ = connection.shutdown.cancelled() => break,
            data = telemetry.recv() => data,
        };
        let Some(data) = data else {
            break;
        };
        engine
            .on_telemetry(&connection.client_id, connection.connection_id, data)
            .await;
    }
}

async fn heartbeat(engine: Arc<Engine>, connection: Arc<StationConnection>) {
    let mut ticker = time::interval(connection.settings.heartbeat_interval);
    // the first tick completes immediately
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = connection.shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        match connection.ping().await {
            Ok(firmware_version) => {
                engine.update_firmware_version(&connection.client_id, firmware_version);
            }
            Err(error) => {
                warn!(client_id = %connection.client_id, %error, "Heartbeat failed, closing connection");
                connection.shutdown.cancel();
                break;
            }
        }
    }
}
