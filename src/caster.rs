//! NTRIP caster: accept loop, per-connection handshake and serving loop,
//! and the relay task that fans validated frames out to every session.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::{HandshakeError, SessionError};
use crate::geodesy;
use crate::helpers::hex_encode;
use crate::ntrip::{self, ProtocolVersion, Request, RequestTarget};
use crate::registry::{NewSession, Offer, SessionId, Subscription};
use crate::rtcm::{Frame, StationArp};
use crate::station::{ReferenceStation, Station};

/// Reported antenna offsets above this are logged as a warning.
pub const REFERENCE_TOLERANCE_M: f64 = 1.0;

const SUMMARY_INTERVAL: Duration = Duration::from_secs(10);
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug)]
enum HandshakeState {
    AwaitingRequest,
    Authenticating(Request),
    Serving {
        request: Request,
        username: Option<String>,
    },
    Closed,
}

pub struct Caster {
    listener: TcpListener,
    station: Station,
}

impl Caster {
    pub async fn bind(station: Station) -> anyhow::Result<Caster> {
        let ntrip = &station.config.ntrip;
        let listener = TcpListener::bind((ntrip.host.as_str(), ntrip.port)).await?;
        Ok(Caster { listener, station })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        info!(
            address = %self.local_addr()?,
            mountpoint = %self.station.config.ntrip.mountpoint,
            "caster listening"
        );
        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "connection accepted");
                    if let Err(error) = stream.set_nodelay(true) {
                        debug!(%peer, %error, "cannot disable nagle");
                    }
                    let station = self.station.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(handle_connection(stream, peer, station, shutdown));
                }
                Err(error) => {
                    warn!(%error, "accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
        info!("caster stopped");
        Ok(())
    }
}

async fn respond<S>(stream: &mut S, text: &str, limit: Duration) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let write = async {
        stream.write_all(text.as_bytes()).await?;
        stream.flush().await
    };
    timeout(limit, write)
        .await
        .map_err(|_| std::io::ErrorKind::TimedOut)?
}

/// Runs one client connection from request to close. Sessions are only
/// registered once the handshake succeeds, and always unregistered on exit.
pub async fn handle_connection<S>(
    mut stream: S,
    peer: SocketAddr,
    station: Station,
    shutdown: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let config = station.config.clone();
    let ntrip_config = &config.ntrip;
    let write_timeout = ntrip_config.write_timeout();
    let mut state = HandshakeState::AwaitingRequest;

    loop {
        state = match state {
            HandshakeState::AwaitingRequest => {
                let head = tokio::select! {
                    _ = shutdown.cancelled() => Err(HandshakeError::Closed),
                    head = timeout(ntrip_config.handshake_timeout(), ntrip::read_request_head(&mut stream)) => {
                        head.unwrap_or(Err(HandshakeError::Timeout))
                    }
                };
                match head.and_then(|head| ntrip::parse_request(&head)) {
                    Err(error @ (HandshakeError::Malformed(_) | HandshakeError::TooLarge(_))) => {
                        info!(%peer, %error, "rejected request");
                        station.statistics.record_rejected_handshake();
                        if let Err(error) =
                            respond(&mut stream, &ntrip::bad_request_response(), write_timeout).await
                        {
                            debug!(%peer, %error, "cannot send response");
                        }
                        HandshakeState::Closed
                    }
                    Err(error) => {
                        debug!(%peer, %error, "handshake failed");
                        HandshakeState::Closed
                    }
                    Ok(request) => {
                        let wanted = match &request.target {
                            RequestTarget::Mountpoint(name) if *name == ntrip_config.mountpoint => true,
                            RequestTarget::Mountpoint(name) => {
                                info!(%peer, mountpoint = %name, "unknown mountpoint");
                                station.statistics.record_rejected_handshake();
                                false
                            }
                            RequestTarget::SourceTable => {
                                debug!(%peer, "source table requested");
                                false
                            }
                        };
                        if wanted {
                            HandshakeState::Authenticating(request)
                        } else {
                            let table = ntrip::source_table_response(&config, request.version);
                            if let Err(error) = respond(&mut stream, &table, write_timeout).await {
                                debug!(%peer, %error, "cannot send source table");
                            }
                            HandshakeState::Closed
                        }
                    }
                }
            }

            HandshakeState::Authenticating(request) => {
                let auth = &ntrip_config.authentication;
                if !auth.enabled {
                    HandshakeState::Serving {
                        request,
                        username: None,
                    }
                } else {
                    match ntrip::check_credentials(auth, request.authorization.as_deref()) {
                        Ok(username) => HandshakeState::Serving {
                            request,
                            username: Some(username),
                        },
                        Err(error) => {
                            warn!(%peer, %error, "authentication failed");
                            station.statistics.record_auth_failure();
                            let denied = ntrip::unauthorized_response(request.version);
                            if let Err(error) = respond(&mut stream, &denied, write_timeout).await {
                                debug!(%peer, %error, "cannot send response");
                            }
                            HandshakeState::Closed
                        }
                    }
                }
            }

            HandshakeState::Serving { request, username } => {
                let accepted = ntrip::ok_response(request.version);
                match respond(&mut stream, &accepted, write_timeout).await {
                    Err(error) => debug!(%peer, %error, "cannot send response"),
                    Ok(()) => {
                        let subscription = station.registry.register(NewSession {
                            remote_address: peer,
                            mountpoint: ntrip_config.mountpoint.clone(),
                            authenticated: username.is_some(),
                            username: username.clone(),
                        });
                        let id = subscription.id;
                        info!(
                            %peer,
                            session = id,
                            user = username.as_deref().unwrap_or("-"),
                            agent = request.user_agent.as_deref().unwrap_or("-"),
                            revision = if request.version == ProtocolVersion::V2 { 2 } else { 1 },
                            clients = station.registry.len(),
                            "client connected"
                        );
                        let result = serve(&mut stream, subscription, write_timeout, &shutdown).await;
                        finish_session(&station, id, peer, result);
                    }
                }
                HandshakeState::Closed
            }

            HandshakeState::Closed => break,
        };
    }

    if timeout(write_timeout, stream.shutdown()).await.is_err() {
        trace!(%peer, "socket shutdown timed out");
    }
}

fn finish_session(station: &Station, id: SessionId, peer: SocketAddr, result: Result<(), SessionError>) {
    let removed = station.registry.unregister(id);
    let bytes_sent = removed.as_ref().map_or(0, |session| session.bytes_sent);
    match result {
        Ok(()) => info!(%peer, session = id, bytes_sent, "client disconnected"),
        Err(SessionError::Evicted) => {
            warn!(%peer, session = id, bytes_sent, "client evicted")
        }
        Err(SessionError::WriteTimeout) => {
            warn!(%peer, session = id, bytes_sent, "client write timed out, evicting");
            // Unless the broadcaster got there first.
            if removed.is_some() {
                station.statistics.record_eviction();
            }
        }
        Err(SessionError::Io(error)) => {
            info!(%peer, session = id, bytes_sent, %error, "client connection lost")
        }
    }
}

/// Drains the session's queue onto the socket until a write fails, the
/// broadcaster evicts it, or the process shuts down.
pub async fn serve<S>(
    stream: &mut S,
    subscription: Subscription,
    write_timeout: Duration,
    shutdown: &CancellationToken,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let Subscription {
        handle,
        mut frames,
        evicted,
        ..
    } = subscription;
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut upload = [0u8; 512];
    let mut upload_open = true;

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Ok(()),
            _ = evicted.cancelled() => return Err(SessionError::Evicted),
            frame = frames.recv() => {
                let Some(frame) = frame else {
                    return Err(SessionError::Evicted);
                };
                let write = timeout(write_timeout, writer.write_all(&frame.raw));
                tokio::select! {
                    _ = shutdown.cancelled() => return Ok(()),
                    _ = evicted.cancelled() => return Err(SessionError::Evicted),
                    written = write => match written {
                        Err(_) => return Err(SessionError::WriteTimeout),
                        Ok(Err(error)) => return Err(error.into()),
                        Ok(Ok(())) => handle.add_bytes_sent(frame.len()),
                    },
                }
            }
            read = reader.read(&mut upload), if upload_open => match read {
                // Half-closed; keep streaming until a write fails.
                Ok(0) => {
                    trace!(session = handle.id, "client closed its sending side");
                    upload_open = false;
                }
                // Rovers may upload GGA positions; a single-base caster has no use for them.
                Ok(n) => trace!(session = handle.id, bytes = n, "client upload ignored"),
                Err(error) => return Err(error.into()),
            },
        }
    }
}

/// Sole consumer of ingest output: filters, counts, checks the announced
/// reference position, and offers each frame to every session in order.
pub async fn relay_frames(
    mut frames: mpsc::Receiver<Frame>,
    station: Station,
    reference: watch::Sender<Option<ReferenceStation>>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let mut summary = tokio::time::interval(SUMMARY_INTERVAL);
    summary.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = summary.tick() => {
                log_summary(&station);
                continue;
            }
            frame = frames.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        if !station.config.relays(frame.message_number) {
            trace!(message_number = frame.message_number, "filtered");
            station.statistics.record_filtered();
            continue;
        }
        station.statistics.record_frame(&frame);
        if let Some(arp) = StationArp::decode(&frame) {
            check_reference(&station, &reference, &frame, &arp);
        }
        if tracing::enabled!(tracing::Level::TRACE) {
            trace!(
                message_number = frame.message_number,
                kind = frame.description().unwrap_or("unknown"),
                raw = %hex_encode(&frame.raw),
                "relaying"
            );
        }
        broadcast(&station, &frame);
    }
    Ok(())
}

/// Offers `frame` to every registered session. Sessions that cannot take it
/// are evicted after the pass so the iteration never blocks on one client.
pub fn broadcast(station: &Station, frame: &Frame) {
    let mut lagging = Vec::new();
    let mut gone = Vec::new();
    station.registry.for_each(|session| match session.offer(frame) {
        Offer::Queued => {}
        Offer::Overflow => lagging.push(session.id),
        Offer::Closed => gone.push(session.id),
    });
    for id in lagging {
        if let Some(session) = station.registry.unregister(id) {
            warn!(
                peer = %session.remote_address,
                session = id,
                "client queue full, evicting"
            );
            station.statistics.record_eviction();
        }
    }
    for id in gone {
        // Its task already ended and will not unregister again.
        if station.registry.unregister(id).is_some() {
            trace!(session = id, "dropped finished session");
        }
    }
}

fn check_reference(
    station: &Station,
    reference: &watch::Sender<Option<ReferenceStation>>,
    frame: &Frame,
    arp: &StationArp,
) {
    let configured = &station.config.base_station;
    let offset_m = geodesy::separation(&arp.ecef, configured);
    let report = ReferenceStation {
        station_id: arp.station_id,
        message_number: frame.message_number,
        position: geodesy::to_geodetic(&arp.ecef),
        offset_m,
        antenna_height_m: arp.antenna_height,
        received_at: chrono::Utc::now(),
    };

    let previous = reference.send_replace(Some(report));
    let was_off = previous.is_some_and(|p| p.offset_m > REFERENCE_TOLERANCE_M);
    if offset_m > REFERENCE_TOLERANCE_M && !was_off {
        warn!(
            station_id = arp.station_id,
            offset_m = format!("{offset_m:.3}"),
            latitude = report.position.latitude,
            longitude = report.position.longitude,
            "receiver reference position differs from configured base position"
        );
    } else if previous.is_none() {
        info!(
            station_id = arp.station_id,
            offset_m = format!("{offset_m:.3}"),
            "reference station announced"
        );
    }
}

fn log_summary(station: &Station) {
    if station.registry.is_empty() {
        return;
    }
    let totals = station.statistics.totals();
    let rates = station.statistics.rates();
    info!(
        clients = station.registry.len(),
        messages = totals.messages,
        bytes = totals.bytes,
        message_rate = format!("{:.1}", rates.message_rate),
        "relay summary"
    );
}
