//! Http3ConnManager: per-connection accept pipeline, control-stream setup,
//! and the resume-ring-driven writer pass.
//!
//! Handshake progression itself is delegated to `quinn`'s `Connecting`
//! future before a [`Http3ConnManager`] is ever constructed; TLS 1.3 is a
//! transport concern this driver only configures, never drives by hand.

use std::collections::HashMap;
use std::future::poll_fn;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, Notify};

use http3_proto::proto::frame::{Frame, Settings, SettingId};
use http3_proto::proto::stream::StreamType;
use http3_quic::quic::{BidiStream, Connection, RecvStream, SendStream};
use http3_quic::stream::{AcceptRecvStream, AcceptedRecvStream};

use crate::config::H3DriverConfig;
use crate::shared::{SharedState, SharedStream};
use crate::sock::DispatchRequest;
use crate::stream::{serve_request_stream, service_stream_write, StreamCtx};

/// Drives one accepted QUIC connection end to end: opens the local control
/// stream with its initial SETTINGS, classifies peer-initiated
/// unidirectional streams, spawns a task per accepted request stream, and
/// services the resume ring until the connection closes.
pub struct Http3ConnManager<C: Connection<Bytes>> {
    conn: C,
    config: H3DriverConfig,
    dispatcher: Arc<dyn DispatchRequest>,
    shared_state: Arc<SharedState>,
    notify: Arc<Notify>,
    streams: HashMap<u64, Arc<StreamCtx<<C as Connection<Bytes>>::SendStream>>>,
    reap_tx: mpsc::UnboundedSender<u64>,
    reap_rx: mpsc::UnboundedReceiver<u64>,
}

impl<C> Http3ConnManager<C>
where
    C: Connection<Bytes>,
    C::BidiStream: BidiStream<Bytes, SendStream = C::SendStream, RecvStream = C::RecvStream>,
{
    pub fn new(conn: C, config: H3DriverConfig, dispatcher: Arc<dyn DispatchRequest>) -> Self {
        let notify = Arc::new(Notify::new());
        let notify_for_wake = notify.clone();
        let shared_state = SharedState::new(Some(Box::new(move || notify_for_wake.notify_one())));
        let (reap_tx, reap_rx) = mpsc::unbounded_channel();
        Self {
            conn,
            config,
            dispatcher,
            shared_state,
            notify,
            streams: HashMap::new(),
            reap_tx,
            reap_rx,
        }
    }

    /// Opens the local control stream and announces this driver's settings.
    /// Per RFC 9114 §6.2.1, the control stream must stay open for the life
    /// of the connection; a client treats it closing as
    /// H3_CLOSED_CRITICAL_STREAM.
    async fn open_control_stream(&mut self) -> Result<C::SendStream, ConnError> {
        let mut settings = Settings::default();
        settings
            .insert(SettingId::QPACK_MAX_TABLE_CAPACITY, 0)
            .expect("settings table has room for the three driver-advertised settings");
        settings
            .insert(SettingId::QPACK_MAX_BLOCKED_STREAMS, 0)
            .expect("settings table has room for the three driver-advertised settings");
        settings
            .insert(SettingId::MAX_HEADER_LIST_SIZE, self.config.max_field_section_size)
            .expect("settings table has room for the three driver-advertised settings");

        let mut send = poll_fn(|cx| self.conn.poll_open_send(cx))
            .await
            .map_err(|e| ConnError::Transport(e.into()))?;
        http3_quic::stream::write(&mut send, StreamType::CONTROL)
            .await
            .map_err(ConnError::Proto)?;
        http3_quic::stream::write(&mut send, Frame::Settings(settings))
            .await
            .map_err(ConnError::Proto)?;
        Ok(send)
    }

    /// Opens the QPACK encoder and decoder streams. Since the table
    /// capacity is always negotiated to 0, neither stream ever carries
    /// instructions; they exist purely because RFC 9204 requires both
    /// peers to open them.
    async fn open_qpack_streams(&mut self) -> Result<(C::SendStream, C::SendStream), ConnError> {
        let mut enc = poll_fn(|cx| self.conn.poll_open_send(cx))
            .await
            .map_err(|e| ConnError::Transport(e.into()))?;
        http3_quic::stream::write(&mut enc, StreamType::ENCODER)
            .await
            .map_err(ConnError::Proto)?;

        let mut dec = poll_fn(|cx| self.conn.poll_open_send(cx))
            .await
            .map_err(|e| ConnError::Transport(e.into()))?;
        http3_quic::stream::write(&mut dec, StreamType::DECODER)
            .await
            .map_err(ConnError::Proto)?;

        Ok((enc, dec))
    }

    /// Runs the connection until it closes or hits an unrecoverable error.
    pub async fn run(mut self) -> Result<(), ConnError> {
        let _control = self.open_control_stream().await?;
        let _qpack = self.open_qpack_streams().await?;

        // These local uni streams are never read from again, but must be
        // kept alive for the connection's lifetime or the peer will see
        // them close (H3_CLOSED_CRITICAL_STREAM). Holding the send halves
        // here is sufficient since dropping them is what would close them.
        let _keepalive: Vec<C::SendStream> = vec![_control, _qpack.0, _qpack.1];

        loop {
            tokio::select! {
                biased;

                bidi = poll_fn(|cx| self.conn.poll_accept_bidi(cx)) => {
                    match bidi {
                        Ok(Some(stream)) => self.accept_request_stream(stream),
                        Ok(None) => return Ok(()),
                        Err(e) => return Err(ConnError::Transport(e.into())),
                    }
                }

                uni = poll_fn(|cx| self.conn.poll_accept_recv(cx)) => {
                    match uni {
                        Ok(Some(stream)) => self.accept_uni_stream(stream),
                        Ok(None) => return Ok(()),
                        Err(e) => return Err(ConnError::Transport(e.into())),
                    }
                }

                _ = self.notify.notified() => {
                    self.service_resumes();
                }

                Some(id) = self.reap_rx.recv() => {
                    self.streams.remove(&id);
                }
            }
        }
    }

    fn accept_request_stream(&mut self, stream: C::BidiStream) {
        let (send, recv) = stream.split();
        let stream_id = send.id();
        let shared = SharedStream::new(self.shared_state.clone(), stream_id.value());
        let ctx = StreamCtx::new(stream_id, send, shared);
        self.streams.insert(stream_id.value(), ctx.clone());

        let config = self.config.clone();
        let dispatcher = self.dispatcher.clone();
        tokio::spawn(async move {
            serve_request_stream(recv, ctx, config, dispatcher).await;
        });
    }

    fn accept_uni_stream(&mut self, stream: C::RecvStream) {
        tokio::spawn(async move {
            let mut accept = AcceptRecvStream::new(stream);
            if let Err(e) = poll_fn(|cx| accept.poll_type(cx)).await {
                tracing::debug!(error = ?e, "failed to resolve uni stream type");
                return;
            }
            match accept.into_stream::<Bytes>() {
                Ok(AcceptedRecvStream::Control(mut frames)) => {
                    // First frame on the peer's control stream must be
                    // SETTINGS (RFC 9114 §6.2.1); everything after that is
                    // drained and discarded since this driver tracks no
                    // peer-advertised state beyond the handshake.
                    loop {
                        match poll_fn(|cx| frames.poll_next(cx)).await {
                            Ok(Some(_)) => continue,
                            Ok(None) => break,
                            Err(e) => {
                                tracing::debug!(error = ?e, "peer control stream error");
                                break;
                            }
                        }
                    }
                }
                Ok(AcceptedRecvStream::Encoder(mut s)) | Ok(AcceptedRecvStream::Decoder(mut s)) => {
                    // Drain defensively; with table capacity at 0 the peer
                    // has nothing meaningful to say on these streams.
                    loop {
                        match poll_fn(|cx| s.poll_data(cx)).await {
                            Ok(Some(_)) => continue,
                            Ok(None) => break,
                            Err(_) => break,
                        }
                    }
                }
                Ok(AcceptedRecvStream::Reserved) | Err(_) => {}
            }
        });
    }

    /// Drains the resume ring and services each named stream's writer pass
    /// on its own spawned task, rather than awaiting them one after another
    /// on this connection's driver task: a stream whose send window is
    /// exhausted would otherwise stall every other stream's writes and the
    /// accept loop until it drains. Removal from `streams` happens when the
    /// spawned task reports back over `reap_tx`, polled alongside accepts
    /// in `run`'s `select!`.
    fn service_resumes(&mut self) {
        let ids = self.shared_state.drain_resume(self.config.recv_stage_capacity);
        let max_vecs_per_pass = self.config.recv_stage_capacity;
        for id in ids {
            let Some(ctx) = self.streams.get(&id).cloned() else { continue };
            ctx.shared.resume_clear();
            ctx.begin_writer_pass();

            let reap_tx = self.reap_tx.clone();
            tokio::spawn(async move {
                if let Err(e) = service_stream_write(&ctx, max_vecs_per_pass).await {
                    tracing::warn!(error = ?e, stream = id, "writer pass failed");
                    let _ = reap_tx.send(id);
                    return;
                }
                if ctx.finalizable() {
                    let _ = reap_tx.send(id);
                }
            });
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConnError {
    #[error("transport error: {0}")]
    Transport(Box<dyn http3_quic::quic::Error>),
    #[error("protocol error: {0}")]
    Proto(http3_quic::Error),
}
