//! Per-connection request loop
//!
//! [`handle_bytes`] is the synchronous core: it buffers partial input, pulls at
//! most one whole frame through a [`FrameCodec`], dispatches it on the
//! [`SlaveNetwork`] and returns the framed response. [`ConnectionLoop`] drives
//! it over any async byte stream, one request at a time.

use std::sync::Arc;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::codec::{FrameCodec, TcpFrameCodec};
use crate::constants::{DEFAULT_READ_BUFFER_SIZE, MAX_TCP_FRAME_LEN};
use crate::error::{Result, SlaveError};
use crate::hex::format_frame;
use crate::slave::SlaveNetwork;

/// Where a connection is in its request/response cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    AwaitingHeader,
    AwaitingBody,
    Dispatching,
    Writing,
    Closed,
}

/// Counters reported when a connection ends
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub frames_received: u64,
    pub responses_sent: u64,
    /// Frames consumed without dispatch (no function code)
    pub frames_dropped: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
}

/// Buffer and phase of one connection
#[derive(Debug)]
pub struct ConnectionState {
    buffer: BytesMut,
    phase: ConnectionPhase,
    stats: ConnectionStats,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionState {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(MAX_TCP_FRAME_LEN),
            phase: ConnectionPhase::AwaitingHeader,
            stats: ConnectionStats::default(),
        }
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.phase
    }

    /// Bytes received but not yet consumed by a frame
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn stats(&self) -> ConnectionStats {
        self.stats
    }

    /// Response bytes were handed to the transport
    pub fn mark_written(&mut self) {
        if self.phase == ConnectionPhase::Writing {
            self.phase = ConnectionPhase::AwaitingHeader;
        }
    }

    /// End of input. Leftover bytes mean the peer stopped mid-frame.
    pub fn finish(&mut self) -> Result<()> {
        let leftover = self.buffer.len();
        self.close();
        if leftover > 0 {
            return Err(SlaveError::framing(format!(
                "Stream ended mid-frame with {} bytes buffered",
                leftover
            )));
        }
        Ok(())
    }

    pub fn close(&mut self) {
        self.phase = ConnectionPhase::Closed;
        self.buffer.clear();
    }
}

/// Result of one [`handle_bytes`] step
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HandleOutcome {
    /// Framed response to write, empty when nothing is owed
    pub outgoing: BytesMut,
    /// Buffered bytes consumed by the processed frame; 0 when no frame was ready
    pub consumed: usize,
}

/// Append `incoming` to the connection buffer and process at most one frame.
///
/// Call again with an empty slice until `consumed == 0` to drain frames that
/// arrived together. An `Err` means the connection must be closed; the state
/// is already `Closed` when it is returned.
pub fn handle_bytes<C>(
    network: &SlaveNetwork,
    codec: &C,
    state: &mut ConnectionState,
    incoming: &[u8],
) -> Result<HandleOutcome>
where
    C: FrameCodec + ?Sized,
{
    if state.phase == ConnectionPhase::Closed {
        return Err(SlaveError::framing("Connection already closed"));
    }

    if !incoming.is_empty() {
        state.buffer.extend_from_slice(incoming);
        state.stats.bytes_received += incoming.len() as u64;
    }

    let frame = match codec.try_extract_frame(&state.buffer) {
        Ok(Some(frame)) => frame,
        Ok(None) => {
            state.phase = if state.buffer.len() < codec.header_len() {
                ConnectionPhase::AwaitingHeader
            } else {
                ConnectionPhase::AwaitingBody
            };
            return Ok(HandleOutcome::default());
        },
        Err(err) => {
            warn!(
                "Framing error, closing ({}): {} [buffer: {}]",
                codec.name(),
                err,
                format_frame(&state.buffer)
            );
            state.close();
            return Err(err);
        },
    };

    state.phase = ConnectionPhase::Dispatching;
    state.stats.frames_received += 1;
    let consumed = frame.len;
    trace!("RX: {}", format_frame(&state.buffer[..consumed]));

    let decoded = codec.decode_request(&frame);
    let request = match decoded {
        Ok(request) => request,
        Err(err) if !err.is_fatal_for_connection() => {
            debug!("Frame dropped ({} bytes): {}", consumed, err);
            state.stats.frames_dropped += 1;
            state.buffer.advance(consumed);
            state.phase = ConnectionPhase::AwaitingHeader;
            return Ok(HandleOutcome {
                outgoing: BytesMut::new(),
                consumed,
            });
        },
        Err(err) => {
            state.close();
            return Err(err);
        },
    };
    state.buffer.advance(consumed);

    let response = match network.dispatch(&request) {
        Ok(response) => response,
        Err(err) => {
            state.close();
            return Err(err);
        },
    };

    let mut outgoing = BytesMut::new();
    match response {
        Some(response) => {
            codec.encode_response(
                response.transaction_id,
                response.slave_address,
                &response.pdu,
                &mut outgoing,
            );
            trace!("TX: {}", format_frame(&outgoing));
            state.stats.responses_sent += 1;
            state.stats.bytes_sent += outgoing.len() as u64;
            state.phase = ConnectionPhase::Writing;
        },
        None => state.phase = ConnectionPhase::AwaitingHeader,
    }

    Ok(HandleOutcome { outgoing, consumed })
}

/// Async driver for one connection
pub struct ConnectionLoop<C: FrameCodec = TcpFrameCodec> {
    network: Arc<SlaveNetwork>,
    codec: C,
    cancel: CancellationToken,
    read_buffer_size: usize,
}

impl ConnectionLoop<TcpFrameCodec> {
    /// Loop using MBAP framing
    pub fn new(network: Arc<SlaveNetwork>, cancel: CancellationToken) -> Self {
        Self::with_codec(network, TcpFrameCodec, cancel)
    }
}

impl<C: FrameCodec> ConnectionLoop<C> {
    pub fn with_codec(network: Arc<SlaveNetwork>, codec: C, cancel: CancellationToken) -> Self {
        Self {
            network,
            codec,
            cancel,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }

    /// Size of each socket read
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.max(1);
        self
    }

    /// Serve requests from `stream` until it ends, fails or is cancelled.
    ///
    /// Cancellation is checked between reads; a request already read is
    /// answered before the loop looks at the token again.
    pub async fn run<S>(&self, mut stream: S, peer: &str) -> Result<ConnectionStats>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        info!("Connection opened: {} ({})", peer, self.codec.name());

        let mut state = ConnectionState::new();
        let mut chunk = vec![0u8; self.read_buffer_size];

        let result: Result<()> = 'read: loop {
            let n = tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("Connection {} cancelled", peer);
                    break 'read Ok(());
                }
                read = stream.read(&mut chunk) => match read {
                    Ok(n) => n,
                    Err(e) => break 'read Err(e.into()),
                },
            };

            if n == 0 {
                break 'read state.finish();
            }

            let mut incoming: &[u8] = &chunk[..n];
            loop {
                let outcome =
                    match handle_bytes(&self.network, &self.codec, &mut state, incoming) {
                        Ok(outcome) => outcome,
                        Err(e) => break 'read Err(e),
                    };
                incoming = &[];

                if !outcome.outgoing.is_empty() {
                    if let Err(e) = stream.write_all(&outcome.outgoing).await {
                        break 'read Err(e.into());
                    }
                    state.mark_written();
                }

                if outcome.consumed == 0 {
                    break;
                }
            }
        };

        state.close();
        let stats = state.stats();
        match result {
            Ok(()) => {
                info!(
                    "Connection closed: {} (frames={}, responses={}, dropped={}, rx={}B, tx={}B)",
                    peer,
                    stats.frames_received,
                    stats.responses_sent,
                    stats.frames_dropped,
                    stats.bytes_received,
                    stats.bytes_sent
                );
                Ok(stats)
            },
            Err(e) => {
                warn!(
                    "Connection closed on error: {} after {} frames: {}",
                    peer, stats.frames_received, e
                );
                Err(e)
            },
        }
    }
}
