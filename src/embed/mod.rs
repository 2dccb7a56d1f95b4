//! Remote embedding client.
//!
//! Full-precision vectors can live outside the index, behind a request-reply
//! service on a local TCP port. Each worker thread keeps one lazily-created
//! persistent connection; any send/recv/decode failure closes it so the next
//! call reconnects. Messages are protobuf-encoded and framed with a
//! little-endian u32 length prefix in both directions.

use std::cell::RefCell;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use prost::Message;
use tracing::{debug, warn};

use crate::defaults::EMBEDDING_TIMEOUT_SECS;
use crate::distance::{norm, Metric};
use crate::error::{AnnError, Result};

/// Request: the node ids whose embeddings are wanted.
#[derive(Clone, PartialEq, Message)]
pub struct EmbeddingRequest {
    #[prost(uint32, repeated, tag = "1")]
    pub node_ids: Vec<u32>,
}

/// Response: a flat little-endian f32 blob of shape `batch x dim`.
#[derive(Clone, PartialEq, Message)]
pub struct EmbeddingResponse {
    #[prost(bytes = "vec", tag = "1")]
    pub embeddings_data: Vec<u8>,
    /// Exactly two entries: `[batch, dim]`.
    #[prost(int32, repeated, tag = "2")]
    pub dimensions: Vec<i32>,
    /// Ids the service could not resolve. Reserved; not consumed here.
    #[prost(uint32, repeated, tag = "3")]
    pub missing_ids: Vec<u32>,
}

thread_local! {
    static SOCKET: RefCell<Option<TcpStream>> = const { RefCell::new(None) };
}

fn connect(port: u16) -> Result<TcpStream> {
    let stream = TcpStream::connect(("127.0.0.1", port))
        .map_err(|e| AnnError::Protocol(format!("connect to 127.0.0.1:{port} failed: {e}")))?;
    let timeout = Some(Duration::from_secs(EMBEDDING_TIMEOUT_SECS));
    stream
        .set_read_timeout(timeout)
        .and_then(|_| stream.set_write_timeout(timeout))
        .and_then(|_| stream.set_nodelay(true))
        .map_err(|e| AnnError::Protocol(format!("socket option failed: {e}")))?;
    debug!(port, "embedding socket connected");
    Ok(stream)
}

/// Write one length-prefixed frame. Service implementations use the same
/// framing for their side of the exchange.
pub fn write_frame<W: Write>(w: &mut W, body: &[u8]) -> std::io::Result<()> {
    w.write_all(&(body.len() as u32).to_le_bytes())?;
    w.write_all(body)?;
    w.flush()
}

/// Read one length-prefixed frame.
pub fn read_frame<R: Read>(r: &mut R) -> std::io::Result<Vec<u8>> {
    let mut len = [0u8; 4];
    r.read_exact(&mut len)?;
    let mut body = vec![0u8; u32::from_le_bytes(len) as usize];
    r.read_exact(&mut body)?;
    Ok(body)
}

fn exchange(stream: &mut TcpStream, node_ids: &[u32]) -> Result<Vec<Vec<f32>>> {
    let req = EmbeddingRequest {
        node_ids: node_ids.to_vec(),
    };
    write_frame(stream, &req.encode_to_vec())
        .map_err(|e| AnnError::Protocol(format!("send failed: {e}")))?;
    let body =
        read_frame(stream).map_err(|e| AnnError::Protocol(format!("recv failed: {e}")))?;
    let resp = EmbeddingResponse::decode(body.as_slice())
        .map_err(|e| AnnError::Protocol(format!("decode failed: {e}")))?;

    if resp.dimensions.len() != 2 {
        return Err(AnnError::Protocol(format!(
            "response has {} dimension entries, expected 2",
            resp.dimensions.len()
        )));
    }
    let (batch, dim) = (resp.dimensions[0] as usize, resp.dimensions[1] as usize);
    let expected = batch * dim * 4;
    if resp.embeddings_data.len() != expected {
        return Err(AnnError::Protocol(format!(
            "embedding payload is {} bytes, expected {expected}",
            resp.embeddings_data.len()
        )));
    }

    let mut out = Vec::with_capacity(batch);
    for i in 0..batch {
        let mut vec = vec![0f32; dim];
        for (d, v) in vec.iter_mut().enumerate() {
            let o = (i * dim + d) * 4;
            let b = &resp.embeddings_data[o..o + 4];
            *v = f32::from_le_bytes([b[0], b[1], b[2], b[3]]);
        }
        out.push(vec);
    }
    Ok(out)
}

/// Fetch embeddings for `node_ids` over this thread's persistent socket.
///
/// The socket is created on first use and torn down on any failure, so a
/// later call gets a fresh connection.
pub fn fetch_embeddings(node_ids: &[u32], port: u16) -> Result<Vec<Vec<f32>>> {
    SOCKET.with(|cell| {
        let mut slot = cell.borrow_mut();
        if slot.is_none() {
            *slot = Some(connect(port)?);
        }
        let stream = slot.as_mut().expect("connected above");
        match exchange(stream, node_ids) {
            Ok(embs) => Ok(embs),
            Err(e) => {
                warn!(error = %e, "embedding exchange failed; dropping socket");
                *slot = None;
                Err(e)
            }
        }
    })
}

/// Drop this thread's persistent socket, if any. Mostly for tests.
pub fn reset_connection() {
    SOCKET.with(|cell| cell.borrow_mut().take());
}

/// Transform raw service vectors into index space before a distance kernel
/// sees them.
///
/// - L2: untouched (zero-padding to the aligned dimension happens at the
///   call site).
/// - Cosine: L2-normalize.
/// - Inner product: rescale the `dim - 1` real coordinates by
///   `max_base_norm` and append the MIPS-to-L2 lift coordinate.
pub fn preprocess_embeddings(
    embeddings: &mut [Vec<f32>],
    metric: Metric,
    max_base_norm: f32,
    data_dim: usize,
) {
    for emb in embeddings.iter_mut() {
        if emb.len() < data_dim.saturating_sub(1) {
            emb.resize(data_dim - 1, 0.0);
        }
        match metric {
            Metric::InnerProduct => {
                emb.truncate(data_dim - 1);
                let norm_sq: f32 = emb.iter().map(|v| v * v).sum();
                for v in emb.iter_mut() {
                    *v /= max_base_norm;
                }
                let lift = 1.0 - norm_sq / (max_base_norm * max_base_norm);
                emb.push(if lift <= 0.0 { 0.0 } else { lift.sqrt() });
            }
            Metric::Cosine => {
                let n = norm(emb);
                if n > 0.0 {
                    for v in emb.iter_mut() {
                        *v /= n;
                    }
                }
            }
            Metric::L2 => {}
        }
    }
}
