//! Remote streaming encoder.
//!
//! Streams raw RGBA frames to a frame-encoding server over TCP: one JSON
//! header line, then length-prefixed frame records, a zero-length terminator,
//! and finally one JSON result line naming the hosted artifact. A bounded
//! channel in front of the socket writer provides backpressure, replacing
//! any "safe to proceed" polling on the caller's side.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncBufReadExt as _, AsyncWriteExt as _, BufReader},
    net::TcpStream,
    sync::mpsc,
};

use crate::{
    composite::FrameRgba,
    encode::{BackendState, EncoderBackend, FRAME_QUEUE_DEPTH, VideoArtifact},
    foundation::error::{CaptureError, CaptureResult},
    raster,
};

#[derive(Serialize)]
struct StreamHeader {
    width: u32,
    height: u32,
    fps: u32,
    pix_fmt: &'static str,
}

#[derive(Deserialize)]
struct StreamResponse {
    ok: bool,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

pub struct RemoteEncoder {
    addr: String,
    state: BackendState,
    width: u32,
    height: u32,
    tx: Option<mpsc::Sender<Vec<u8>>>,
    task: Option<tokio::task::JoinHandle<CaptureResult<VideoArtifact>>>,
}

impl RemoteEncoder {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            state: BackendState::Idle,
            width: 0,
            height: 0,
            tx: None,
            task: None,
        }
    }
}

#[async_trait]
impl EncoderBackend for RemoteEncoder {
    async fn start(&mut self, width: u32, height: u32, fps: u32) -> CaptureResult<()> {
        if self.state != BackendState::Idle {
            return Err(CaptureError::encoder("remote encoder already started"));
        }
        if width == 0 || height == 0 || fps == 0 {
            return Err(CaptureError::config(
                "encode width/height/fps must be non-zero",
            ));
        }

        let mut stream = TcpStream::connect(&self.addr).await.map_err(|e| {
            CaptureError::encoder(format!(
                "failed to connect to encode server at {}: {e}",
                self.addr
            ))
        })?;

        let header = serde_json::to_string(&StreamHeader {
            width,
            height,
            fps,
            pix_fmt: "rgba",
        })
        .map_err(|e| CaptureError::encoder(format!("serialize stream header: {e}")))?;
        stream
            .write_all(format!("{header}\n").as_bytes())
            .await
            .map_err(|e| CaptureError::encoder(format!("send stream header: {e}")))?;

        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(FRAME_QUEUE_DEPTH);
        let addr = self.addr.clone();
        let task = tokio::spawn(async move {
            let io_err =
                |what: &str, e: std::io::Error| CaptureError::encoder(format!("{what}: {e}"));

            while let Some(buf) = rx.recv().await {
                stream
                    .write_u32(buf.len() as u32)
                    .await
                    .map_err(|e| io_err("send frame length", e))?;
                stream
                    .write_all(&buf)
                    .await
                    .map_err(|e| io_err("send frame", e))?;
            }
            stream
                .write_u32(0)
                .await
                .map_err(|e| io_err("send end-of-stream", e))?;
            stream.flush().await.map_err(|e| io_err("flush stream", e))?;

            let mut reader = BufReader::new(stream);
            let mut line = String::new();
            reader
                .read_line(&mut line)
                .await
                .map_err(|e| io_err("read encode result", e))?;
            let resp: StreamResponse = serde_json::from_str(line.trim()).map_err(|e| {
                CaptureError::encoder(format!("malformed encode result from {addr}: {e}"))
            })?;

            if resp.ok {
                Ok(VideoArtifact::Remote {
                    url: resp.url.unwrap_or_default(),
                })
            } else {
                Err(CaptureError::encoder(format!(
                    "encode server reported failure: {}",
                    resp.error.unwrap_or_else(|| "unknown error".into())
                )))
            }
        });

        self.width = width;
        self.height = height;
        self.tx = Some(tx);
        self.task = Some(task);
        self.state = BackendState::Started;
        tracing::info!(addr = %self.addr, width, height, fps, "remote encode started");
        Ok(())
    }

    async fn feed(&mut self, mut frame: FrameRgba) -> CaptureResult<()> {
        if self.state != BackendState::Started {
            return Err(CaptureError::encoder("feed outside started state"));
        }
        if frame.width != self.width || frame.height != self.height {
            return Err(CaptureError::encoder(format!(
                "frame size mismatch: got {}x{}, expected {}x{}",
                frame.width, frame.height, self.width, self.height
            )));
        }

        if frame.premultiplied {
            raster::unpremultiply_rgba8_in_place(&mut frame.data);
        }

        let Some(tx) = self.tx.as_ref() else {
            return Err(CaptureError::encoder("remote encoder stream is gone"));
        };
        if tx.send(frame.data).await.is_err() {
            // The stream task bailed out; surface its diagnostic if possible.
            self.state = BackendState::Finished;
            if let Some(task) = self.task.take()
                && let Ok(result) = task.await
            {
                return Err(result
                    .err()
                    .unwrap_or_else(|| CaptureError::encoder("remote stream closed early")));
            }
            return Err(CaptureError::encoder("remote stream closed early"));
        }
        Ok(())
    }

    async fn stop(&mut self) -> CaptureResult<VideoArtifact> {
        if self.state != BackendState::Started {
            return Err(CaptureError::encoder("remote encoder is not started"));
        }
        self.state = BackendState::Finished;

        drop(self.tx.take());
        let task = self
            .task
            .take()
            .ok_or_else(|| CaptureError::encoder("remote encoder stream is gone"))?;
        let artifact = task
            .await
            .map_err(|e| CaptureError::encoder(format!("remote stream task panicked: {e}")))??;

        tracing::info!(addr = %self.addr, "remote encode finished");
        Ok(artifact)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn feed_and_stop_require_started_state() {
        let mut enc = RemoteEncoder::new("127.0.0.1:1");
        let frame = FrameRgba::new_premul(2, 2, vec![0; 16]).unwrap();
        assert!(enc.feed(frame).await.is_err());
        assert!(enc.stop().await.is_err());
    }

    #[tokio::test]
    async fn start_fails_when_server_is_unreachable() {
        // Port 1 is essentially never listening.
        let mut enc = RemoteEncoder::new("127.0.0.1:1");
        assert!(matches!(
            enc.start(2, 2, 30).await,
            Err(CaptureError::Encoder(_))
        ));
    }
}
