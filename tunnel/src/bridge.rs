use anyhow::Context;
use bytes::Bytes;
use devtunnel_protocol::{InvocationRequest, OutputMessage, OutputPayload};
use http_body_util::{BodyExt, Full};
use hyper::{Request, StatusCode};
use hyper_util::rt::TokioIo;

/// Runs session invocations against the agent server on localhost.
#[derive(Debug, Clone)]
pub struct InvocationBridge {
    port: u16,
}

impl InvocationBridge {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub fn agent_url(&self, agent_id: &str) -> String {
        format!("http://localhost:{}/{}", self.port, agent_id)
    }

    /// One POST, no retry. The returned message echoes the request's session id.
    pub async fn invoke(
        &self,
        agent_id: &str,
        request: &InvocationRequest,
    ) -> anyhow::Result<OutputMessage> {
        let url = self.agent_url(agent_id);
        let content_type = if request.content_type.is_empty() {
            "application/json"
        } else {
            request.content_type.as_str()
        };
        let body = serde_json::to_vec(request).context("encode invocation request")?;
        tracing::debug!(url=%url, session_id=%request.session_id, "invoking local agent");

        let path = format!("/{agent_id}");
        let (status, bytes) = post(self.port, &path, content_type, body).await?;
        if !status.is_success() {
            tracing::debug!(status=%status, body=%String::from_utf8_lossy(&bytes), "local agent returned an error");
            anyhow::bail!("local agent returned {status}");
        }

        let output: OutputPayload = match serde_json::from_slice(&bytes) {
            Ok(output) => output,
            Err(err) => {
                tracing::debug!(error=%err, body=%String::from_utf8_lossy(&bytes), "failed to parse output payload");
                return Err(err).context("parse output payload");
            }
        };
        tracing::trace!(body=%String::from_utf8_lossy(&bytes), "response body");
        Ok(OutputMessage::new(request.session_id.clone(), output))
    }
}

async fn post(
    port: u16,
    path: &str,
    content_type: &str,
    body: Vec<u8>,
) -> anyhow::Result<(StatusCode, Bytes)> {
    let stream = tokio::net::TcpStream::connect(("localhost", port))
        .await
        .with_context(|| format!("connect to local agent on port {port}"))?;
    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .context("http1 handshake")?;
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let req = Request::builder()
        .method("POST")
        .uri(path)
        .header("host", format!("localhost:{port}"))
        .header("content-type", content_type)
        .body(Full::new(Bytes::from(body)))
        .context("build request")?;

    let resp = sender.send_request(req).await.context("send request")?;
    let status = resp.status();
    let bytes = resp
        .into_body()
        .collect()
        .await
        .context("read response body")?
        .to_bytes();
    Ok((status, bytes))
}
