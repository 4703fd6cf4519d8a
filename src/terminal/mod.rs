//! Remote command execution through the node terminal proxy.
//!
//! The management API has no "run this command" endpoint. Instead we open
//! the same websocket terminal the web console uses, paste a shell line
//! wrapped in boundary markers and scan the echoed output for the exit
//! status. Command output itself is discarded.

pub mod frame;
pub mod scanner;

use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::{self, Message};
use url::Url;

use crate::cluster::{ClusterApi, Credential, TermProxyTicket};
use crate::error::PvmError;

use scanner::Scanner;

/// Runs shell commands on a cluster node.
#[allow(async_fn_in_trait)] // generic-only use, no dyn dispatch
pub trait RemoteShell {
    async fn run<A: ClusterApi>(&self, api: &A, node: &str, command: &str) -> Result<(), PvmError>;
}

/// [`RemoteShell`] backed by the terminal proxy websocket.
#[derive(Debug, Clone)]
pub struct TerminalExecutor {
    base: Url,
    credential: Credential,
    read_timeout: Duration,
}

impl TerminalExecutor {
    /// `base` is the API endpoint, e.g. `https://pve.example:8006`.
    pub fn new(base: Url, credential: Credential, read_timeout: Duration) -> Self {
        Self {
            base,
            credential,
            read_timeout,
        }
    }

    pub fn websocket_url(&self, node: &str, ticket: &TermProxyTicket) -> Result<Url, PvmError> {
        let scheme = match self.base.scheme() {
            "https" | "wss" => "wss",
            "http" | "ws" => "ws",
            other => {
                return Err(PvmError::Validation {
                    message: format!("unsupported API scheme '{other}'"),
                });
            }
        };
        let mut url = self.base.clone();
        url.set_scheme(scheme).map_err(|()| PvmError::Validation {
            message: format!("cannot use '{}' as a websocket base", self.base),
        })?;
        url.set_path(&format!("/api2/json/nodes/{node}/vncwebsocket"));
        url.set_fragment(None);
        url.query_pairs_mut()
            .clear()
            .append_pair("port", &ticket.port.to_string())
            .append_pair("vncticket", &ticket.ticket);
        Ok(url)
    }

    fn request(
        &self,
        url: &Url,
    ) -> Result<tungstenite::handshake::client::Request, PvmError> {
        let mut request = url.as_str().into_client_request().map_err(websocket)?;
        let headers = request.headers_mut();
        headers.insert(
            HeaderName::from_static("sec-websocket-protocol"),
            HeaderValue::from_static("binary"),
        );
        for (name, value) in self.credential.headers() {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| PvmError::protocol(format!("header {name}: {e}")))?;
            let value = HeaderValue::from_str(&value)
                .map_err(|_| PvmError::protocol(format!("credential is not a valid {name} header")))?;
            headers.insert(name, value);
        }
        Ok(request)
    }
}

impl RemoteShell for TerminalExecutor {
    async fn run<A: ClusterApi>(&self, api: &A, node: &str, command: &str) -> Result<(), PvmError> {
        let ticket = api.termproxy(node).await?;
        let url = self.websocket_url(node, &ticket)?;
        tracing::debug!(node, port = ticket.port, "opening terminal proxy session");

        let (ws, _) = tokio_tungstenite::connect_async(self.request(&url)?)
            .await
            .map_err(websocket)?;
        run_session(ws, node, &ticket, command, self.read_timeout).await
    }
}

fn websocket(e: tungstenite::Error) -> PvmError {
    PvmError::protocol(format!("websocket: {e}"))
}

/// Drive one command over an open terminal socket. The socket is closed on
/// every exit path.
pub async fn run_session<S>(
    mut ws: S,
    node: &str,
    ticket: &TermProxyTicket,
    command: &str,
    read_timeout: Duration,
) -> Result<(), PvmError>
where
    S: Stream<Item = Result<Message, tungstenite::Error>>
        + Sink<Message, Error = tungstenite::Error>
        + Unpin,
{
    let result = drive(&mut ws, node, ticket, command, read_timeout).await;
    if let Err(e) = ws.close().await {
        tracing::debug!(node, error = %e, "closing terminal socket failed");
    }
    result
}

async fn drive<S>(
    ws: &mut S,
    node: &str,
    ticket: &TermProxyTicket,
    command: &str,
    read_timeout: Duration,
) -> Result<(), PvmError>
where
    S: Stream<Item = Result<Message, tungstenite::Error>>
        + Sink<Message, Error = tungstenite::Error>
        + Unpin,
{
    let mut reader = LineReader::new(read_timeout);

    ws.send(Message::Binary(frame::login(&ticket.user, &ticket.ticket)))
        .await
        .map_err(websocket)?;
    let greeting = reader.next_chunk(ws).await?;
    let head = &greeting[..greeting.len().min(10)];
    if !head.starts_with(b"OK") {
        tracing::warn!(node, "terminal proxy rejected ticket");
        return Err(PvmError::TicketRejected { node: node.into() });
    }
    reader.push(&greeting[2..]);

    let boundary = frame::boundary_token();
    let line = frame::command_line(&boundary, command);
    for msg in [
        frame::RESIZE.to_vec(),
        frame::keystrokes(line.as_bytes()),
        frame::SUBMIT.to_vec(),
    ] {
        ws.send(Message::Binary(msg)).await.map_err(websocket)?;
    }

    let mut scanner = Scanner::new(&boundary);
    while !scanner.is_done() {
        let line = reader.next_line(ws).await?;
        tracing::trace!(node, state = ?scanner.state(), line = %line.trim_end(), "terminal output");
        scanner.feed(&line);
    }

    match scanner.exit_status()? {
        0 => {
            tracing::debug!(node, "remote command succeeded");
            Ok(())
        }
        exit_status => Err(PvmError::CommandFailed { exit_status }),
    }
}

/// Splits the websocket byte stream into lines. The deadline applies to each
/// socket read, not to the whole command.
struct LineReader {
    buf: Vec<u8>,
    timeout: Duration,
}

impl LineReader {
    fn new(timeout: Duration) -> Self {
        Self {
            buf: Vec::new(),
            timeout,
        }
    }

    fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Payload of the next data message.
    async fn next_chunk<S>(&mut self, ws: &mut S) -> Result<Vec<u8>, PvmError>
    where
        S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    {
        loop {
            let msg = tokio::time::timeout(self.timeout, ws.next())
                .await
                .map_err(|_| {
                    PvmError::protocol(format!("no terminal output for {:?}", self.timeout))
                })?;
            match msg {
                Some(Ok(Message::Binary(data))) => return Ok(data),
                Some(Ok(Message::Text(text))) => return Ok(text.into_bytes()),
                Some(Ok(Message::Close(_))) | None => {
                    return Err(PvmError::protocol("terminal closed before command finished"));
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(websocket(e)),
            }
        }
    }

    async fn next_line<S>(&mut self, ws: &mut S) -> Result<String, PvmError>
    where
        S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    {
        loop {
            if let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = self.buf.drain(..=pos).collect();
                return Ok(String::from_utf8_lossy(&line).into_owned());
            }
            let chunk = self.next_chunk(ws).await?;
            self.push(&chunk);
        }
    }
}
