//! SMTP connection handler

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use mailcatch_common::config::ServerConfig;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::session::{DataOutcome, Reply, Session, SessionConfig, Step};
use super::MessageHandler;

/// Longest command line read in one piece
const MAX_COMMAND_LINE: u64 = 4096;
/// Longest body line read in one piece; longer lines arrive in several
const DATA_CHUNK: u64 = 64 * 1024;

/// State shared by every session of a server
pub struct SessionContext {
    pub config: SessionConfig,
    pub handler: Arc<dyn MessageHandler>,
    pub tls_acceptor: Option<TlsAcceptor>,
    pub idle_timeout: Option<Duration>,
}

impl SessionContext {
    pub fn new(
        config: &ServerConfig,
        handler: Arc<dyn MessageHandler>,
        tls_acceptor: Option<TlsAcceptor>,
    ) -> Self {
        Self {
            config: SessionConfig {
                hostname: config.hostname.clone(),
                max_message_size: config.max_message_size,
                tls_available: tls_acceptor.is_some(),
            },
            handler,
            tls_acceptor,
            idle_timeout: config.idle_timeout_secs.map(Duration::from_secs),
        }
    }
}

/// How a conversation over one transport ended
enum Outcome<S> {
    Closed,
    /// STARTTLS accepted; the raw transport is handed back for the handshake
    StartTls(S),
}

enum Input {
    Line(Vec<u8>),
    Eof,
    TimedOut,
}

enum Body {
    Complete(Vec<u8>),
    TooLarge,
}

/// Serves one SMTP connection
pub struct SmtpHandler {
    context: Arc<SessionContext>,
    peer_addr: SocketAddr,
    port: u16,
}

impl SmtpHandler {
    pub fn new(context: Arc<SessionContext>, peer_addr: SocketAddr, port: u16) -> Self {
        Self {
            context,
            peer_addr,
            port,
        }
    }

    /// Handle a TCP connection inside its own session span
    pub async fn handle(self, stream: TcpStream, implicit_tls: bool) -> Result<()> {
        let span = info_span!(
            "smtp_session",
            session_id = %Uuid::now_v7(),
            peer = %self.peer_addr,
            port = self.port,
        );
        self.serve(stream, implicit_tls).instrument(span).await
    }

    /// Run the protocol over any byte stream. With `implicit_tls` the TLS
    /// handshake happens before the greeting.
    pub async fn serve<S>(&self, stream: S, implicit_tls: bool) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        info!(implicit_tls, "Connection opened");

        let result = if implicit_tls {
            match self.handshake(stream).await {
                Some(stream) => {
                    let mut session = Session::new(self.context.config.clone(), true);
                    self.converse(&mut session, stream, true).await.map(|_| ())
                }
                None => Ok(()),
            }
        } else {
            let mut session = Session::new(self.context.config.clone(), false);
            match self.converse(&mut session, stream, true).await? {
                Outcome::Closed => Ok(()),
                Outcome::StartTls(stream) => match self.handshake(stream).await {
                    Some(stream) => {
                        session.tls_established();
                        debug!("TLS established");
                        self.converse(&mut session, stream, false).await.map(|_| ())
                    }
                    None => Ok(()),
                },
            }
        };

        info!("Connection closed");
        result
    }

    /// Handshake on the raw transport. Failure closes silently: nothing can
    /// be sent in cleartext after announcing TLS.
    async fn handshake<S>(&self, stream: S) -> Option<TlsStream<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let acceptor = self.context.tls_acceptor.as_ref()?;
        match acceptor.accept(stream).await {
            Ok(stream) => Some(stream),
            Err(e) => {
                warn!(error = %e, "TLS handshake failed");
                None
            }
        }
    }

    async fn converse<S>(&self, session: &mut Session, stream: S, greet: bool) -> Result<Outcome<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut stream = BufReader::new(stream);

        if greet {
            send(&mut stream, &session.greeting()).await?;
        }

        loop {
            let line = match self.read_chunk(&mut stream, MAX_COMMAND_LINE).await? {
                Input::Line(line) => String::from_utf8_lossy(&line).into_owned(),
                Input::Eof => {
                    debug!("Client disconnected");
                    return Ok(Outcome::Closed);
                }
                Input::TimedOut => {
                    send(&mut stream, &session.timeout_reply()).await?;
                    return Ok(Outcome::Closed);
                }
            };
            debug!(command = %line.trim_end(), "SMTP <-");

            match session.handle_line(&line) {
                Step::Reply(reply) => send(&mut stream, &reply).await?,
                Step::Close(reply) => {
                    send(&mut stream, &reply).await?;
                    return Ok(Outcome::Closed);
                }
                Step::StartTls(reply) => {
                    send(&mut stream, &reply).await?;
                    // Bytes pipelined after STARTTLS are discarded with the buffer
                    return Ok(Outcome::StartTls(stream.into_inner()));
                }
                Step::ReceiveData(reply) => {
                    send(&mut stream, &reply).await?;
                    let outcome = match self.read_body(&mut stream, session.max_message_size()).await? {
                        Some(Body::Complete(raw)) => self.deliver(session, raw).await,
                        Some(Body::TooLarge) => DataOutcome::TooLarge,
                        None => {
                            send(&mut stream, &session.timeout_reply()).await?;
                            return Ok(Outcome::Closed);
                        }
                    };
                    let reply = session.finish_data(outcome);
                    send(&mut stream, &reply).await?;
                }
            }
        }
    }

    /// Read up to and including the next LF, at most `limit` bytes
    async fn read_chunk<R>(&self, reader: &mut R, limit: u64) -> Result<Input>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut buf = Vec::new();
        let mut limited = (&mut *reader).take(limit);
        let read = limited.read_until(b'\n', &mut buf);

        let n = match self.context.idle_timeout {
            Some(idle) => match tokio::time::timeout(idle, read).await {
                Ok(result) => result?,
                Err(_) => {
                    debug!("Idle timeout");
                    return Ok(Input::TimedOut);
                }
            },
            None => read.await?,
        };

        Ok(if n == 0 { Input::Eof } else { Input::Line(buf) })
    }

    /// Read the body up to the lone-dot line, undoing dot-stuffing.
    /// `None` means the client went idle.
    async fn read_body<R>(&self, reader: &mut R, max_size: usize) -> Result<Option<Body>>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut data = Vec::new();
        let mut too_large = false;
        let mut line_start = true;

        loop {
            let chunk = match self.read_chunk(reader, DATA_CHUNK).await? {
                Input::Line(chunk) => chunk,
                Input::Eof => return Err(anyhow!("Connection closed during DATA")),
                Input::TimedOut => return Ok(None),
            };

            let at_start = line_start;
            line_start = chunk.ends_with(b"\n");

            if at_start && (chunk == b".\r\n" || chunk == b".\n") {
                break;
            }
            if too_large {
                continue;
            }

            let content = if at_start && chunk.starts_with(b".") {
                &chunk[1..]
            } else {
                &chunk[..]
            };

            if data.len() + content.len() > max_size {
                warn!(max_size, "Message exceeds size limit, discarding");
                too_large = true;
                data = Vec::new();
                continue;
            }
            data.extend_from_slice(content);
        }

        Ok(Some(if too_large {
            Body::TooLarge
        } else {
            Body::Complete(data)
        }))
    }

    async fn deliver(&self, session: &Session, raw: Vec<u8>) -> DataOutcome {
        let envelope = session.envelope();
        let size = raw.len();

        match self.context.handler.handle_message(envelope, raw).await {
            Ok(()) => {
                info!(
                    size,
                    recipients = envelope.rcpt_to.len(),
                    tls = session.is_tls_active(),
                    "Message accepted"
                );
                DataOutcome::Accepted
            }
            Err(e) => {
                warn!(error = %format!("{:#}", e), "Message rejected");
                DataOutcome::Rejected
            }
        }
    }
}

async fn send<W>(writer: &mut W, reply: &Reply) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let wire = reply.to_wire();
    writer.write_all(wire.as_bytes()).await?;
    writer.flush().await?;
    debug!(reply = %wire.trim_end(), "SMTP ->");
    Ok(())
}
