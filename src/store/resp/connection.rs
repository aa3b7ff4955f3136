//! RESP2 connection over TCP
//!
//! One task owns the socket. Requests arrive over an unbounded channel, are
//! written in order and matched to replies through a FIFO of oneshot senders.
//! When the socket drops after the first connect, in-flight requests fail
//! and the task redials in the background; requests queued meanwhile wait
//! for the new socket.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use super::codec::{decode, encode_request};
use crate::config::{ConnectionSettings, DEFAULT_USER};
use crate::error::KvError;
use crate::session::ReconnectPolicy;
use crate::store::connection::{ready, Connection, Driver, PendingReply, Request};
use crate::store::reply::Reply;

/// Commands the RESP backend executes
pub const RESP_COMMANDS: &[&str] = &[
    "GET", "SET", "DEL", "EXISTS", "PING", "EXPIRE", "TTL", "INCR", "KEYS",
];

const READ_BUFFER_SIZE: usize = 8 * 1024;

type ReplySender = oneshot::Sender<Result<Reply, KvError>>;

enum ConnCommand {
    Request(Request, ReplySender),
    Close,
}

/// Driver for RESP2 servers reached over plain TCP
#[derive(Debug, Default, Clone, Copy)]
pub struct RespDriver;

impl RespDriver {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Driver for RespDriver {
    fn name(&self) -> &str {
        "redis"
    }

    async fn connect(
        &self,
        settings: &ConnectionSettings,
        timeout: Duration,
        reconnect: &ReconnectPolicy,
    ) -> Result<Arc<dyn Connection>, KvError> {
        if settings.ssl.is_enabled() {
            return Err(KvError::ConnectError(format!(
                "{}:{}: TLS is not supported by the redis driver; set ssl to false or use a tunnel",
                settings.host, settings.port
            )));
        }

        let (stream, buf) = dial(settings, timeout).await?;
        info!("Connected to redis at {}:{}", settings.host, settings.port);

        let (tx, rx) = mpsc::unbounded_channel();
        let closing = Arc::new(AtomicBool::new(false));
        let actor = Actor {
            label: format!("redis {}:{}", settings.host, settings.port),
            settings: settings.clone(),
            timeout,
            reconnect: reconnect.clone(),
            closing: closing.clone(),
            rx,
            pending: VecDeque::new(),
        };
        tokio::spawn(actor.run(stream, buf));

        Ok(Arc::new(RespConnection { tx, closing }))
    }
}

/// Handle to the task that owns a RESP socket
pub struct RespConnection {
    tx: mpsc::UnboundedSender<ConnCommand>,
    closing: Arc<AtomicBool>,
}

#[async_trait]
impl Connection for RespConnection {
    fn supports(&self, command: &str) -> bool {
        RESP_COMMANDS.contains(&command)
    }

    fn submit(&self, request: Request) -> PendingReply {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(ConnCommand::Request(request, reply_tx)).is_err() {
            return ready(Err(KvError::Backend("connection is closed".to_string())));
        }
        reply_rx
    }

    async fn disconnect(&self) -> Result<(), KvError> {
        self.closing.store(true, Ordering::SeqCst);
        let _ = self.tx.send(ConnCommand::Close);
        Ok(())
    }
}

impl Drop for RespConnection {
    fn drop(&mut self) {
        self.closing.store(true, Ordering::SeqCst);
    }
}

/// Open a socket and run the AUTH/SELECT handshake within `timeout`
async fn dial(
    settings: &ConnectionSettings,
    timeout: Duration,
) -> Result<(TcpStream, BytesMut), KvError> {
    tokio::time::timeout(timeout, dial_inner(settings))
        .await
        .map_err(|_| {
            KvError::ConnectError(format!(
                "{}:{} timed out after {}ms",
                settings.host,
                settings.port,
                timeout.as_millis()
            ))
        })?
}

async fn dial_inner(settings: &ConnectionSettings) -> Result<(TcpStream, BytesMut), KvError> {
    let mut stream = TcpStream::connect((settings.host.as_str(), settings.port))
        .await
        .map_err(|e| KvError::ConnectError(format!("{}:{}: {}", settings.host, settings.port, e)))?;
    if let Err(e) = stream.set_nodelay(true) {
        warn!("Failed to set TCP_NODELAY: {}", e);
    }

    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
    if !settings.password.is_empty() {
        let mut auth = Request::new("AUTH");
        if !settings.user.is_empty() && settings.user != DEFAULT_USER {
            auth = auth.arg(settings.user.clone());
        }
        auth = auth.arg(settings.password.clone());
        expect_ok(&mut stream, &mut buf, auth).await?;
    }
    if !settings.database.is_empty() {
        expect_ok(
            &mut stream,
            &mut buf,
            Request::new("SELECT").arg(settings.database.clone()),
        )
        .await?;
    }
    Ok((stream, buf))
}

async fn expect_ok(
    stream: &mut TcpStream,
    buf: &mut BytesMut,
    request: Request,
) -> Result<(), KvError> {
    let command = request.command.clone();
    match roundtrip(stream, buf, &request).await? {
        reply if reply.is_ok() => Ok(()),
        Reply::Error(e) => Err(KvError::ConnectError(format!("{} rejected: {}", command, e))),
        other => Err(KvError::Protocol {
            command,
            reply: other.describe(),
        }),
    }
}

async fn roundtrip(
    stream: &mut TcpStream,
    buf: &mut BytesMut,
    request: &Request,
) -> Result<Reply, KvError> {
    let mut out = BytesMut::new();
    encode_request(request, &mut out);
    stream.write_all(&out).await?;
    loop {
        if let Some((reply, used)) = decode(&buf[..])? {
            buf.advance(used);
            return Ok(reply);
        }
        if stream.read_buf(&mut *buf).await? == 0 {
            return Err(KvError::Backend(
                "connection closed during handshake".to_string(),
            ));
        }
    }
}

enum Exit {
    Closed,
    Dropped(String),
}

struct Actor {
    label: String,
    settings: ConnectionSettings,
    timeout: Duration,
    reconnect: ReconnectPolicy,
    closing: Arc<AtomicBool>,
    rx: mpsc::UnboundedReceiver<ConnCommand>,
    pending: VecDeque<ReplySender>,
}

impl Actor {
    async fn run(mut self, mut stream: TcpStream, mut buf: BytesMut) {
        loop {
            match self.serve(&mut stream, &mut buf).await {
                Exit::Closed => break,
                Exit::Dropped(reason) => {
                    warn!("{}: connection lost: {}", self.label, reason);
                    self.fail_pending(&reason);
                    if self.closing.load(Ordering::SeqCst) {
                        break;
                    }

                    let settings = self.settings.clone();
                    let timeout = self.timeout;
                    let redial = self
                        .reconnect
                        .run(&self.label, &self.closing, |_| {
                            let settings = settings.clone();
                            async move { dial(&settings, timeout).await.map_err(|e| e.to_string()) }
                        })
                        .await;
                    match redial {
                        Ok((next_stream, next_buf)) => {
                            stream = next_stream;
                            buf = next_buf;
                        }
                        Err(e) => {
                            error!("{}: giving up: {}", self.label, e);
                            break;
                        }
                    }
                }
            }
        }
        self.shutdown();
    }

    async fn serve(&mut self, stream: &mut TcpStream, buf: &mut BytesMut) -> Exit {
        let (mut reader, mut writer) = stream.split();
        loop {
            tokio::select! {
                command = self.rx.recv() => match command {
                    Some(ConnCommand::Request(request, reply_tx)) => {
                        let mut out = BytesMut::new();
                        encode_request(&request, &mut out);
                        if let Err(e) = writer.write_all(&out).await {
                            let _ = reply_tx.send(Err(KvError::Backend(e.to_string())));
                            return Exit::Dropped(e.to_string());
                        }
                        self.pending.push_back(reply_tx);
                    }
                    Some(ConnCommand::Close) | None => {
                        let _ = writer.shutdown().await;
                        debug!("{}: closed", self.label);
                        return Exit::Closed;
                    }
                },

                read = reader.read_buf(&mut *buf) => match read {
                    Ok(0) => return Exit::Dropped("connection closed by server".to_string()),
                    Err(e) => return Exit::Dropped(e.to_string()),
                    Ok(_) => loop {
                        match decode(&buf[..]) {
                            Ok(Some((reply, used))) => {
                                buf.advance(used);
                                match self.pending.pop_front() {
                                    // the caller may have timed out; its reply is discarded
                                    Some(reply_tx) => {
                                        let _ = reply_tx.send(Ok(reply));
                                    }
                                    None => warn!("{}: unsolicited reply {}", self.label, reply.describe()),
                                }
                            }
                            Ok(None) => break,
                            Err(e) => return Exit::Dropped(e.to_string()),
                        }
                    },
                },
            }
        }
    }

    fn fail_pending(&mut self, reason: &str) {
        for reply_tx in self.pending.drain(..) {
            let _ = reply_tx.send(Err(KvError::Backend(format!(
                "connection lost before reply: {}",
                reason
            ))));
        }
    }

    fn shutdown(mut self) {
        self.fail_pending("connection closed");
        self.rx.close();
        while let Ok(command) = self.rx.try_recv() {
            if let ConnCommand::Request(_, reply_tx) = command {
                let _ = reply_tx.send(Err(KvError::Backend("connection is closed".to_string())));
            }
        }
        debug!("{}: connection task exited", self.label);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SslMode;
    use crate::store::resp::codec::encode_reply;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use tokio::net::TcpListener;

    /// Minimal RESP server recording every command it receives
    #[derive(Default)]
    struct FakeServer {
        seen: Mutex<Vec<Vec<String>>>,
        data: Mutex<HashMap<String, Bytes>>,
        connections: AtomicUsize,
        reject_auth: bool,
        drop_first_after: Option<usize>,
    }

    impl FakeServer {
        async fn start(self: Arc<Self>) -> u16 {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = listener.local_addr().unwrap().port();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let index = self.connections.fetch_add(1, Ordering::SeqCst);
                    let server = self.clone();
                    tokio::spawn(async move { server.serve(stream, index).await });
                }
            });
            port
        }

        async fn serve(&self, mut stream: TcpStream, index: usize) {
            let mut buf = BytesMut::new();
            let mut served = 0;
            loop {
                while let Some((request, used)) = decode(&buf[..]).unwrap() {
                    buf.advance(used);
                    let Reply::Array(items) = request else { return };
                    let args: Vec<String> = items
                        .into_iter()
                        .map(|item| match item {
                            Reply::Bulk(b) => String::from_utf8_lossy(&b).into_owned(),
                            _ => String::new(),
                        })
                        .collect();
                    let reply = self.execute(&args);
                    self.seen.lock().push(args);

                    let mut out = BytesMut::new();
                    encode_reply(&reply, &mut out);
                    if stream.write_all(&out).await.is_err() {
                        return;
                    }
                    served += 1;
                    if index == 0 && Some(served) == self.drop_first_after {
                        return;
                    }
                }
                match stream.read_buf(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(_) => {}
                }
            }
        }

        fn execute(&self, args: &[String]) -> Reply {
            match args.first().map(String::as_str) {
                Some("AUTH") if self.reject_auth => {
                    Reply::Error("WRONGPASS invalid username-password pair".into())
                }
                Some("AUTH") | Some("SELECT") => Reply::ok(),
                Some("PING") => Reply::Status("PONG".into()),
                Some("SET") => {
                    self.data
                        .lock()
                        .insert(args[1].clone(), Bytes::from(args[2].clone()));
                    Reply::ok()
                }
                Some("GET") => self.data.lock().get(&args[1]).cloned().into(),
                _ => Reply::Error("ERR unknown command".into()),
            }
        }
    }

    fn settings(port: u16) -> ConnectionSettings {
        ConnectionSettings {
            host: "127.0.0.1".into(),
            port,
            ..ConnectionSettings::default()
        }
    }

    fn fast_reconnect() -> ReconnectPolicy {
        ReconnectPolicy {
            step_ms: 10,
            max_delay_ms: 50,
            max_attempts: Some(50),
        }
    }

    async fn connect(settings: &ConnectionSettings) -> Result<Arc<dyn Connection>, KvError> {
        RespDriver::new()
            .connect(settings, Duration::from_secs(2), &fast_reconnect())
            .await
    }

    async fn run(connection: &Arc<dyn Connection>, request: Request) -> Result<Reply, KvError> {
        connection.submit(request).await.unwrap()
    }

    #[tokio::test]
    async fn test_set_and_get() {
        let server = Arc::new(FakeServer::default());
        let port = server.clone().start().await;
        let conn = connect(&settings(port)).await.unwrap();

        assert_eq!(run(&conn, Request::new("PING")).await.unwrap(), Reply::Status("PONG".into()));
        assert!(run(&conn, Request::new("SET").arg("k").arg("v")).await.unwrap().is_ok());
        assert_eq!(run(&conn, Request::new("GET").arg("k")).await.unwrap(), Reply::from("v"));
        assert_eq!(run(&conn, Request::new("GET").arg("nope")).await.unwrap(), Reply::Nil);

        conn.disconnect().await.unwrap();
        conn.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_pipelined_requests_keep_order() {
        let server = Arc::new(FakeServer::default());
        let port = server.clone().start().await;
        let conn = connect(&settings(port)).await.unwrap();

        let first = conn.submit(Request::new("SET").arg("k").arg("1"));
        let second = conn.submit(Request::new("GET").arg("k"));
        let third = conn.submit(Request::new("SET").arg("k").arg("2"));
        assert!(first.await.unwrap().unwrap().is_ok());
        assert_eq!(second.await.unwrap().unwrap(), Reply::from("1"));
        assert!(third.await.unwrap().unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_handshake_sends_auth_and_select() {
        let server = Arc::new(FakeServer::default());
        let port = server.clone().start().await;
        let mut settings = settings(port);
        settings.user = "app".into();
        settings.password = "pw".into();
        settings.database = "3".into();

        let conn = connect(&settings).await.unwrap();
        run(&conn, Request::new("PING")).await.unwrap();

        let seen = server.seen.lock().clone();
        assert_eq!(seen[0], vec!["AUTH", "app", "pw"]);
        assert_eq!(seen[1], vec!["SELECT", "3"]);
    }

    #[tokio::test]
    async fn test_default_user_is_not_sent() {
        let server = Arc::new(FakeServer::default());
        let port = server.clone().start().await;
        let mut settings = settings(port);
        settings.password = "pw".into();

        connect(&settings).await.unwrap();
        assert_eq!(server.seen.lock()[0], vec!["AUTH", "pw"]);
    }

    #[tokio::test]
    async fn test_rejected_auth_fails_connect() {
        let server = Arc::new(FakeServer {
            reject_auth: true,
            ..FakeServer::default()
        });
        let port = server.clone().start().await;
        let mut settings = settings(port);
        settings.password = "bad".into();

        let err = connect(&settings).await.err().unwrap();
        assert!(matches!(err, KvError::ConnectError(ref m) if m.contains("WRONGPASS")));
    }

    #[tokio::test]
    async fn test_ssl_is_rejected() {
        let mut settings = settings(6379);
        settings.ssl = SslMode::Enabled;
        let err = connect(&settings).await.err().unwrap();
        assert!(matches!(err, KvError::ConnectError(ref m) if m.contains("TLS")));
    }

    #[tokio::test]
    async fn test_refused_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        assert!(matches!(
            connect(&settings(port)).await,
            Err(KvError::ConnectError(_))
        ));
    }

    #[tokio::test]
    async fn test_reconnects_after_server_drop() {
        let server = Arc::new(FakeServer {
            drop_first_after: Some(1),
            ..FakeServer::default()
        });
        let port = server.clone().start().await;
        let conn = connect(&settings(port)).await.unwrap();

        assert!(run(&conn, Request::new("SET").arg("k").arg("v")).await.unwrap().is_ok());

        // requests racing the drop may fail; later ones land on the new socket
        let mut reply = None;
        for _ in 0..100 {
            match run(&conn, Request::new("GET").arg("k")).await {
                Ok(r) => {
                    reply = Some(r);
                    break;
                }
                Err(KvError::Backend(_)) => tokio::time::sleep(Duration::from_millis(10)).await,
                Err(other) => panic!("unexpected error: {:?}", other),
            }
        }
        assert_eq!(reply, Some(Reply::from("v")));
        assert!(server.connections.load(Ordering::SeqCst) >= 2);

        conn.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_requests_after_close_fail() {
        let server = Arc::new(FakeServer::default());
        let port = server.clone().start().await;
        let conn = connect(&settings(port)).await.unwrap();
        conn.disconnect().await.unwrap();

        // give the connection task time to exit
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(matches!(
            run(&conn, Request::new("PING")).await,
            Err(KvError::Backend(_))
        ));
    }
}
