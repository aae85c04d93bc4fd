use std::fmt;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

const SESSION_READY_MARKER: &str = "schandlerid=1";
const OK_LINE: &str = "error id=0 msg=ok";
const OK_PREFIX: &str = "error id=0";
const NOT_CONNECTED_CODE: &str = "error id=1794";

#[derive(Debug)]
pub enum Ts3Error {
    Connection(std::io::Error),
    Closed,
    Timeout,
    Auth(String),
    NotConnected,
    Protocol(String),
}

impl fmt::Display for Ts3Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection(err) => write!(f, "connection error: {err}"),
            Self::Closed => write!(f, "connection closed by peer"),
            Self::Timeout => write!(f, "timed out waiting for response"),
            Self::Auth(resp) => write!(f, "authentication failed: {resp}"),
            Self::NotConnected => write!(f, "client not connected to a server"),
            Self::Protocol(msg) => write!(f, "protocol error: {msg}"),
        }
    }
}

impl std::error::Error for Ts3Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Connection(err) => Some(err),
            _ => None,
        }
    }
}

impl Ts3Error {
    /// True for errors that invalidate the session; the caller must drop
    /// the connection and go through the reconnect path.
    pub fn is_session_fatal(&self) -> bool {
        !matches!(self, Self::Protocol(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MuteStatus {
    pub input_muted: bool,
    pub output_muted: bool,
}

struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

/// One ClientQuery session. The connection handle exists only between a
/// successful `connect()` and `close()`; every exchange is a CRLF command
/// followed by a scan of response lines for that exchange's marker.
pub struct Ts3Session {
    address: String,
    connect_timeout: Duration,
    read_timeout: Duration,
    conn: Option<Connection>,
}

impl Ts3Session {
    pub fn new(address: String, connect_timeout: Duration, read_timeout: Duration) -> Self {
        Self {
            address,
            connect_timeout,
            read_timeout,
            conn: None,
        }
    }

    /// Open the TCP stream and consume greeting lines until the
    /// session-ready marker appears.
    pub async fn connect(&mut self) -> Result<(), Ts3Error> {
        tracing::debug!(address = %self.address, "connecting to ts3 clientquery");
        let stream = timeout(self.connect_timeout, TcpStream::connect(&self.address))
            .await
            .map_err(|_| Ts3Error::Timeout)?
            .map_err(Ts3Error::Connection)?;

        let (read_half, write_half) = stream.into_split();
        self.conn = Some(Connection {
            reader: BufReader::new(read_half),
            writer: write_half,
        });

        self.read_until(|line| line.contains(SESSION_READY_MARKER), |_| None)
            .await?;
        Ok(())
    }

    /// Send the auth command and check the status line. The server may
    /// echo a banner line before the status, so a non-error first line
    /// means one more read.
    pub async fn authenticate(&mut self, api_key: &str) -> Result<(), Ts3Error> {
        self.send(&format!("auth apikey={api_key}")).await?;

        let mut response = self.read_response_line().await?;
        if !response.starts_with("error") {
            response = self.read_response_line().await?;
        }

        if response == OK_LINE {
            return Ok(());
        }
        Err(Ts3Error::Auth(response))
    }

    /// `whoami`, scanning past unrelated notify chatter for the
    /// `clid=<id>` line. The whole response block is consumed through
    /// its ok terminator so the next exchange starts on a clean stream.
    pub async fn resolve_identity(&mut self) -> Result<String, Ts3Error> {
        self.send("whoami").await?;

        let mut clid: Option<String> = None;
        self.read_until(
            |line| {
                if clid.is_none() {
                    clid = line
                        .split_whitespace()
                        .next()
                        .and_then(|token| token.strip_prefix("clid="))
                        .filter(|id| !id.is_empty())
                        .map(str::to_string);
                }
                line.starts_with(OK_PREFIX)
            },
            disconnect_guard,
        )
        .await?;

        clid.ok_or_else(|| Ts3Error::Protocol("whoami response carried no clid".to_string()))
    }

    /// Query both mute flags for the given client id.
    pub async fn query_mute_status(&mut self, clid: &str) -> Result<MuteStatus, Ts3Error> {
        let input_muted = self.query_client_flag(clid, "client_input_muted").await?;
        let output_muted = self.query_client_flag(clid, "client_output_muted").await?;
        Ok(MuteStatus {
            input_muted,
            output_muted,
        })
    }

    async fn query_client_flag(&mut self, clid: &str, variable: &str) -> Result<bool, Ts3Error> {
        self.send(&format!("clientvariable clid={clid} {variable}"))
            .await?;

        // The value line precedes the ok terminator; consume the whole
        // response block so the next query starts on a clean stream.
        let marker = format!("{variable}=");
        let mut flag = false;
        self.read_until(
            |line| {
                if let Some(idx) = line.find(&marker) {
                    flag = line[idx + marker.len()..].starts_with('1');
                }
                line.starts_with(OK_PREFIX)
            },
            disconnect_guard,
        )
        .await?;
        Ok(flag)
    }

    /// Drop the connection. Safe to call on a never-opened or
    /// already-closed session.
    pub fn close(&mut self) {
        self.conn = None;
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    async fn send(&mut self, command: &str) -> Result<(), Ts3Error> {
        let conn = self.conn.as_mut().ok_or(Ts3Error::NotConnected)?;
        conn.writer
            .write_all(command.as_bytes())
            .await
            .map_err(Ts3Error::Connection)?;
        conn.writer
            .write_all(b"\r\n")
            .await
            .map_err(Ts3Error::Connection)?;
        conn.writer.flush().await.map_err(Ts3Error::Connection)?;
        Ok(())
    }

    /// Read lines until `done` matches, returning the matching line.
    /// `fail` short-circuits on error markers. Unrelated asynchronous
    /// server output is skipped. Each read is bounded by the configured
    /// read timeout.
    async fn read_until<P, E>(&mut self, mut done: P, fail: E) -> Result<String, Ts3Error>
    where
        P: FnMut(&str) -> bool,
        E: Fn(&str) -> Option<Ts3Error>,
    {
        let conn = self.conn.as_mut().ok_or(Ts3Error::NotConnected)?;
        let mut line = String::new();
        loop {
            line.clear();
            let n = timeout(self.read_timeout, conn.reader.read_line(&mut line))
                .await
                .map_err(|_| Ts3Error::Timeout)?
                .map_err(Ts3Error::Connection)?;
            if n == 0 {
                return Err(Ts3Error::Closed);
            }

            let trimmed = line.trim();
            if let Some(err) = fail(trimmed) {
                return Err(err);
            }
            if done(trimmed) {
                return Ok(trimmed.to_string());
            }
        }
    }

    async fn read_response_line(&mut self) -> Result<String, Ts3Error> {
        self.read_until(|_| true, |_| None).await
    }
}

fn disconnect_guard(line: &str) -> Option<Ts3Error> {
    if line.contains(NOT_CONNECTED_CODE) {
        Some(Ts3Error::NotConnected)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    const GREETING: &[&str] = &[
        "TS3 Client",
        "Welcome to the TeamSpeak 3 ClientQuery interface, type \"help\" for a list of commands",
        "selected schandlerid=1",
    ];

    /// One scripted ClientQuery peer: emits the greeting, then answers
    /// each received command line with the next reply block. Holds the
    /// socket open after the script runs out so reads block rather than
    /// seeing EOF.
    async fn spawn_server(greeting: &'static [&'static str], replies: Vec<Vec<String>>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut reader = BufReader::new(read_half);

            for line in greeting {
                write_half.write_all(line.as_bytes()).await.unwrap();
                write_half.write_all(b"\n\r").await.unwrap();
            }

            for reply in replies {
                let mut command = String::new();
                if reader.read_line(&mut command).await.unwrap() == 0 {
                    return;
                }
                for line in reply {
                    write_half.write_all(line.as_bytes()).await.unwrap();
                    write_half.write_all(b"\n\r").await.unwrap();
                }
            }

            // drain further input so the socket stays open; reads on the
            // client side block (or time out) instead of seeing EOF
            let mut rest = String::new();
            loop {
                rest.clear();
                match reader.read_line(&mut rest).await {
                    Ok(0) | Err(_) => return,
                    Ok(_) => {}
                }
            }
        });
        addr
    }

    fn session_for(addr: SocketAddr) -> Ts3Session {
        Ts3Session::new(
            addr.to_string(),
            Duration::from_secs(5),
            Duration::from_secs(5),
        )
    }

    fn lines(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn connect_scans_greeting_until_ready_marker() {
        let addr = spawn_server(GREETING, vec![]).await;
        let mut session = session_for(addr);
        assert!(!session.is_connected());
        session.connect().await.unwrap();
        assert!(session.is_connected());
    }

    #[tokio::test]
    async fn connect_fails_when_stream_closes_before_marker() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (_, mut write_half) = stream.into_split();
            write_half.write_all(b"TS3 Client\n\r").await.unwrap();
            // dropped here: peer closes before the ready marker
        });

        let mut session = session_for(addr);
        let err = session.connect().await.unwrap_err();
        assert!(matches!(err, Ts3Error::Closed));
    }

    #[tokio::test]
    async fn connect_refused_reports_connection_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut session = session_for(addr);
        let err = session.connect().await.unwrap_err();
        assert!(matches!(err, Ts3Error::Connection(_)));
    }

    #[tokio::test]
    async fn authenticate_accepts_direct_ok_status() {
        let addr = spawn_server(GREETING, vec![lines(&[OK_LINE])]).await;
        let mut session = Ts3Session::new(
            addr.to_string(),
            Duration::from_secs(5),
            // short read timeout: a spurious extra read would surface as
            // Timeout instead of hanging the test
            Duration::from_millis(500),
        );
        session.connect().await.unwrap();
        session.authenticate("apikey-123").await.unwrap();
    }

    #[tokio::test]
    async fn authenticate_skips_echo_line_before_status() {
        let addr = spawn_server(GREETING, vec![lines(&["auth apikey=apikey-123", OK_LINE])]).await;
        let mut session = session_for(addr);
        session.connect().await.unwrap();
        session.authenticate("apikey-123").await.unwrap();
    }

    #[tokio::test]
    async fn authenticate_rejects_bad_key_with_raw_response() {
        let addr = spawn_server(
            GREETING,
            vec![lines(&["error id=256 msg=command\\snot\\sfound"])],
        )
        .await;
        let mut session = session_for(addr);
        session.connect().await.unwrap();
        let err = session.authenticate("wrong").await.unwrap_err();
        match err {
            Ts3Error::Auth(resp) => assert!(resp.contains("id=256")),
            other => panic!("expected Auth error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn resolve_identity_skips_unrelated_lines() {
        let addr = spawn_server(
            GREETING,
            vec![
                lines(&[OK_LINE]),
                lines(&[
                    "notifytalkstatuschange schandlerid=1 status=1 clid=7",
                    "clid=42 cid=5",
                    OK_LINE,
                ]),
            ],
        )
        .await;
        let mut session = session_for(addr);
        session.connect().await.unwrap();
        session.authenticate("apikey-123").await.unwrap();
        let clid = session.resolve_identity().await.unwrap();
        assert_eq!(clid, "42");
    }

    #[tokio::test]
    async fn resolve_identity_detects_session_invalid() {
        let addr = spawn_server(
            GREETING,
            vec![lines(&["error id=1794 msg=not\\sconnected"])],
        )
        .await;
        let mut session = session_for(addr);
        session.connect().await.unwrap();
        let err = session.resolve_identity().await.unwrap_err();
        assert!(matches!(err, Ts3Error::NotConnected));
    }

    #[tokio::test]
    async fn query_mute_status_parses_both_flags() {
        let addr = spawn_server(
            GREETING,
            vec![
                lines(&["clid=42 client_input_muted=1", OK_LINE]),
                lines(&["clid=42 client_output_muted=0", OK_LINE]),
            ],
        )
        .await;
        let mut session = session_for(addr);
        session.connect().await.unwrap();
        let status = session.query_mute_status("42").await.unwrap();
        assert_eq!(
            status,
            MuteStatus {
                input_muted: true,
                output_muted: false,
            }
        );
    }

    #[tokio::test]
    async fn query_defaults_missing_flag_to_unmuted() {
        let addr = spawn_server(
            GREETING,
            vec![lines(&[OK_LINE]), lines(&[OK_LINE])],
        )
        .await;
        let mut session = session_for(addr);
        session.connect().await.unwrap();
        let status = session.query_mute_status("42").await.unwrap();
        assert_eq!(
            status,
            MuteStatus {
                input_muted: false,
                output_muted: false,
            }
        );
    }

    #[tokio::test]
    async fn query_reports_disconnect_code() {
        let addr = spawn_server(
            GREETING,
            vec![lines(&["error id=1794 msg=not\\sconnected"])],
        )
        .await;
        let mut session = session_for(addr);
        session.connect().await.unwrap();
        let err = session.query_mute_status("42").await.unwrap_err();
        assert!(matches!(err, Ts3Error::NotConnected));
        assert!(err.is_session_fatal());
    }

    #[tokio::test]
    async fn read_times_out_when_server_goes_silent() {
        // no reply scripted for the auth command; server keeps the
        // socket open without writing
        let addr = spawn_server(GREETING, vec![]).await;
        let mut session = Ts3Session::new(
            addr.to_string(),
            Duration::from_secs(5),
            Duration::from_millis(200),
        );
        session.connect().await.unwrap();
        let err = session.authenticate("apikey-123").await.unwrap_err();
        assert!(matches!(err, Ts3Error::Timeout));
        assert!(err.is_session_fatal());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let addr = spawn_server(GREETING, vec![]).await;
        let mut session = session_for(addr);
        session.close();
        session.connect().await.unwrap();
        session.close();
        session.close();
        assert!(!session.is_connected());
    }

    #[test]
    fn protocol_errors_are_not_session_fatal() {
        assert!(!Ts3Error::Protocol("odd line".to_string()).is_session_fatal());
        assert!(Ts3Error::NotConnected.is_session_fatal());
        assert!(Ts3Error::Timeout.is_session_fatal());
    }
}
