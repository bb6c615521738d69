//! Client session with bounded reconnection, plus the terminal front-end.
//!
//! The client always redials the endpoint it was started with. It does not
//! discover a promoted backup on its own: after a failover the user has to
//! point it at the backup's address.

use std::{future::Future, io, net::SocketAddr};

use anyhow::Result;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf},
    net::TcpStream,
    select,
    time::sleep,
};
use tracing::{info, warn};

use crate::{
    cli::ClientArgs,
    config::ReconnectPolicy,
    error::{ChannelError, ClientError},
    frame::{FramedReader, FramedWriter, Message, split},
};

/// Opens transport streams to one fixed endpoint.
pub trait Dialer {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Human-readable endpoint, used in logs and errors.
    fn endpoint(&self) -> String;

    fn dial(&self) -> impl Future<Output = io::Result<Self::Stream>> + Send;
}

pub struct TcpDialer {
    addr: SocketAddr,
}

impl TcpDialer {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }
}

impl Dialer for TcpDialer {
    type Stream = TcpStream;

    fn endpoint(&self) -> String {
        self.addr.to_string()
    }

    fn dial(&self) -> impl Future<Output = io::Result<TcpStream>> + Send {
        TcpStream::connect(self.addr)
    }
}

/// Retries a lost connection with a fixed delay, up to a bounded number of
/// consecutive attempts. A successful connection resets the count.
pub struct Reconnector<D> {
    dialer: D,
    policy: ReconnectPolicy,
    attempts: u32,
}

impl<D: Dialer> Reconnector<D> {
    pub fn new(dialer: D, policy: ReconnectPolicy) -> Self {
        Self {
            dialer,
            policy,
            attempts: 0,
        }
    }

    /// Consecutive failed attempts since the last successful connection.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Single initial dial, without delay or retries.
    pub async fn connect(&mut self) -> Result<D::Stream, ClientError> {
        let stream = self
            .dialer
            .dial()
            .await
            .map_err(|source| ClientError::Connect {
                endpoint: self.dialer.endpoint(),
                source,
            })?;
        info!(endpoint = %self.dialer.endpoint(), "connected");
        self.attempts = 0;
        Ok(stream)
    }

    /// Waits and redials until a connection succeeds or the attempt budget
    /// is spent. Exhaustion is terminal for the session.
    pub async fn reconnect(&mut self) -> Result<D::Stream, ClientError> {
        loop {
            if self.attempts >= self.policy.max_attempts {
                warn!(endpoint = %self.dialer.endpoint(), "max reconnection attempts reached");
                return Err(ClientError::ReconnectExhausted {
                    endpoint: self.dialer.endpoint(),
                    attempts: self.attempts,
                });
            }

            self.attempts += 1;
            info!(
                "reconnection attempt {}/{}",
                self.attempts, self.policy.max_attempts
            );
            sleep(self.policy.delay).await;

            match self.dialer.dial().await {
                Ok(stream) => {
                    info!(endpoint = %self.dialer.endpoint(), "reconnected");
                    self.attempts = 0;
                    return Ok(stream);
                }
                Err(err) => warn!(error = %err, "reconnection attempt failed"),
            }
        }
    }
}

type Halves<S> = (FramedReader<ReadHalf<S>>, FramedWriter<WriteHalf<S>>);

/// A chat connection that can be re-established after a failure.
pub struct ClientSession<D: Dialer> {
    reconnector: Reconnector<D>,
    link: Option<Halves<D::Stream>>,
}

impl<D: Dialer> ClientSession<D> {
    pub async fn connect(dialer: D, policy: ReconnectPolicy) -> Result<Self, ClientError> {
        let mut reconnector = Reconnector::new(dialer, policy);
        let stream = reconnector.connect().await?;
        Ok(Self {
            reconnector,
            link: Some(split(stream)),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    pub async fn send(&mut self, text: &str) -> Result<(), ChannelError> {
        let Some((_, writer)) = self.link.as_mut() else {
            return Err(ChannelError::Closed);
        };
        writer.send(&Message::user(text)).await
    }

    /// Next user message from the server. Cancel safe.
    pub async fn receive(&mut self) -> Result<Message, ChannelError> {
        let Some((reader, _)) = self.link.as_mut() else {
            return Err(ChannelError::Closed);
        };
        loop {
            let message = reader.receive().await?;
            if !message.is_heartbeat() {
                return Ok(message);
            }
        }
    }

    /// Drops the current connection and runs the reconnection policy.
    pub async fn recover(&mut self) -> Result<(), ClientError> {
        self.link = None;
        let stream = self.reconnector.reconnect().await?;
        self.link = Some(split(stream));
        Ok(())
    }

    pub async fn close(&mut self) {
        if let Some((_, mut writer)) = self.link.take() {
            writer.shutdown().await;
        }
    }
}

/// Terminal front-end: stdin lines go out as messages, inbound messages are
/// printed one per line.
pub async fn run(args: ClientArgs) -> Result<()> {
    let dialer = TcpDialer::new(args.server);
    let mut session = ClientSession::connect(dialer, args.reconnect_policy()).await?;
    write_stdout(&format!("*** connected to {}", args.server)).await?;

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let outcome = run_client_loop(&mut session, &mut stdin).await;

    if let Err(err) = &outcome {
        if let Some(ClientError::ReconnectExhausted { .. }) = err.downcast_ref::<ClientError>() {
            write_stderr(&format!("!!! {err}")).await?;
        }
    }
    session.close().await;
    outcome
}

enum Event {
    Inbound(Result<Message, ChannelError>),
    Input(io::Result<Option<String>>),
    Interrupted(io::Result<()>),
}

async fn run_client_loop<D, R>(
    session: &mut ClientSession<D>,
    stdin: &mut tokio::io::Lines<R>,
) -> Result<()>
where
    D: Dialer,
    R: tokio::io::AsyncBufRead + Unpin,
{
    loop {
        let event = select! {
            inbound = session.receive() => Event::Inbound(inbound),
            line = stdin.next_line() => Event::Input(line),
            ctrl_c = tokio::signal::ctrl_c() => Event::Interrupted(ctrl_c),
        };

        match event {
            Event::Inbound(Ok(message)) => write_stdout(message.text()).await?,
            Event::Inbound(Err(err)) => {
                write_stdout(&format!("*** connection lost ({err}), reconnecting")).await?;
                session.recover().await?;
                write_stdout("*** reconnected").await?;
            }
            Event::Input(line) => {
                let Some(line) = line? else { break };
                if !handle_input(session, line.trim_end()).await? {
                    break;
                }
            }
            Event::Interrupted(result) => {
                if let Err(error) = result {
                    warn!(?error, "ctrl-c handler failed");
                }
                break;
            }
        }
    }
    Ok(())
}

async fn handle_input<D: Dialer>(session: &mut ClientSession<D>, text: &str) -> Result<bool> {
    if text.is_empty() {
        return Ok(true);
    }
    if text.eq_ignore_ascii_case("/quit") {
        write_stdout("*** leaving chat").await?;
        return Ok(false);
    }

    if let Err(err) = session.send(text).await {
        write_stdout(&format!("*** send failed ({err}), reconnecting")).await?;
        session.recover().await?;
        write_stdout("*** reconnected").await?;
    }
    Ok(true)
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

async fn write_stderr(line: &str) -> io::Result<()> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(line.as_bytes()).await?;
    stderr.write_all(b"\n").await?;
    stderr.flush().await
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::{
            Arc, Mutex,
            atomic::{AtomicU32, Ordering},
        },
        time::Duration,
    };

    use tokio::{
        io::{DuplexStream, duplex},
        time::Instant,
    };

    use super::*;

    /// Hands out scripted dial results in order, refusing once the script
    /// runs out.
    #[derive(Clone, Default)]
    struct ScriptedDialer {
        script: Arc<Mutex<VecDeque<io::Result<DuplexStream>>>>,
        dials: Arc<AtomicU32>,
    }

    impl ScriptedDialer {
        fn push_ok(&self, stream: DuplexStream) {
            self.script.lock().unwrap().push_back(Ok(stream));
        }

        fn push_refused(&self, times: usize) {
            let mut script = self.script.lock().unwrap();
            for _ in 0..times {
                script.push_back(Err(io::ErrorKind::ConnectionRefused.into()));
            }
        }

        fn dials(&self) -> u32 {
            self.dials.load(Ordering::SeqCst)
        }
    }

    impl Dialer for ScriptedDialer {
        type Stream = DuplexStream;

        fn endpoint(&self) -> String {
            "scripted".to_string()
        }

        fn dial(&self) -> impl Future<Output = io::Result<DuplexStream>> + Send {
            self.dials.fetch_add(1, Ordering::SeqCst);
            let next = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(io::ErrorKind::ConnectionRefused.into()));
            async move { next }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_five_attempts_two_seconds_apart() {
        let dialer = ScriptedDialer::default();
        let mut reconnector = Reconnector::new(dialer.clone(), ReconnectPolicy::default());

        let started = Instant::now();
        let err = reconnector.reconnect().await.unwrap_err();

        assert!(matches!(
            err,
            ClientError::ReconnectExhausted { attempts: 5, .. }
        ));
        assert_eq!(dialer.dials(), 5);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(10), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_secs(11), "elapsed {elapsed:?}");

        // Exhaustion is sticky: no sixth dial is ever made.
        assert!(reconnector.reconnect().await.is_err());
        assert_eq!(dialer.dials(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_the_attempt_counter() {
        let dialer = ScriptedDialer::default();
        dialer.push_refused(2);
        let (stream, _server) = duplex(64);
        dialer.push_ok(stream);

        let mut reconnector = Reconnector::new(dialer.clone(), ReconnectPolicy::default());
        reconnector.reconnect().await.expect("third attempt succeeds");

        assert_eq!(dialer.dials(), 3);
        assert_eq!(reconnector.attempts(), 0);
    }

    #[tokio::test]
    async fn initial_connect_failure_is_reported() {
        let dialer = ScriptedDialer::default();
        let result = ClientSession::connect(dialer.clone(), ReconnectPolicy::default()).await;
        assert!(matches!(result, Err(ClientError::Connect { .. })));
        assert_eq!(dialer.dials(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn session_recovers_after_server_drops() {
        let dialer = ScriptedDialer::default();
        let (first, first_server) = duplex(1024);
        let (second, second_server) = duplex(1024);
        dialer.push_ok(first);
        dialer.push_ok(second);

        let mut session = ClientSession::connect(dialer.clone(), ReconnectPolicy::default())
            .await
            .unwrap();

        let (mut server_reader, mut server_writer) = split(first_server);
        session.send("hello").await.unwrap();
        assert_eq!(server_reader.receive().await.unwrap(), Message::user("hello"));

        server_writer.send(&Message::heartbeat()).await.unwrap();
        server_writer.send(&Message::user("welcome")).await.unwrap();
        assert_eq!(session.receive().await.unwrap(), Message::user("welcome"));

        drop(server_reader);
        drop(server_writer);
        assert!(session.receive().await.unwrap_err().is_closed());

        session.recover().await.unwrap();
        assert!(session.is_connected());
        let (mut server_reader, _server_writer) = split(second_server);
        session.send("again").await.unwrap();
        assert_eq!(server_reader.receive().await.unwrap(), Message::user("again"));
        assert_eq!(dialer.dials(), 2);
    }
}
