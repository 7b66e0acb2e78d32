//! WebSocket tunnels: an outbound queue shared with application code
//! and the frame pump that drives one upgraded socket.

use crate::{
    errors::ErrorKind,
    http::web_codec::{Opcode, Role, WebCodec},
    net::Socket,
    router::entry::WebSocketCallbacks,
};
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tokio::sync::Notify;

/// Data plane of a tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataState {
    /// Upgraded, connect callback not run yet.
    Open,
    /// Waiting for frames.
    Receive,
    /// Inside the receive callback.
    Process,
    /// No more messages flow.
    Close,
}

/// Tear-down plane of a tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Healthy,
    /// A close frame was sent or received; waiting for the other one.
    Closing,
    /// The socket is released.
    Gone,
}

/// Handle to one WebSocket tunnel.
///
/// Cloned `Arc`s can be kept by application code: [`send`](Self::send)
/// may be called from any task while the pump reads, and messages leave
/// in FIFO order.
///
/// # Examples
/// ```no_run
/// use maker_net::MapRouter;
///
/// let mut router = MapRouter::new();
/// router
///     .web_socket_receive("^/echo$", |frame, opcode, payload| {
///         frame.send(opcode, payload);
///     })
///     .unwrap();
/// ```
#[derive(Debug)]
pub struct WebSocketFrame {
    queue: Mutex<VecDeque<(Opcode, Vec<u8>)>>,
    state: Mutex<(DataState, TunnelState)>,
    wake: Notify,
    done: Notify,
    role: Role,
}

impl WebSocketFrame {
    pub(crate) fn new(role: Role) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::new()),
            state: Mutex::new((DataState::Open, TunnelState::Healthy)),
            wake: Notify::new(),
            done: Notify::new(),
            role,
        })
    }

    /// Queues a message. Returns `false` once the tunnel is closing.
    pub fn send(&self, opcode: Opcode, payload: &[u8]) -> bool {
        if !self.is_open() {
            return false;
        }

        lock(&self.queue).push_back((opcode, payload.to_vec()));
        self.wake.notify_one();
        true
    }

    #[inline]
    pub fn send_text(&self, text: &str) -> bool {
        self.send(Opcode::Text, text.as_bytes())
    }

    #[inline]
    pub fn send_binary(&self, data: &[u8]) -> bool {
        self.send(Opcode::Binary, data)
    }

    /// Starts the closing handshake with `code` and `reason`.
    pub fn close(&self, code: u16, reason: &str) -> bool {
        {
            let mut state = lock(&self.state);
            if state.1 != TunnelState::Healthy {
                return false;
            }
            state.1 = TunnelState::Closing;
        }

        lock(&self.queue).push_back((Opcode::Close, WebCodec::close_payload(code, reason)));
        self.wake.notify_one();
        true
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        let state = lock(&self.state);
        state.1 == TunnelState::Healthy && state.0 != DataState::Close
    }

    #[inline]
    pub fn data_state(&self) -> DataState {
        lock(&self.state).0
    }

    #[inline]
    pub fn tunnel_state(&self) -> TunnelState {
        lock(&self.state).1
    }

    #[inline]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Resolves once the tunnel is gone.
    pub async fn closed(&self) {
        loop {
            let notified = self.done.notified();
            if self.tunnel_state() == TunnelState::Gone {
                return;
            }
            notified.await;
        }
    }

    fn set_data(&self, data: DataState) {
        lock(&self.state).0 = data;
    }

    fn set_tunnel(&self, tunnel: TunnelState) {
        lock(&self.state).1 = tunnel;
    }

    fn take_outgoing(&self) -> Vec<(Opcode, Vec<u8>)> {
        lock(&self.queue).drain(..).collect()
    }

    fn push_control(&self, opcode: Opcode, payload: Vec<u8>) {
        lock(&self.queue).push_back((opcode, payload));
    }

    fn release(&self) {
        *lock(&self.state) = (DataState::Close, TunnelState::Gone);
        lock(&self.queue).clear();
        self.done.notify_waiters();
    }
}

#[inline]
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Close status answered for a decoding failure.
fn close_code(err: &ErrorKind) -> u16 {
    match err {
        ErrorKind::MessageTooLarge => 1009,
        ErrorKind::WebSocket("text message is not UTF-8") => 1007,
        _ => 1002,
    }
}

/// Drives `frame` over `socket` until the tunnel is gone.
///
/// `leftover` holds bytes read past the handshake. The socket's read
/// timeout bounds idle time; expiry drops the tunnel without a close
/// handshake. Decoding errors answer with a close frame and are
/// returned once the tunnel is released.
pub(crate) async fn pump(
    frame: &Arc<WebSocketFrame>,
    socket: &mut Socket,
    mut codec: WebCodec,
    leftover: &[u8],
    callbacks: &WebSocketCallbacks,
    max_read: usize,
) -> Result<(), ErrorKind> {
    frame.set_data(DataState::Receive);
    if let Some(connect) = &callbacks.connect {
        connect(frame);
    }

    let mut failure = codec.parse_frame(leftover).err();
    let mut sent_close = false;
    let mut received_close = false;
    let mut buffer = Vec::with_capacity(max_read);

    let result = loop {
        if let Some(err) = failure.take() {
            tracing::warn!(%err, "websocket protocol violation");
            frame.set_tunnel(TunnelState::Closing);
            frame.push_control(Opcode::Close, WebCodec::close_payload(close_code(&err), ""));
            let _ = flush(frame, socket).await;
            break Err(err);
        }

        while let Some((opcode, payload)) = codec.get_frame() {
            match opcode {
                Opcode::Ping => frame.push_control(Opcode::Pong, payload),
                Opcode::Pong | Opcode::Continue => {}
                Opcode::Close => {
                    received_close = true;
                    frame.set_data(DataState::Close);
                    if !sent_close && frame.tunnel_state() == TunnelState::Healthy {
                        frame.set_tunnel(TunnelState::Closing);
                        let code = payload.get(..2).map_or_else(Vec::new, <[u8]>::to_vec);
                        frame.push_control(Opcode::Close, code);
                    }
                }
                Opcode::Text | Opcode::Binary => {
                    if received_close {
                        continue;
                    }
                    frame.set_data(DataState::Process);
                    if let Some(receive) = &callbacks.receive {
                        receive(frame, opcode, &payload);
                    }
                    if frame.data_state() == DataState::Process {
                        frame.set_data(DataState::Receive);
                    }
                }
            }
        }

        match flush(frame, socket).await {
            Ok(closed) => sent_close |= closed,
            Err(err) => break Err(err),
        }

        if sent_close && received_close {
            break Ok(());
        }

        buffer.clear();
        tokio::select! {
            biased;

            _ = frame.wake.notified() => {}
            read = socket.read_queued(&mut buffer, max_read) => match read {
                Ok(0) => break Ok(()),
                Ok(_) => failure = codec.parse_frame(&buffer).err(),
                Err(ErrorKind::Timeout) => {
                    tracing::debug!("websocket idle timeout");
                    break Ok(());
                }
                Err(err) => break Err(err),
            },
        }
    };

    frame.release();
    socket.shutdown().await;
    if let Some(disconnect) = &callbacks.disconnect {
        disconnect(frame);
    }
    result
}

/// Writes every queued message. Returns whether a close frame went out.
async fn flush(frame: &WebSocketFrame, socket: &mut Socket) -> Result<bool, ErrorKind> {
    let outgoing = frame.take_outgoing();
    if outgoing.is_empty() {
        return Ok(false);
    }

    let mut bytes = Vec::new();
    let mut closed = false;
    for (opcode, payload) in outgoing {
        let mask = match frame.role {
            Role::Client => Some(fastrand::u32(..).to_be_bytes()),
            Role::Server => None,
        };
        WebCodec::encode(opcode, &payload, mask, &mut bytes);

        if opcode == Opcode::Close {
            closed = true;
            frame.set_data(DataState::Close);
            break;
        }
    }

    socket.write_queued(&bytes).await?;
    socket.flush().await?;
    Ok(closed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::{ConnLimits, WebSocketLimits};
    use std::{sync::atomic::{AtomicUsize, Ordering}, time::Duration};
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn server_socket(stream: DuplexStream, read_ms: u64) -> Socket {
        let limits = ConnLimits {
            socket_read_timeout: Duration::from_millis(read_ms),
            ..ConnLimits::default()
        };
        Socket::new(stream, &limits, 1024)
    }

    fn masked(opcode: Opcode, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        WebCodec::encode(opcode, payload, Some([1, 2, 3, 4]), &mut out);
        out
    }

    async fn read_messages(peer: &mut DuplexStream) -> Vec<(Opcode, Vec<u8>)> {
        let mut codec = WebCodec::new(&WebSocketLimits::default(), Role::Client);
        let mut raw = Vec::new();
        peer.read_to_end(&mut raw).await.unwrap();
        codec.parse_frame(&raw).unwrap();
        std::iter::from_fn(|| codec.get_frame()).collect()
    }

    fn echo_callbacks(events: Arc<AtomicUsize>) -> WebSocketCallbacks {
        let connected = events.clone();
        let disconnected = events;
        WebSocketCallbacks {
            connect: Some(Arc::new(move |_: &Arc<WebSocketFrame>| {
                connected.fetch_add(1, Ordering::SeqCst);
            })),
            receive: Some(Arc::new(|frame: &Arc<WebSocketFrame>, opcode: Opcode, payload: &[u8]| {
                frame.send(opcode, payload);
            })),
            disconnect: Some(Arc::new(move |_: &Arc<WebSocketFrame>| {
                disconnected.fetch_add(10, Ordering::SeqCst);
            })),
        }
    }

    #[tokio::test]
    async fn echo_and_close() {
        let (server, mut peer) = duplex(4096);
        let mut socket = server_socket(server, 1000);
        let frame = WebSocketFrame::new(Role::Server);
        let events = Arc::new(AtomicUsize::new(0));
        let callbacks = echo_callbacks(events.clone());

        let mut input = masked(Opcode::Text, b"hello");
        input.extend(masked(Opcode::Ping, b"p"));
        input.extend(masked(Opcode::Close, &1000u16.to_be_bytes()));
        let (first, rest) = input.split_at(3);
        peer.write_all(rest).await.unwrap();

        let codec = WebCodec::new(&WebSocketLimits::default(), Role::Server);
        let result = pump(&frame, &mut socket, codec, first, &callbacks, 1024).await;
        assert_eq!(result, Ok(()));
        drop(socket);

        let messages = read_messages(&mut peer).await;
        assert_eq!(
            messages,
            [
                (Opcode::Text, b"hello".to_vec()),
                (Opcode::Pong, b"p".to_vec()),
                (Opcode::Close, 1000u16.to_be_bytes().to_vec()),
            ]
        );
        assert_eq!(events.load(Ordering::SeqCst), 11);
        assert_eq!(frame.tunnel_state(), TunnelState::Gone);
        assert!(!frame.send_text("late"));
    }

    #[tokio::test]
    async fn protocol_violation() {
        let (server, mut peer) = duplex(4096);
        let mut socket = server_socket(server, 1000);
        let frame = WebSocketFrame::new(Role::Server);

        // unmasked frames are refused by servers
        let mut input = Vec::new();
        WebCodec::encode(Opcode::Text, b"x", None, &mut input);
        peer.write_all(&input).await.unwrap();

        let codec = WebCodec::new(&WebSocketLimits::default(), Role::Server);
        let result = pump(&frame, &mut socket, codec, &[], &WebSocketCallbacks::default(), 1024).await;
        assert_eq!(result, Err(ErrorKind::WebSocket("invalid frame masking")));
        drop(socket);

        let messages = read_messages(&mut peer).await;
        assert_eq!(messages, [(Opcode::Close, 1002u16.to_be_bytes().to_vec())]);
    }

    #[tokio::test]
    async fn application_close_and_timeout() {
        let (server, mut peer) = duplex(4096);
        let mut socket = server_socket(server, 50);
        let frame = WebSocketFrame::new(Role::Server);

        let sender = frame.clone();
        let task = tokio::spawn(async move {
            assert!(sender.send_binary(&[1, 2, 3]));
            assert!(sender.close(1001, "bye"));
            assert!(!sender.close(1000, ""));
            sender.closed().await;
        });

        let codec = WebCodec::new(&WebSocketLimits::default(), Role::Server);
        let result = pump(&frame, &mut socket, codec, &[], &WebSocketCallbacks::default(), 1024).await;
        assert_eq!(result, Ok(()));
        task.await.unwrap();
        drop(socket);

        let messages = read_messages(&mut peer).await;
        assert_eq!(messages[0], (Opcode::Binary, vec![1, 2, 3]));
        assert_eq!(messages[1], (Opcode::Close, WebCodec::close_payload(1001, "bye")));
    }
}
