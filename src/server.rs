//! TCP face of the bridge: the Wahoo TNP listener.
//!
//! Accepts LAN connections on port 36867, binds each one to a `Session`,
//! and drives its read/dispatch/notify loop. One task per session; a
//! session's socket is written only from its own task, so responses and
//! notifications are serialized per client.

use std::io;
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;

use crate::mirror::{GattMirror, SessionId};
use crate::session::Session;
use crate::tnp::{self, Frame};

/// Fixed TNP listen port.
pub const TNP_PORT: u16 = 36867;

/// Default concurrent-client cap.
pub const DEFAULT_MAX_CLIENTS: usize = 1;

/// Bind the TNP listener and serve forever. Prefers a dual-stack IPv6
/// socket for LAN reachability, falling back to IPv4-only.
pub async fn run(
    mirror: Arc<GattMirror>,
    port: u16,
    max_clients: usize,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = match TcpListener::bind(("::", port)).await {
        Ok(listener) => listener,
        Err(e) => {
            warn!("dual-stack bind failed ({}), falling back to IPv4", e);
            TcpListener::bind(("0.0.0.0", port)).await?
        }
    };
    serve(mirror, listener, max_clients).await
}

/// Accept loop over an already-bound listener. Split out so tests can
/// serve on an ephemeral port.
pub async fn serve(
    mirror: Arc<GattMirror>,
    listener: TcpListener,
    max_clients: usize,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    info!(
        "TNP server listening on {} (max {} clients)",
        listener.local_addr()?,
        max_clients
    );
    let limit = Arc::new(Semaphore::new(max_clients));

    loop {
        let (stream, addr) = listener.accept().await?;
        let Ok(permit) = limit.clone().try_acquire_owned() else {
            info!("rejecting {}: client limit reached", addr);
            drop(stream);
            continue;
        };

        info!("TNP client connected from {}", addr);
        let mirror = mirror.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let id = mirror.allocate_session();
            // Subscription cleanup must run on every exit path, panics
            // and cancellation included.
            let _guard = SessionGuard { mirror: mirror.clone(), id };
            match serve_client(stream, &mirror, id).await {
                Ok(()) => info!("TNP client {} disconnected", addr),
                Err(e) => debug!("TNP client {} closed: {}", addr, e),
            }
        });
    }
}

struct SessionGuard {
    mirror: Arc<GattMirror>,
    id: SessionId,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.mirror.drop_session(self.id);
    }
}

async fn serve_client(stream: TcpStream, mirror: &GattMirror, id: SessionId) -> io::Result<()> {
    stream.set_nodelay(true).ok();
    let (mut reader, mut writer) = stream.into_split();

    let (tx, mut rx) = GattMirror::notification_channel();
    mirror.add_sink(id, tx);
    let mut session = Session::new(id);

    loop {
        tokio::select! {
            read = reader.read(session.free_space()) => {
                let n = read?;
                if n == 0 {
                    return Ok(()); // EOF
                }
                session.advance(n);

                // A request's reply goes out before the notification
                // queue is drained again, so write acknowledgments
                // always precede the notifications their handlers
                // trigger.
                while let Some(parsed) = session.next_frame() {
                    let reply = match parsed {
                        Ok(frame) => session.dispatch(&frame, mirror),
                        Err(error_reply) => Some(error_reply),
                    };
                    if let Some(reply) = reply {
                        writer.write_all(&tnp::encode(&reply)).await?;
                    }
                }

                if session.is_stalled() {
                    warn!("session {}: frame exceeds receive buffer, closing", id);
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "frame exceeds receive buffer",
                    ));
                }
            }
            notification = rx.recv() => {
                let Some(n) = notification else { return Ok(()) };
                let frame = Frame::notification(&n.uuid, &n.value);
                writer.write_all(&tnp::encode(&frame)).await?;
            }
        }
    }
}
