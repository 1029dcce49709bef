use super::listener::{AcceptBackoff, AcceptorContext};
use super::{Activity, ConnectionInfo, ProxyError, ProxyResult};
use crate::config::{EngineSettings, KeyExtractor, Protocol};
use crate::metrics::MetricsCollector;
use crate::router::{BackendPool, RoutingContext, Selection};
use crate::topology::{GenerationGuard, ListenerId};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::{Instant, sleep, timeout, timeout_at};
use tracing::{debug, error, info, warn};

/// One initial pick plus one failover pick per connection.
const DIAL_ATTEMPTS: usize = 2;

/// TCP接收循环，直到收到停止信号
pub(crate) async fn run_acceptor(
    listener: Arc<TcpListener>,
    id: ListenerId,
    mut stop: watch::Receiver<bool>,
    context: AcceptorContext,
) {
    let mut backoff = AcceptBackoff::new();

    loop {
        let accepted = tokio::select! {
            _ = stop.wait_for(|stopped| *stopped) => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, client_addr)) => {
                backoff.reset();

                let topology = context.live.load();
                let Some(index) = topology.frontend_index(id) else {
                    warn!(
                        "No route for listener {:?}, rejecting {}",
                        id, client_addr
                    );
                    reject(stream);
                    continue;
                };

                let guard = topology.enter();
                let metrics = context.metrics.clone();
                tokio::spawn(async move {
                    handle_connection(stream, client_addr, guard, index, metrics).await;
                });
            }
            Err(e) => {
                let delay = backoff.next_delay();
                error!(
                    "Failed to accept TCP connection on listener {:?}: {}, retrying in {:?}",
                    id, e, delay
                );
                tokio::select! {
                    _ = stop.wait_for(|stopped| *stopped) => break,
                    _ = sleep(delay) => {}
                }
            }
        }
    }

    debug!("TCP acceptor for listener {:?} stopped", id);
}

/// 处理单个连接
async fn handle_connection(
    mut client: TcpStream,
    client_addr: SocketAddr,
    guard: GenerationGuard,
    frontend_index: usize,
    metrics: Arc<MetricsCollector>,
) {
    let topology = guard.topology().clone();
    let frontend = &topology.frontends()[frontend_index];
    let settings = topology.settings();

    frontend.record_accepted();
    metrics.record_connection(&frontend.name);

    let mut info = ConnectionInfo::new(
        Protocol::Tcp,
        &frontend.name,
        client_addr,
        topology.generation(),
    );
    debug!(
        "[{}] Accepted {} on frontend '{}' (generation {})",
        info.id, client_addr, frontend.name, info.generation
    );

    let routed = match topology.pool(&frontend.backend) {
        Some(pool) => route(&mut client, pool, client_addr, settings, &metrics).await,
        None => Err(ProxyError::UnknownBackend(frontend.backend.clone())),
    };

    let (backend, selection, initial) = match routed {
        Ok(routed) => routed,
        Err(e) => {
            warn!(
                "[{}] Rejecting {} on frontend '{}': {}",
                info.id, client_addr, frontend.name, e
            );
            frontend.record_rejected();
            metrics.record_rejection(&frontend.name, e.reason());
            reject(client);
            return;
        }
    };

    info.server_addr = Some(selection.server().address());
    debug!(
        "[{}] {} -> {}/{} ({})",
        info.id,
        client_addr,
        selection.server().backend(),
        selection.server().name(),
        selection.server().address()
    );

    let activity = Activity::new();
    let result = relay(client, backend, &initial, settings, guard.closed(), &activity).await;
    let (up, down) = activity.bytes();

    match &result {
        Ok(()) => debug!(
            "[{}] Closed after {:?}: sent {} bytes, received {} bytes",
            info.id,
            info.duration(),
            up,
            down
        ),
        Err(ProxyError::ForceClosed) => info!(
            "[{}] Force-closed by drain of generation {}",
            info.id, info.generation
        ),
        Err(e) => debug!("[{}] Relay ended: {}", info.id, e),
    }

    metrics.record_connection_closed(&frontend.name, info.duration(), up, down);
    drop(selection);
}

/// Picks a server, reading the hash key first when the backend needs one.
/// Bytes consumed while extracting the key are returned for replay.
async fn route(
    client: &mut TcpStream,
    pool: &BackendPool,
    client_addr: SocketAddr,
    settings: &EngineSettings,
    metrics: &MetricsCollector,
) -> ProxyResult<(TcpStream, Selection, Vec<u8>)> {
    let mut context = RoutingContext::new(client_addr, Protocol::Tcp);
    let mut initial = Vec::new();

    if let Some(extractor) = pool.key_extractor() {
        initial = read_key_prefix(client, extractor, settings.key_peek_timeout()).await?;
        context = context.with_key(extractor.extract(&initial));
    }

    let (stream, selection) =
        dial_with_failover(pool, &context, settings.connect_timeout(), metrics).await?;
    Ok((stream, selection, initial))
}

/// 读取提取哈希键所需的前缀，超时后使用已读到的数据
async fn read_key_prefix(
    client: &mut TcpStream,
    extractor: &KeyExtractor,
    limit: Duration,
) -> ProxyResult<Vec<u8>> {
    let deadline = Instant::now() + limit;
    let mut buffer = vec![0u8; extractor.peek_len()];
    let mut filled = 0;

    while filled < buffer.len() && extractor.needs_more(&buffer[..filled]) {
        match timeout_at(deadline, client.read(&mut buffer[filled..])).await {
            Ok(Ok(0)) | Err(_) => break,
            Ok(Ok(n)) => filled += n,
            Ok(Err(e)) => return Err(ProxyError::Io(e)),
        }
    }

    buffer.truncate(filled);
    Ok(buffer)
}

/// Dials the selected server; on failure re-selects once with the failed
/// server excluded for this connection only. Health state is untouched.
async fn dial_with_failover(
    pool: &BackendPool,
    context: &RoutingContext,
    connect_timeout: Duration,
    metrics: &MetricsCollector,
) -> ProxyResult<(TcpStream, Selection)> {
    let mut excluded = Vec::with_capacity(DIAL_ATTEMPTS);
    let mut last_error = None;

    while excluded.len() < DIAL_ATTEMPTS {
        let selection = match pool.select(context, &excluded) {
            Ok(selection) => selection,
            Err(e) => return Err(last_error.unwrap_or_else(|| e.into())),
        };
        let server = selection.server().clone();

        let error = match timeout(connect_timeout, TcpStream::connect(server.address())).await {
            Ok(Ok(stream)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("Failed to set TCP_NODELAY: {}", e);
                }
                return Ok((stream, selection));
            }
            Ok(Err(e)) => e,
            Err(_) => std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("connect timed out after {:?}", connect_timeout),
            ),
        };

        warn!(
            "Dial to {}/{} ({}) failed: {}",
            server.backend(),
            server.name(),
            server.address(),
            error
        );
        server.record_dial_failure();
        metrics.record_dial_failure(server.backend(), server.name());

        excluded.push(selection.index);
        last_error = Some(ProxyError::DialFailed {
            backend: server.backend().to_string(),
            server: server.name().to_string(),
            address: server.address(),
            source: error,
        });
    }

    Err(last_error
        .unwrap_or_else(|| ProxyError::UnknownBackend(pool.name().to_string())))
}

/// 以RST拒绝连接
fn reject(stream: TcpStream) {
    if let Err(e) = stream.set_linger(Some(Duration::ZERO)) {
        debug!("Failed to set SO_LINGER on rejected connection: {}", e);
    }
    drop(stream);
}

/// 双向转发，直到两端都关闭、空闲超时或本代被强制关闭
async fn relay(
    client: TcpStream,
    backend: TcpStream,
    initial: &[u8],
    settings: &EngineSettings,
    mut closed: watch::Receiver<bool>,
    activity: &Activity,
) -> ProxyResult<()> {
    let (mut client_read, mut client_write) = client.into_split();
    let (mut backend_read, mut backend_write) = backend.into_split();

    if !initial.is_empty() {
        backend_write.write_all(initial).await?;
        activity.record_upstream(initial.len());
    }

    let buffer_size = settings.buffer_size.max(1024);
    let upstream = copy_half(&mut client_read, &mut backend_write, buffer_size, |n| {
        activity.record_upstream(n)
    });
    let downstream = copy_half(&mut backend_read, &mut client_write, buffer_size, |n| {
        activity.record_downstream(n)
    });

    let idle_timeout = settings.idle_timeout();
    let idle = async {
        loop {
            let remaining = idle_timeout.saturating_sub(activity.idle_for());
            if remaining.is_zero() {
                break;
            }
            sleep(remaining).await;
        }
    };

    tokio::select! {
        result = async { tokio::try_join!(upstream, downstream) } => result.map(|_| ()),
        _ = idle => Err(ProxyError::IdleTimeout(idle_timeout)),
        _ = closed.wait_for(|closed| *closed) => Err(ProxyError::ForceClosed),
    }
}

/// 单向复制，读到EOF后关闭对端写方向
async fn copy_half<R, W, F>(
    reader: &mut R,
    writer: &mut W,
    buffer_size: usize,
    on_bytes: F,
) -> ProxyResult<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: Fn(usize),
{
    let mut buffer = vec![0u8; buffer_size];

    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            writer.shutdown().await?;
            return Ok(());
        }
        writer.write_all(&buffer[..n]).await?;
        on_bytes(n);
    }
}
