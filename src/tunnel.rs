use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::stats::TrafficCounters;

const COPY_BUF_SIZE: usize = 16 * 1024;

/// Copy one tunnel direction until EOF or error, then half-close the write
/// side so the peer sees end-of-stream in that direction.
async fn copy_half<R, W>(
    reader: &mut R,
    writer: &mut W,
    idle: Option<Duration>,
    count: impl Fn(u64),
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let result = async {
        let mut buf = vec![0u8; COPY_BUF_SIZE];
        let mut total = 0u64;
        loop {
            let n = match idle {
                Some(limit) => tokio::time::timeout(limit, reader.read(&mut buf))
                    .await
                    .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "tunnel idle timeout"))??,
                None => reader.read(&mut buf).await?,
            };
            if n == 0 {
                break;
            }
            writer.write_all(&buf[..n]).await?;
            total += n as u64;
            count(n as u64);
        }
        Ok(total)
    }
    .await;
    writer.shutdown().await.ok();
    result
}

/// Opaque duplex pump between the client half and the target/upstream half.
///
/// `initial` carries tunnel bytes that arrived together with an upstream
/// CONNECT response head; they reach the client before copying starts. Each
/// direction half-closes its peer on EOF; the pump returns once both
/// directions drain. Back-pressure comes from `write_all` completing before
/// the next read. Cancelling `cancel` destroys both streams immediately.
pub(crate) async fn pump<C, S>(
    client: C,
    server: S,
    initial: Bytes,
    counters: Arc<TrafficCounters>,
    cancel: CancellationToken,
    idle: Option<Duration>,
) -> io::Result<()>
where
    C: AsyncRead + AsyncWrite + Unpin,
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut server_read, mut server_write) = tokio::io::split(server);

    let run = async {
        if !initial.is_empty() {
            client_write.write_all(&initial).await?;
            counters.add_to_client(initial.len() as u64);
        }

        let up = copy_half(&mut client_read, &mut server_write, idle, |n| {
            counters.add_from_client(n)
        });
        let down = copy_half(&mut server_read, &mut client_write, idle, |n| {
            counters.add_to_client(n)
        });
        let (up, down) = tokio::join!(up, down);
        match (up, down) {
            (Ok(sent), Ok(received)) => {
                debug!(sent, received, "tunnel drained");
                Ok(())
            }
            (Err(err), _) | (_, Err(err)) => Err(err),
        }
    };

    tokio::select! {
        _ = cancel.cancelled() => Err(io::Error::new(
            io::ErrorKind::Interrupted,
            "connection destroyed during shutdown",
        )),
        result = run => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pump_copies_both_directions_in_order() {
        let (mut client_end, pump_client) = tokio::io::duplex(1024);
        let (mut server_end, pump_server) = tokio::io::duplex(1024);
        let counters = Arc::new(TrafficCounters::default());

        let pump_counters = counters.clone();
        let task = tokio::spawn(pump(
            pump_client,
            pump_server,
            Bytes::new(),
            pump_counters,
            CancellationToken::new(),
            None,
        ));

        client_end.write_all(b"abc").await.unwrap();
        let mut buf = [0u8; 3];
        server_end.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"abc");

        server_end.write_all(b"defg").await.unwrap();
        let mut buf = [0u8; 4];
        client_end.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"defg");

        // Closing both ends drains the pump
        drop(client_end);
        drop(server_end);
        task.await.unwrap().unwrap();

        assert_eq!(counters.snapshot(), (3, 4));
    }

    #[tokio::test]
    async fn pump_delivers_initial_bytes_to_the_client_first() {
        let (mut client_end, pump_client) = tokio::io::duplex(1024);
        let (server_end, pump_server) = tokio::io::duplex(1024);
        let counters = Arc::new(TrafficCounters::default());

        let task = tokio::spawn(pump(
            pump_client,
            pump_server,
            Bytes::from_static(b"early"),
            counters.clone(),
            CancellationToken::new(),
            None,
        ));

        let mut buf = [0u8; 5];
        client_end.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"early");

        drop(client_end);
        drop(server_end);
        task.await.unwrap().unwrap();

        assert_eq!(counters.to_client(), 5);
    }

    #[tokio::test]
    async fn pump_stops_when_cancelled() {
        let (_client_end, pump_client) = tokio::io::duplex(1024);
        let (_server_end, pump_server) = tokio::io::duplex(1024);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(pump(
            pump_client,
            pump_server,
            Bytes::new(),
            Arc::new(TrafficCounters::default()),
            cancel.clone(),
            None,
        ));

        cancel.cancel();
        let err = task.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Interrupted);
    }

    #[tokio::test]
    async fn pump_times_out_idle_tunnels_when_configured() {
        let (_client_end, pump_client) = tokio::io::duplex(1024);
        let (_server_end, pump_server) = tokio::io::duplex(1024);

        let err = pump(
            pump_client,
            pump_server,
            Bytes::new(),
            Arc::new(TrafficCounters::default()),
            CancellationToken::new(),
            Some(Duration::from_millis(20)),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }
}
