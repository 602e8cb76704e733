//! HTTPS CONNECT tunnel relay (§4.2): bidirectional byte copy between client
//! and upstream, completing only once both directions have finished.

use smol::io::{copy, AsyncRead, AsyncWrite};
use smol::net::TcpStream;

use crate::error::Result;

pub const CONNECTION_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";

/// Runs the two sibling copy tasks and waits for both to finish, per §4.2.
/// If either side errors it closes both sockets before reporting, which
/// causes the peer copy to observe EOF and terminate on its own.
pub async fn relay(client: TcpStream, upstream: TcpStream) -> Result<()> {
    let (tx, rx) = async_channel::bounded::<()>(2);

    let c2u = {
        let client_read = client.clone();
        let upstream_write = upstream.clone();
        let client_for_close = client.clone();
        let upstream_for_close = upstream.clone();
        let done = tx.clone();
        smol::spawn(async move {
            if copy_direction(client_read, upstream_write).await.is_err() {
                let _ = client_for_close.shutdown(std::net::Shutdown::Both);
                let _ = upstream_for_close.shutdown(std::net::Shutdown::Both);
            }
            let _ = done.send(()).await;
        })
    };

    let u2c = {
        let upstream_read = upstream.clone();
        let client_write = client.clone();
        let client_for_close = client.clone();
        let upstream_for_close = upstream.clone();
        let done = tx.clone();
        smol::spawn(async move {
            if copy_direction(upstream_read, client_write).await.is_err() {
                let _ = client_for_close.shutdown(std::net::Shutdown::Both);
                let _ = upstream_for_close.shutdown(std::net::Shutdown::Both);
            }
            let _ = done.send(()).await;
        })
    };

    // Wait for both completion signals before tearing down.
    let _ = rx.recv().await;
    let _ = rx.recv().await;
    c2u.await;
    u2c.await;
    Ok(())
}

async fn copy_direction<R, W>(mut reader: R, mut writer: W) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    copy(&mut reader, &mut writer).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use smol::io::{AsyncReadExt, AsyncWriteExt};
    use smol::net::TcpListener;

    #[test]
    fn relays_bytes_both_directions_and_completes_on_upstream_close() {
        smol::block_on(async {
            let client_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let upstream_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let client_addr = client_listener.local_addr().unwrap();
            let upstream_addr = upstream_listener.local_addr().unwrap();

            let client_side = smol::spawn(async move {
                let mut s = TcpStream::connect(client_addr).await.unwrap();
                s.write_all(b"ping").await.unwrap();
                let mut buf = [0u8; 4];
                s.read_exact(&mut buf).await.unwrap();
                assert_eq!(&buf, b"pong");
            });

            let upstream_side = smol::spawn(async move {
                let mut s = TcpStream::connect(upstream_addr).await.unwrap();
                let mut buf = [0u8; 4];
                s.read_exact(&mut buf).await.unwrap();
                assert_eq!(&buf, b"ping");
                s.write_all(b"pong").await.unwrap();
            });

            let (client_accept, _) = client_listener.accept().await.unwrap();
            let (upstream_accept, _) = upstream_listener.accept().await.unwrap();

            relay(client_accept, upstream_accept).await.unwrap();
            client_side.await;
            upstream_side.await;
        });
    }
}
