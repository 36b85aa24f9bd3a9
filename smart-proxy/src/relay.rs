use crate::error::RelayError;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::io::copy_bidirectional;

/// Byte counts moved by a finished relay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub client_to_remote: u64,
    pub remote_to_client: u64,
}

/// Copies bytes in both directions until both sides have closed.
///
/// Each direction is forwarded in order and unmodified; when one side finishes writing, the
/// other side's write half is shut down.
pub async fn relay<C, R>(
    client: &mut C,
    remote: &mut R,
    target: &str,
) -> Result<RelayStats, RelayError>
where
    C: AsyncRead + AsyncWrite + Unpin + ?Sized,
    R: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let (client_to_remote, remote_to_client) = copy_bidirectional(client, remote)
        .await
        .map_err(|source| RelayError {
            target: target.to_string(),
            source,
        })?;
    Ok(RelayStats {
        client_to_remote,
        remote_to_client,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tokio::io::AsyncReadExt;
    use tokio::io::AsyncWriteExt;
    use tokio::io::duplex;

    #[tokio::test]
    async fn forwards_bytes_both_ways_until_close() {
        let (mut client, mut client_side) = duplex(16 * 1024);
        let (mut remote_side, mut remote) = duplex(16 * 1024);

        let relay_task = tokio::spawn(async move {
            relay(&mut client_side, &mut remote_side, "test").await
        });

        let payload: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
        client.write_all(&payload).await.unwrap();
        client.shutdown().await.unwrap();

        let mut received = Vec::new();
        remote.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, payload);

        remote.write_all(b"response bytes").await.unwrap();
        remote.shutdown().await.unwrap();

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"response bytes");

        let stats = relay_task.await.unwrap().unwrap();
        assert_eq!(
            stats,
            RelayStats {
                client_to_remote: 4096,
                remote_to_client: 14,
            }
        );
    }
}
