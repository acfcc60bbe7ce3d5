//! Password-challenge handshake run once per connection before any command.

use super::packet::{
    recv_data, recv_packet, send_data, send_packet, Packet, CMD_AUTH, MAGIC, REPLY_AUTH_FAILED,
    REPLY_OK,
};
use crate::error::{RpcError, TransportError};
use rand::distributions::Alphanumeric;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

pub const CHALLENGE_LEN: usize = 64;

pub const AUTH_SUCCESS: &str = "Authentication success";
pub const AUTH_FAILED: &str = "Authentication failed";

/// Fresh printable challenge for one connection
pub fn generate_challenge() -> Vec<u8> {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(CHALLENGE_LEN)
        .collect()
}

/// Hex sha256 of `password ‖ challenge`
pub fn digest(password: &str, challenge: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    hasher.update(challenge);
    hex::encode(hasher.finalize())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Server side of the handshake.
///
/// On a bad digest the failure reply is sent and the write half is shut
/// down before returning `AuthFailed`.
pub async fn server_handshake<S>(
    stream: &mut S,
    password: &str,
    timeout: Duration,
) -> Result<(), RpcError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let challenge = generate_challenge();
    let mut hello = Vec::with_capacity(MAGIC.len() + CHALLENGE_LEN);
    hello.extend_from_slice(MAGIC);
    hello.extend_from_slice(&challenge);
    send_data(stream, &hello, timeout).await?;

    let packet = recv_packet(stream, timeout).await?;
    let expected = digest(password, &challenge);

    let accepted = packet.code == CMD_AUTH
        && packet.payload.len() == MAGIC.len() + expected.len()
        && &packet.payload[..MAGIC.len()] == MAGIC
        && constant_time_eq(&packet.payload[MAGIC.len()..], expected.as_bytes());

    if !accepted {
        warn!("Rejecting connection: authentication failed");
        send_packet(stream, &Packet::error(REPLY_AUTH_FAILED, AUTH_FAILED), timeout).await?;
        let _ = stream.shutdown().await;
        return Err(RpcError::AuthFailed(AUTH_FAILED.to_string()));
    }

    send_packet(stream, &Packet::error(REPLY_OK, AUTH_SUCCESS), timeout).await?;
    debug!("Handshake completed");
    Ok(())
}

/// Client side of the handshake. Any non-zero reply is final.
pub async fn client_handshake<S>(
    stream: &mut S,
    password: &str,
    timeout: Duration,
) -> Result<(), RpcError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let hello = recv_data(stream, MAGIC.len() + CHALLENGE_LEN, timeout).await?;
    if &hello[..MAGIC.len()] != MAGIC {
        return Err(TransportError::Malformed("bad magic in server challenge".to_string()).into());
    }
    let challenge = &hello[MAGIC.len()..];

    let mut payload = Vec::with_capacity(MAGIC.len() + 64);
    payload.extend_from_slice(MAGIC);
    payload.extend_from_slice(digest(password, challenge).as_bytes());
    send_packet(stream, &Packet::new(CMD_AUTH, payload), timeout).await?;

    let reply = recv_packet(stream, timeout).await?;
    if reply.code != REPLY_OK {
        return Err(RpcError::AuthFailed(reply.message()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_challenge_is_printable_and_fresh() {
        let a = generate_challenge();
        let b = generate_challenge();
        assert_eq!(a.len(), CHALLENGE_LEN);
        assert!(a.iter().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_digest_is_sha256_hex() {
        // sha256("abc")
        assert_eq!(
            digest("a", b"bc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn test_handshake_success() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let t = Duration::from_secs(5);
        let srv = tokio::spawn(async move { server_handshake(&mut server, "secret", t).await });
        client_handshake(&mut client, "secret", t).await.unwrap();
        srv.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_handshake_wrong_password() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let t = Duration::from_secs(5);
        let srv = tokio::spawn(async move { server_handshake(&mut server, "secret", t).await });
        let err = client_handshake(&mut client, "guess", t).await.unwrap_err();
        assert_eq!(err, RpcError::AuthFailed(AUTH_FAILED.to_string()));
        assert!(matches!(
            srv.await.unwrap(),
            Err(RpcError::AuthFailed(_))
        ));
    }
}
