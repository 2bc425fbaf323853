//! Shared-secret challenge-response run once per bridge connection, right
//! after the server accepts the Unix socket connection the bridge dialed
//! back to confirm it is talking to the supervisor that spawned it and not
//! some other local process that happened to connect to the same path.
//!
//! The secret never touches argv, the environment, or disk: it is generated
//! per-spawn and handed to the child through an inherited pipe file
//! descriptor, readable only by the bridge process itself.

use hmac::{Hmac, Mac as _};
use rand::RngCore as _;
use sha2::Sha256;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

pub const SECRET_LEN: usize = 32;
const CHALLENGE_LEN: usize = 32;
const MAC_LEN: usize = 32;

pub type Secret = [u8; SECRET_LEN];

pub fn generate_secret() -> Secret {
    let mut secret = [0u8; SECRET_LEN];
    rand::thread_rng().fill_bytes(&mut secret);
    secret
}

fn mac_for(secret: &Secret, challenge: &[u8]) -> [u8; MAC_LEN] {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(challenge);
    mac.finalize().into_bytes().into()
}

/// Server side: send a random challenge, then verify the bridge's response.
pub async fn authenticate_server<S>(stream: &mut S, secret: &Secret) -> anyhow::Result<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let mut challenge = [0u8; CHALLENGE_LEN];
    rand::thread_rng().fill_bytes(&mut challenge);
    stream.write_all(&challenge).await?;

    let mut response = [0u8; MAC_LEN];
    stream.read_exact(&mut response).await?;

    let expected = mac_for(secret, &challenge);
    if !constant_time_eq(&expected, &response) {
        anyhow::bail!("bridge handshake failed: MAC mismatch");
    }

    Ok(())
}

/// Bridge side: read the challenge, respond with its MAC.
pub async fn authenticate_client<S>(stream: &mut S, secret: &Secret) -> anyhow::Result<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let mut challenge = [0u8; CHALLENGE_LEN];
    stream.read_exact(&mut challenge).await?;

    let response = mac_for(secret, &challenge);
    stream.write_all(&response).await?;

    Ok(())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn handshake_succeeds_with_matching_secret() {
        let secret = generate_secret();
        let (mut server, mut client) = tokio::io::duplex(128);

        let server_secret = secret;
        let server_task = tokio::spawn(async move { authenticate_server(&mut server, &server_secret).await });
        let client_task = tokio::spawn(async move { authenticate_client(&mut client, &secret).await });

        server_task.await.unwrap().unwrap();
        client_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn handshake_fails_with_wrong_secret() {
        let server_secret = generate_secret();
        let client_secret = generate_secret();
        let (mut server, mut client) = tokio::io::duplex(128);

        let server_task = tokio::spawn(async move { authenticate_server(&mut server, &server_secret).await });
        let client_task = tokio::spawn(async move { authenticate_client(&mut client, &client_secret).await });

        let server_result = server_task.await.unwrap();
        let _ = client_task.await.unwrap();
        assert!(server_result.is_err());
    }

    #[test]
    fn constant_time_eq_rejects_different_lengths() {
        assert!(!constant_time_eq(&[1, 2, 3], &[1, 2]));
    }
}
