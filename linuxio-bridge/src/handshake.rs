//! Client side of the shared-secret challenge-response handshake; the
//! server side lives in `linuxio-server::handshake`. Both sides implement
//! the same HMAC-SHA256-over-a-random-challenge scheme independently since
//! there's no shared crate between the two binaries for anything this
//! small, but the wire contract between them must stay identical.

use hmac::{Hmac, Mac as _};
use sha2::Sha256;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

pub const SECRET_LEN: usize = 32;
const CHALLENGE_LEN: usize = 32;

pub type Secret = [u8; SECRET_LEN];

fn mac_for(secret: &Secret, challenge: &[u8]) -> [u8; 32] {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(challenge);
    mac.finalize().into_bytes().into()
}

/// Reads the server's challenge and responds with its MAC.
pub async fn authenticate<S>(stream: &mut S, secret: &Secret) -> anyhow::Result<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let mut challenge = [0u8; CHALLENGE_LEN];
    stream.read_exact(&mut challenge).await?;

    let response = mac_for(secret, &challenge);
    stream.write_all(&response).await?;

    Ok(())
}
