//! The noise-framed transport.
//!
//! The Noise_XK cipher itself (secp256k1 DH, ChaCha20-Poly1305, SHA-256,
//! prologue `"lightning"`) is an external collaborator behind the
//! [`NoiseHandshake`] / cipher seams; this module drives the handshake
//! (50 / 50 / 66-byte acts, with timeouts) and frames wire messages as
//! `0x00 || encrypted_length(18) || ciphertext`.

use std::time::Duration;

use anyhow::{bail, ensure, Context};
use tokio::{
    io::{
        AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf,
        WriteHalf,
    },
    time,
};
use tracing::debug;

pub const ACT1_LEN: usize = 50;
pub const ACT2_LEN: usize = 50;
pub const ACT3_LEN: usize = 66;

/// Every frame starts with this version byte.
pub const FRAME_PREFIX: u8 = 0x00;

/// Encrypted 2-byte length plus its 16-byte tag.
pub const ENCRYPTED_LEN_LEN: usize = 18;

/// Outbound (initiator) side of the Noise XK handshake.
pub trait NoiseHandshake: Send {
    /// Produce act 1 (must be [`ACT1_LEN`] bytes).
    fn act1(&mut self) -> anyhow::Result<Vec<u8>>;

    /// Consume the responder's act 2.
    fn read_act2(&mut self, act2: &[u8]) -> anyhow::Result<()>;

    /// Produce act 3 (must be [`ACT3_LEN`] bytes).
    fn act3(&mut self) -> anyhow::Result<Vec<u8>>;

    /// Finish, yielding the directional transport ciphers.
    fn split(
        self: Box<Self>,
    ) -> (Box<dyn SendCipher>, Box<dyn RecvCipher>);
}

/// Encrypts outgoing frames.
pub trait SendCipher: Send {
    /// `encrypted_length(18) || ciphertext || tag`
    fn encrypt(&mut self, plaintext: &[u8]) -> Vec<u8>;
}

/// Decrypts incoming frames.
pub trait RecvCipher: Send {
    /// Decrypt the 18-byte length header, returning the byte count of
    /// `ciphertext || tag` that follows.
    fn decrypt_length(
        &mut self,
        header: &[u8; ENCRYPTED_LEN_LEN],
    ) -> anyhow::Result<usize>;

    fn decrypt_payload(
        &mut self,
        ciphertext: Vec<u8>,
    ) -> anyhow::Result<Vec<u8>>;
}

/// Run the outbound handshake over `stream` within `handshake_timeout`.
pub async fn handshake<S>(
    stream: &mut S,
    mut noise: Box<dyn NoiseHandshake>,
    handshake_timeout: Duration,
) -> anyhow::Result<(Box<dyn SendCipher>, Box<dyn RecvCipher>)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let result = time::timeout(handshake_timeout, async {
        let act1 = noise.act1().context("act1 failed")?;
        ensure!(act1.len() == ACT1_LEN, "act1 must be {ACT1_LEN} bytes");
        stream.write_all(&act1).await.context("writing act1")?;

        let mut act2 = [0u8; ACT2_LEN];
        stream
            .read_exact(&mut act2)
            .await
            .context("reading act2")?;
        noise.read_act2(&act2).context("act2 rejected")?;

        let act3 = noise.act3().context("act3 failed")?;
        ensure!(act3.len() == ACT3_LEN, "act3 must be {ACT3_LEN} bytes");
        stream.write_all(&act3).await.context("writing act3")?;

        debug!("noise handshake complete");
        Ok(noise.split())
    })
    .await;
    result.context("handshake timed out")?
}

/// The writing half of an established transport.
pub struct FrameWriter<S> {
    stream: WriteHalf<S>,
    cipher: Box<dyn SendCipher>,
}

impl<S: AsyncRead + AsyncWrite> FrameWriter<S> {
    pub async fn write_frame(
        &mut self,
        plaintext: &[u8],
    ) -> anyhow::Result<()> {
        let encrypted = self.cipher.encrypt(plaintext);
        self.stream
            .write_all(&[FRAME_PREFIX])
            .await
            .context("writing frame prefix")?;
        self.stream
            .write_all(&encrypted)
            .await
            .context("writing frame body")?;
        Ok(())
    }
}

/// The reading half of an established transport.
pub struct FrameReader<S> {
    stream: ReadHalf<S>,
    cipher: Box<dyn RecvCipher>,
}

impl<S: AsyncRead + AsyncWrite> FrameReader<S> {
    pub async fn read_frame(&mut self) -> anyhow::Result<Vec<u8>> {
        let mut prefix = [0u8; 1];
        self.stream
            .read_exact(&mut prefix)
            .await
            .context("reading frame prefix")?;
        if prefix[0] != FRAME_PREFIX {
            bail!("unknown frame prefix {:#04x}", prefix[0]);
        }

        let mut header = [0u8; ENCRYPTED_LEN_LEN];
        self.stream
            .read_exact(&mut header)
            .await
            .context("reading frame length")?;
        let payload_len = self.cipher.decrypt_length(&header)?;

        let mut ciphertext = vec![0u8; payload_len];
        self.stream
            .read_exact(&mut ciphertext)
            .await
            .context("reading frame body")?;
        self.cipher.decrypt_payload(ciphertext)
    }
}

/// Split an established stream into framed halves.
pub fn framed<S>(
    stream: S,
    send_cipher: Box<dyn SendCipher>,
    recv_cipher: Box<dyn RecvCipher>,
) -> (FrameWriter<S>, FrameReader<S>)
where
    S: AsyncRead + AsyncWrite,
{
    let (read_half, write_half) = tokio::io::split(stream);
    (
        FrameWriter {
            stream: write_half,
            cipher: send_cipher,
        },
        FrameReader {
            stream: read_half,
            cipher: recv_cipher,
        },
    )
}

/// A do-nothing cipher for tests and loopback: the "tag" is 16 zero
/// bytes, the length travels in the clear.
pub mod plaintext {
    use super::*;

    pub struct PlainHandshake;

    impl NoiseHandshake for PlainHandshake {
        fn act1(&mut self) -> anyhow::Result<Vec<u8>> {
            Ok(vec![0u8; ACT1_LEN])
        }

        fn read_act2(&mut self, act2: &[u8]) -> anyhow::Result<()> {
            ensure!(act2.len() == ACT2_LEN, "bad act2 length");
            Ok(())
        }

        fn act3(&mut self) -> anyhow::Result<Vec<u8>> {
            Ok(vec![0u8; ACT3_LEN])
        }

        fn split(
            self: Box<Self>,
        ) -> (Box<dyn SendCipher>, Box<dyn RecvCipher>) {
            (Box::new(PlainCipher), Box::new(PlainCipher))
        }
    }

    pub struct PlainCipher;

    impl SendCipher for PlainCipher {
        fn encrypt(&mut self, plaintext: &[u8]) -> Vec<u8> {
            let mut out =
                Vec::with_capacity(ENCRYPTED_LEN_LEN + plaintext.len() + 16);
            out.extend_from_slice(
                &(plaintext.len() as u16).to_be_bytes(),
            );
            out.extend_from_slice(&[0u8; 16]);
            out.extend_from_slice(plaintext);
            out.extend_from_slice(&[0u8; 16]);
            out
        }
    }

    impl RecvCipher for PlainCipher {
        fn decrypt_length(
            &mut self,
            header: &[u8; ENCRYPTED_LEN_LEN],
        ) -> anyhow::Result<usize> {
            let len =
                u16::from_be_bytes([header[0], header[1]]) as usize;
            Ok(len + 16)
        }

        fn decrypt_payload(
            &mut self,
            mut ciphertext: Vec<u8>,
        ) -> anyhow::Result<Vec<u8>> {
            ensure!(ciphertext.len() >= 16, "missing tag");
            ciphertext.truncate(ciphertext.len() - 16);
            Ok(ciphertext)
        }
    }
}

#[cfg(test)]
mod test {
    use super::plaintext::PlainHandshake;
    use super::*;
    use crate::wire::{LightningMessage, Ping};

    #[tokio::test]
    async fn handshake_enforces_act_sizes_and_timeout() {
        let (client, mut server) = tokio::io::duplex(1024);

        let server_task = tokio::spawn(async move {
            // Responder: read act1, send act2, read act3.
            let mut act1 = [0u8; ACT1_LEN];
            server.read_exact(&mut act1).await.unwrap();
            server.write_all(&[0u8; ACT2_LEN]).await.unwrap();
            let mut act3 = [0u8; ACT3_LEN];
            server.read_exact(&mut act3).await.unwrap();
            server
        });

        let mut client = client;
        let ciphers = handshake(
            &mut client,
            Box::new(PlainHandshake),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        drop(ciphers);
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn frames_roundtrip_through_the_codec() {
        let (client, server) = tokio::io::duplex(4096);
        let (mut writer, _) = framed(
            client,
            Box::new(plaintext::PlainCipher),
            Box::new(plaintext::PlainCipher),
        );
        let (_, mut reader) = framed(
            server,
            Box::new(plaintext::PlainCipher),
            Box::new(plaintext::PlainCipher),
        );

        let msg = LightningMessage::Ping(Ping {
            num_pong_bytes: 4,
            ignored: vec![1, 2, 3],
        });
        writer.write_frame(&msg.encode()).await.unwrap();

        let bytes = reader.read_frame().await.unwrap();
        assert_eq!(LightningMessage::decode(&bytes).unwrap(), msg);
    }

    #[tokio::test]
    async fn bad_frame_prefix_is_rejected() {
        let (client, server) = tokio::io::duplex(1024);
        let (_, mut reader) = framed(
            server,
            Box::new(plaintext::PlainCipher),
            Box::new(plaintext::PlainCipher),
        );

        let mut client = client;
        client.write_all(&[0x01, 0, 0]).await.unwrap();
        let err = reader.read_frame().await.unwrap_err();
        assert!(err.to_string().contains("unknown frame prefix"));
    }
}
