//! The obfuscated "message stream encryption" (MSE) handshake.
//!
//! Some swarms and ISPs drop connections that open with the plaintext
//! BitTorrent handshake. MSE wraps the whole connection in RC4 after an
//! anonymous Diffie-Hellman exchange, with a SHA-1 based synchronization
//! marker so the receiver can find the cipher stream inside the random
//! padding. This module is self-contained: the plaintext path never touches
//! it, and the engine only calls [`initiate`] on outbound connections when
//! configured to.
//!
//! Only the initiating side is implemented. The initial payload (IA) is left
//! empty, so after the exchange completes the regular handshake codec runs
//! on top of the returned [`ObfuscatedStream`] unchanged.

use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use num_bigint::BigUint;
use rand::{Rng, RngCore};
use sha1::{Digest, Sha1};
use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf,
};

use crate::{
    error::{PeerError, PeerResult, ProtocolError},
    Sha1Hash,
};

/// The fixed 768-bit prime of the MSE key exchange, big-endian.
const DH_PRIME: &[u8; 96] = &[
    0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xC9, 0x0F, 0xDA, 0xA2,
    0x21, 0x68, 0xC2, 0x34, 0xC4, 0xC6, 0x62, 0x8B, 0x80, 0xDC, 0x1C, 0xD1,
    0x29, 0x02, 0x4E, 0x08, 0x8A, 0x67, 0xCC, 0x74, 0x02, 0x0B, 0xBE, 0xA6,
    0x3B, 0x13, 0x9B, 0x22, 0x51, 0x4A, 0x08, 0x79, 0x8E, 0x34, 0x04, 0xDD,
    0xEF, 0x95, 0x19, 0xB3, 0xCD, 0x3A, 0x43, 0x1B, 0x30, 0x2B, 0x0A, 0x6D,
    0xF2, 0x5F, 0x14, 0x37, 0x4F, 0xE1, 0x35, 0x6D, 0x6D, 0x51, 0xC2, 0x45,
    0xE4, 0x85, 0xB5, 0x76, 0x62, 0x5E, 0x7E, 0xC6, 0xF4, 0x4C, 0x42, 0xE9,
    0xA6, 0x3A, 0x36, 0x21, 0x00, 0x00, 0x00, 0x00, 0x00, 0x09, 0x05, 0x63,
];

/// The DH generator.
const DH_GENERATOR: u32 = 2;

/// Length of a public key on the wire.
const PUBKEY_LEN: usize = 96;

/// Both sides may append up to this much random padding to their public key.
const MAX_PAD_LEN: usize = 512;

/// The verification constant marking the start of the cipher stream.
const VC_LEN: usize = 8;

/// RC4 keystream bytes discarded before use, per the MSE specification.
const RC4_DISCARD: usize = 1024;

/// The crypto method bit for RC4.
const CRYPTO_RC4: u32 = 0x02;

/// A textbook RC4 cipher. MSE mandates RC4; the 1024 byte keystream discard
/// mitigates its weak initial bytes.
pub(crate) struct Rc4 {
    s: [u8; 256],
    i: u8,
    j: u8,
}

impl Rc4 {
    pub fn new(key: &[u8]) -> Self {
        debug_assert!(!key.is_empty() && key.len() <= 256);
        let mut s = [0u8; 256];
        for (i, b) in s.iter_mut().enumerate() {
            *b = i as u8;
        }
        let mut j = 0u8;
        for i in 0..256 {
            j = j
                .wrapping_add(s[i])
                .wrapping_add(key[i % key.len()]);
            s.swap(i, j as usize);
        }
        Self { s, i: 0, j: 0 }
    }

    fn keystream_byte(&mut self) -> u8 {
        self.i = self.i.wrapping_add(1);
        self.j = self.j.wrapping_add(self.s[self.i as usize]);
        self.s.swap(self.i as usize, self.j as usize);
        self.s[self.s[self.i as usize]
            .wrapping_add(self.s[self.j as usize]) as usize]
    }

    /// Encrypts or decrypts in place (RC4 is symmetric).
    pub fn apply(&mut self, data: &mut [u8]) {
        for b in data {
            *b ^= self.keystream_byte();
        }
    }

    fn discard(&mut self, count: usize) {
        for _ in 0..count {
            self.keystream_byte();
        }
    }
}

fn sha1(parts: &[&[u8]]) -> Sha1Hash {
    let mut hasher = Sha1::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Left-pads a big-endian integer to the wire public key length.
fn pad_pubkey(bytes: Vec<u8>) -> [u8; PUBKEY_LEN] {
    debug_assert!(bytes.len() <= PUBKEY_LEN);
    let mut out = [0; PUBKEY_LEN];
    out[PUBKEY_LEN - bytes.len()..].copy_from_slice(&bytes);
    out
}

/// Performs the initiating side of the MSE exchange on a freshly connected
/// socket and returns the encrypted stream, ready for the plaintext
/// handshake codec.
pub(crate) async fn initiate<S>(
    mut socket: S,
    info_hash: &Sha1Hash,
) -> PeerResult<ObfuscatedStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // all random material is drawn up front; the thread-local generator
    // must not live across an await
    let (secret_bytes, pad) = {
        let mut rng = rand::thread_rng();
        let mut secret_bytes = [0u8; 20];
        rng.fill_bytes(&mut secret_bytes);
        let mut pad = vec![0u8; rng.gen_range(0..MAX_PAD_LEN)];
        rng.fill_bytes(&mut pad);
        (secret_bytes, pad)
    };

    // key exchange: x is a 160 bit secret, Ya = g^x mod p
    let prime = BigUint::from_bytes_be(DH_PRIME);
    let secret = BigUint::from_bytes_be(&secret_bytes);
    let pubkey =
        BigUint::from(DH_GENERATOR).modpow(&secret, &prime);

    let mut first = pad_pubkey(pubkey.to_bytes_be()).to_vec();
    first.extend_from_slice(&pad);
    socket.write_all(&first).await?;

    let mut remote_pubkey = [0u8; PUBKEY_LEN];
    socket.read_exact(&mut remote_pubkey).await?;
    let shared = BigUint::from_bytes_be(&remote_pubkey)
        .modpow(&secret, &prime);
    let shared = pad_pubkey(shared.to_bytes_be());

    // the initiator encrypts with keyA and decrypts with keyB
    let mut out_cipher = Rc4::new(&sha1(&[b"keyA", &shared, info_hash]));
    let mut in_cipher = Rc4::new(&sha1(&[b"keyB", &shared, info_hash]));
    out_cipher.discard(RC4_DISCARD);
    in_cipher.discard(RC4_DISCARD);

    // req1/req2/req3 let the receiver resynchronize and find the torrent
    let req2 = sha1(&[b"req2", info_hash]);
    let req3 = sha1(&[b"req3", &shared]);
    let mut obfuscated_hash = [0u8; 20];
    for i in 0..20 {
        obfuscated_hash[i] = req2[i] ^ req3[i];
    }

    // VC, crypto_provide, len(PadC), PadC, len(IA); IA itself stays empty so
    // the regular handshake flows through the established stream afterwards
    let mut payload = Vec::with_capacity(VC_LEN + 4 + 2 + 2);
    payload.extend_from_slice(&[0; VC_LEN]);
    payload.extend_from_slice(&CRYPTO_RC4.to_be_bytes());
    payload.extend_from_slice(&0u16.to_be_bytes());
    payload.extend_from_slice(&0u16.to_be_bytes());
    out_cipher.apply(&mut payload);

    let mut third = Vec::with_capacity(40 + payload.len());
    third.extend_from_slice(&sha1(&[b"req1", &shared]));
    third.extend_from_slice(&obfuscated_hash);
    third.extend_from_slice(&payload);
    socket.write_all(&third).await?;

    // The responder's cipher stream starts with VC (eight zero bytes), so
    // its ciphertext equals the first keystream bytes. Scan the incoming
    // padding for that marker.
    let mut vc_marker = [0u8; VC_LEN];
    in_cipher.apply(&mut vc_marker);

    let mut buf = Vec::with_capacity(MAX_PAD_LEN + VC_LEN);
    let mut sync_at = None;
    'scan: loop {
        if buf.len() > MAX_PAD_LEN + VC_LEN {
            return Err(ProtocolError::KeyExchange.into());
        }
        let mut chunk = [0u8; 64];
        let n = socket.read(&mut chunk).await?;
        if n == 0 {
            return Err(PeerError::Io(io::ErrorKind::UnexpectedEof.into()));
        }
        buf.extend_from_slice(&chunk[..n]);
        for start in 0..buf.len().saturating_sub(VC_LEN - 1) {
            if buf[start..start + VC_LEN] == vc_marker {
                sync_at = Some(start);
                break 'scan;
            }
        }
    }
    let sync_at = sync_at.expect("scan loop only exits on a match");
    buf.drain(..sync_at + VC_LEN);

    // crypto_select and the responder's padding follow the marker
    let mut trailer = [0u8; 6];
    read_decrypted(&mut socket, &mut in_cipher, &mut buf, &mut trailer)
        .await?;
    let crypto_select = u32::from_be_bytes([
        trailer[0], trailer[1], trailer[2], trailer[3],
    ]);
    if crypto_select != CRYPTO_RC4 {
        return Err(ProtocolError::KeyExchange.into());
    }
    let pad_d_len = u16::from_be_bytes([trailer[4], trailer[5]]) as usize;
    if pad_d_len > MAX_PAD_LEN {
        return Err(ProtocolError::KeyExchange.into());
    }
    let mut pad_d = vec![0u8; pad_d_len];
    read_decrypted(&mut socket, &mut in_cipher, &mut buf, &mut pad_d).await?;

    // whatever the responder pipelined after its padding is stream data
    in_cipher.apply(&mut buf);

    Ok(ObfuscatedStream {
        inner: socket,
        in_cipher,
        out_cipher,
        leftover: buf,
        pending: Vec::new(),
        written: 0,
    })
}

/// Fills `out` from the raw `buf` remainder plus further socket reads,
/// decrypting everything that doesn't come from `buf` (whose prefix is
/// still ciphertext).
async fn read_decrypted<S>(
    socket: &mut S,
    cipher: &mut Rc4,
    buf: &mut Vec<u8>,
    out: &mut [u8],
) -> PeerResult<()>
where
    S: AsyncRead + Unpin,
{
    let from_buf = buf.len().min(out.len());
    out[..from_buf].copy_from_slice(&buf[..from_buf]);
    buf.drain(..from_buf);
    if from_buf < out.len() {
        socket.read_exact(&mut out[from_buf..]).await?;
    }
    cipher.apply(out);
    Ok(())
}

/// A duplex stream with RC4 applied in both directions.
///
/// Writes are encrypted into an internal buffer and drained on flush, so a
/// partial socket write never re-encrypts bytes. Reads decrypt in place.
pub(crate) struct ObfuscatedStream<S> {
    inner: S,
    in_cipher: Rc4,
    out_cipher: Rc4,
    /// Already-decrypted bytes read past the end of the exchange.
    leftover: Vec<u8>,
    /// Encrypted bytes accepted but not yet written to the socket.
    pending: Vec<u8>,
    written: usize,
}

impl<S: AsyncRead + Unpin> AsyncRead for ObfuscatedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.leftover.is_empty() {
            let n = this.leftover.len().min(buf.remaining());
            buf.put_slice(&this.leftover[..n]);
            this.leftover.drain(..n);
            return Poll::Ready(Ok(()));
        }

        let filled_before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                this.in_cipher.apply(&mut buf.filled_mut()[filled_before..]);
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl<S: AsyncWrite + Unpin> ObfuscatedStream<S> {
    fn poll_drain_pending(
        &mut self,
        cx: &mut Context<'_>,
    ) -> Poll<io::Result<()>> {
        while self.written < self.pending.len() {
            let n = futures::ready!(Pin::new(&mut self.inner)
                .poll_write(cx, &self.pending[self.written..]))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.written += n;
        }
        self.pending.clear();
        self.written = 0;
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ObfuscatedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        // bound the buffered ciphertext before accepting more
        if !this.pending.is_empty() {
            futures::ready!(this.poll_drain_pending(cx))?;
        }
        let start = this.pending.len();
        this.pending.extend_from_slice(buf);
        this.out_cipher.apply(&mut this.pending[start..]);
        // best effort immediate write; leftovers drain on flush
        let _ = this.poll_drain_pending(cx)?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        futures::ready!(this.poll_drain_pending(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        futures::ready!(this.poll_drain_pending(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}
