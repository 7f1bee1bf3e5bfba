//! Three-step cryptographic handshake (§4.E): `HANDSHAKE_INIT` →
//! `HANDSHAKE_HELLO` → `HANDSHAKE_WORLD`. Generalizes the shape of the
//! teacher's `rlpx::connection::handshake` (signed hello exchange framed over
//! `RLPxCodec`) to this crate's shared-secret-nonce scheme and
//! `SessionFrameCodec` framing.

use std::time::Duration;

use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use rand::RngCore;
use secp256k1::SecretKey;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use crate::codec::{
    primitive, ParseError, SessionFrame, SessionFrameCodec, DISCONNECT, HANDSHAKE_HELLO,
    HANDSHAKE_INIT, HANDSHAKE_WORLD,
};
use crate::config::Capability;
use crate::conn::error::{ConnError, DisconnectReason};
use crate::crypto;
use crate::types::NodeId;

const TIMESTAMP_SKEW_SECS: u64 = 5 * 60;
const SECRET_LEN: usize = 32;

/// Everything the local side advertises during a handshake, bundled once by
/// the channel manager from `P2PConfig` and the node's signing key.
#[derive(Clone)]
pub struct LocalIdentity {
    pub signer: SecretKey,
    pub network_id: u32,
    pub network_version: u8,
    pub listen_port: u16,
    pub client_id: String,
    pub capabilities: Vec<Capability>,
    pub node_tag: String,
    pub advertised_height: u64,
}

impl LocalIdentity {
    pub fn node_id(&self) -> NodeId {
        crypto::node_id_from_secret(&self.signer)
    }
}

/// A capability as read off the wire: unlike `config::Capability` (whose
/// `name` is a host-supplied `&'static str`), a remote's name is owned data.
#[derive(Debug, Clone)]
pub struct RemoteCapability {
    pub name: String,
    pub version: u8,
}

/// The remote side's identity and advertised state, as validated out of a
/// completed `HANDSHAKE_HELLO`/`HANDSHAKE_WORLD`.
#[derive(Debug, Clone)]
pub struct RemoteIdentity {
    pub peer_id: NodeId,
    pub listen_port: u16,
    pub client_id: String,
    pub capabilities: Vec<RemoteCapability>,
    pub latest_block_number: u64,
    pub node_tag: String,
    pub network_version: u8,
}

struct Payload {
    network_id: u32,
    network_version: u8,
    peer_id: NodeId,
    listen_port: u16,
    client_id: String,
    capabilities: Vec<RemoteCapability>,
    latest_block_number: u64,
    secret: [u8; SECRET_LEN],
    timestamp: u64,
    flags: u8,
    node_tag: String,
}

fn encode_unsigned(p: &Payload, buf: &mut BytesMut) {
    primitive::put_int(buf, p.network_id);
    primitive::put_byte(buf, p.network_version);
    primitive::put_bytes(buf, p.peer_id.as_bytes());
    primitive::put_short(buf, p.listen_port);
    primitive::put_string(buf, &p.client_id);
    primitive::put_byte(buf, p.capabilities.len() as u8);
    for cap in &p.capabilities {
        primitive::put_string(buf, &cap.name);
        primitive::put_byte(buf, cap.version);
    }
    primitive::put_long(buf, p.latest_block_number);
    primitive::put_bytes(buf, &p.secret);
    primitive::put_long(buf, p.timestamp);
    primitive::put_byte(buf, p.flags);
    primitive::put_string(buf, &p.node_tag);
}

fn build_payload(local: &LocalIdentity, secret: [u8; SECRET_LEN]) -> Payload {
    Payload {
        network_id: local.network_id,
        network_version: local.network_version,
        peer_id: local.node_id(),
        listen_port: local.listen_port,
        client_id: local.client_id.clone(),
        capabilities: local
            .capabilities
            .iter()
            .map(|c| RemoteCapability {
                name: c.name.to_string(),
                version: c.version,
            })
            .collect(),
        latest_block_number: local.advertised_height,
        secret,
        timestamp: crate::types::now_unix(),
        flags: 0,
        node_tag: local.node_tag.clone(),
    }
}

fn sign_and_encode(payload: &Payload, signer: &SecretKey) -> BytesMut {
    let mut unsigned = BytesMut::new();
    encode_unsigned(payload, &mut unsigned);
    let digest = crypto::keccak256(&unsigned);
    let signature = crypto::sign_recoverable(signer, &digest);
    primitive::put_bytes(&mut unsigned, &signature);
    unsigned
}

/// Validates a received `HELLO`/`WORLD` payload plus its trailing signature
/// (§4.E Validation): network match, echoed secret, bounded clock skew, and a
/// signature whose recovered address equals the claimed `peer_id`.
fn validate(
    body_without_signature: &[u8],
    signature: &[u8],
    payload: &Payload,
    local: &LocalIdentity,
    expected_secret: &[u8; SECRET_LEN],
) -> Result<(), ConnError> {
    if payload.network_id != local.network_id || payload.network_version != local.network_version
    {
        return Err(ConnError::HandshakeRejected("network id/version mismatch"));
    }
    if &payload.secret != expected_secret {
        return Err(ConnError::HandshakeRejected("secret did not echo"));
    }
    let now = crate::types::now_unix();
    if now.abs_diff(payload.timestamp) > TIMESTAMP_SKEW_SECS {
        return Err(ConnError::HandshakeRejected("timestamp outside skew window"));
    }
    let digest = crypto::keccak256(body_without_signature);
    let recovered =
        crypto::recover_public_key(signature, &digest).map_err(|_| ConnError::BadSignature)?;
    if crypto::node_id_from_public_key(&recovered) != payload.peer_id {
        return Err(ConnError::IdentityMismatch);
    }
    Ok(())
}

fn to_remote_identity(p: Payload) -> RemoteIdentity {
    RemoteIdentity {
        peer_id: p.peer_id,
        listen_port: p.listen_port,
        client_id: p.client_id,
        capabilities: p.capabilities,
        latest_block_number: p.latest_block_number,
        node_tag: p.node_tag,
        network_version: p.network_version,
    }
}

async fn send_frame(
    framed: &mut Framed<TcpStream, SessionFrameCodec>,
    version: u8,
    packet_type: u8,
    body: BytesMut,
) -> Result<(), ConnError> {
    framed
        .send(SessionFrame {
            version,
            packet_type,
            packet_id: 0,
            body: body.freeze(),
        })
        .await
        .map_err(ConnError::from)
}

async fn recv_frame(
    framed: &mut Framed<TcpStream, SessionFrameCodec>,
) -> Result<SessionFrame, ConnError> {
    match framed.next().await {
        Some(Ok(frame)) => Ok(frame),
        Some(Err(e)) => Err(e.into()),
        None => Err(ConnError::Closed),
    }
}

pub async fn send_disconnect(
    framed: &mut Framed<TcpStream, SessionFrameCodec>,
    version: u8,
    reason: DisconnectReason,
) {
    let mut body = BytesMut::new();
    primitive::put_byte(&mut body, reason.into());
    let _ = send_frame(framed, version, DISCONNECT, body).await;
}

/// Decodes every `Payload` field, leaving only the trailing signature bytes
/// in `buf`.
fn decode_payload_prefix(buf: &mut BytesMut) -> Result<Payload, ConnError> {
    let network_id = primitive::get_int(buf, "handshake.network_id")?;
    let network_version = primitive::get_byte(buf, "handshake.network_version")?;
    let peer_id_bytes = primitive::get_bytes(buf, "handshake.peer_id")?;
    if peer_id_bytes.len() != 20 {
        return Err(ConnError::from(ParseError::Truncated("handshake.peer_id")));
    }
    let mut peer_id = [0u8; 20];
    peer_id.copy_from_slice(&peer_id_bytes);
    let listen_port = primitive::get_short(buf, "handshake.listen_port")?;
    let client_id = primitive::get_string(buf, "handshake.client_id")?;
    let cap_count = primitive::get_byte(buf, "handshake.cap_count")?;
    let mut capabilities = Vec::with_capacity(cap_count as usize);
    for _ in 0..cap_count {
        let name = primitive::get_string(buf, "handshake.cap_name")?;
        let version = primitive::get_byte(buf, "handshake.cap_version")?;
        capabilities.push(RemoteCapability { name, version });
    }
    let latest_block_number = primitive::get_long(buf, "handshake.latest_block_number")?;
    let secret_bytes = primitive::get_bytes(buf, "handshake.secret")?;
    if secret_bytes.len() != SECRET_LEN {
        return Err(ConnError::from(ParseError::Truncated("handshake.secret")));
    }
    let mut secret = [0u8; SECRET_LEN];
    secret.copy_from_slice(&secret_bytes);
    let timestamp = primitive::get_long(buf, "handshake.timestamp")?;
    let flags = primitive::get_byte(buf, "handshake.flags")?;
    let node_tag = primitive::get_string(buf, "handshake.node_tag")?;
    Ok(Payload {
        network_id,
        network_version,
        peer_id: NodeId(peer_id),
        listen_port,
        client_id,
        capabilities,
        latest_block_number,
        secret,
        timestamp,
        flags,
        node_tag,
    })
}

async fn recv_payload(
    framed: &mut Framed<TcpStream, SessionFrameCodec>,
    expected_type: u8,
) -> Result<(Payload, Vec<u8>, Vec<u8>), ConnError> {
    let frame = recv_frame(framed).await?;
    if frame.packet_type == DISCONNECT {
        return Err(ConnError::HandshakeRejected("peer disconnected during handshake"));
    }
    if frame.packet_type != expected_type {
        return Err(ConnError::HandshakeRejected("unexpected packet type"));
    }
    let mut buf = BytesMut::from(&frame.body[..]);
    let payload = decode_payload_prefix(&mut buf)?;
    let signature = primitive::get_bytes(&mut buf, "handshake.signature").map_err(ConnError::from)?;
    let unsigned_len = frame.body.len() - 2 - signature.len();
    let unsigned_bytes = frame.body[..unsigned_len].to_vec();
    Ok((payload, signature, unsigned_bytes))
}

async fn recv_init(
    framed: &mut Framed<TcpStream, SessionFrameCodec>,
) -> Result<(u32, u8, [u8; SECRET_LEN]), ConnError> {
    let frame = recv_frame(framed).await?;
    if frame.packet_type != HANDSHAKE_INIT {
        return Err(ConnError::HandshakeRejected("expected HANDSHAKE_INIT"));
    }
    let mut buf = BytesMut::from(&frame.body[..]);
    let network_id = primitive::get_int(&mut buf, "init.network_id")?;
    let network_version = primitive::get_byte(&mut buf, "init.network_version")?;
    let secret_bytes = primitive::get_bytes(&mut buf, "init.secret")?;
    if secret_bytes.len() != SECRET_LEN {
        return Err(ConnError::from(ParseError::Truncated("init.secret")));
    }
    let mut secret = [0u8; SECRET_LEN];
    secret.copy_from_slice(&secret_bytes);
    Ok((network_id, network_version, secret))
}

fn encode_init(network_id: u32, network_version: u8, secret: &[u8; SECRET_LEN]) -> BytesMut {
    let mut buf = BytesMut::new();
    primitive::put_int(&mut buf, network_id);
    primitive::put_byte(&mut buf, network_version);
    primitive::put_bytes(&mut buf, secret);
    buf
}

/// Dials out: sends `HANDSHAKE_INIT`, validates the listener's `HELLO`, and
/// replies with `WORLD`. Bounded by `timeout` end to end (§4.E: 10s).
pub async fn dial(
    stream: TcpStream,
    local: &LocalIdentity,
    timeout: Duration,
) -> Result<(Framed<TcpStream, SessionFrameCodec>, RemoteIdentity), ConnError> {
    tokio::time::timeout(timeout, dial_inner(stream, local))
        .await
        .map_err(|_| ConnError::HandshakeTimeout)?
}

async fn dial_inner(
    stream: TcpStream,
    local: &LocalIdentity,
) -> Result<(Framed<TcpStream, SessionFrameCodec>, RemoteIdentity), ConnError> {
    let mut framed = Framed::new(stream, SessionFrameCodec::new(0));
    let mut secret = [0u8; SECRET_LEN];
    rand::thread_rng().fill_bytes(&mut secret);

    send_frame(
        &mut framed,
        local.network_version,
        HANDSHAKE_INIT,
        encode_init(local.network_id, local.network_version, &secret),
    )
    .await?;

    let (hello, signature, unsigned_bytes) = recv_payload(&mut framed, HANDSHAKE_HELLO).await?;
    validate(&unsigned_bytes, &signature, &hello, local, &secret)?;

    let my_payload = build_payload(local, secret);
    let encoded = sign_and_encode(&my_payload, &local.signer);
    send_frame(&mut framed, local.network_version, HANDSHAKE_WORLD, encoded).await?;

    framed.codec_mut().remote_version = hello.network_version;
    Ok((framed, to_remote_identity(hello)))
}

/// Accepts an inbound stream already past `HANDSHAKE_INIT`: replies `HELLO`
/// and validates the dialer's `WORLD`.
pub async fn accept(
    stream: TcpStream,
    local: &LocalIdentity,
    timeout: Duration,
) -> Result<(Framed<TcpStream, SessionFrameCodec>, RemoteIdentity), ConnError> {
    tokio::time::timeout(timeout, accept_inner(stream, local))
        .await
        .map_err(|_| ConnError::HandshakeTimeout)?
}

async fn accept_inner(
    stream: TcpStream,
    local: &LocalIdentity,
) -> Result<(Framed<TcpStream, SessionFrameCodec>, RemoteIdentity), ConnError> {
    let mut framed = Framed::new(stream, SessionFrameCodec::new(0));
    let (network_id, network_version, secret) = recv_init(&mut framed).await?;
    if network_id != local.network_id || network_version != local.network_version {
        send_disconnect(&mut framed, local.network_version, DisconnectReason::DifferentVersion).await;
        return Err(ConnError::HandshakeRejected("network id/version mismatch"));
    }

    let my_payload = build_payload(local, secret);
    let encoded = sign_and_encode(&my_payload, &local.signer);
    send_frame(&mut framed, local.network_version, HANDSHAKE_HELLO, encoded).await?;

    let (world, signature, unsigned_bytes) = recv_payload(&mut framed, HANDSHAKE_WORLD).await?;
    validate(&unsigned_bytes, &signature, &world, local, &secret)?;

    framed.codec_mut().remote_version = world.network_version;
    Ok((framed, to_remote_identity(world)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};

    fn identity(port: u16) -> LocalIdentity {
        LocalIdentity {
            signer: SecretKey::new(&mut rand::rngs::OsRng),
            network_id: 7,
            network_version: 1,
            listen_port: port,
            client_id: "kadlink/test".to_string(),
            capabilities: vec![Capability {
                name: "eth",
                version: 1,
            }],
            node_tag: "t1".to_string(),
            advertised_height: 42,
        }
    }

    #[tokio::test]
    async fn successful_handshake_exchanges_identities() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let dialer_identity = identity(1);
        let listener_identity = identity(2);
        let expected_dialer_id = dialer_identity.node_id();
        let expected_listener_id = listener_identity.node_id();

        let accept_task = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            accept(stream, &listener_identity, Duration::from_secs(2))
                .await
                .unwrap()
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let (_, remote_from_dialer) = dial(stream, &dialer_identity, Duration::from_secs(2))
            .await
            .unwrap();
        let (_, remote_from_listener) = accept_task.await.unwrap();

        assert_eq!(remote_from_dialer.peer_id, expected_listener_id);
        assert_eq!(remote_from_listener.peer_id, expected_dialer_id);
        assert_eq!(remote_from_dialer.node_tag, "t1");
    }

    #[tokio::test]
    async fn network_id_mismatch_is_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut dialer_identity = identity(1);
        dialer_identity.network_id = 999;
        let listener_identity = identity(2);

        let accept_task = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            accept(stream, &listener_identity, Duration::from_secs(2)).await
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let dial_result = dial(stream, &dialer_identity, Duration::from_secs(2)).await;
        assert!(dial_result.is_err());
        assert!(accept_task.await.unwrap().is_err());
    }
}
