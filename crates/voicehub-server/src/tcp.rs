use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::Result;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use voicehub_crypto::{generate_key, generate_token, KEY_LEN};
use voicehub_protocol::framing::{decode_client_frame, encode_clear, try_split_frame};
use voicehub_protocol::messages::{ClientMessage, ServerMessage};

use crate::state::{ConnId, ServerState};
use crate::store::{RegisterOutcome, UserType};

/// Random token length for session ids; the id itself is its hex.
const SESSION_TOKEN_LEN: usize = 32;

/// Handle a single control connection from accept to teardown.
pub async fn handle_connection(stream: TcpStream, state: Arc<ServerState>) {
    let peer_addr = match stream.peer_addr() {
        Ok(addr) => addr,
        Err(_) => return,
    };
    let (mut read_half, mut write_half) = stream.into_split();

    // Writer task: everything this connection receives funnels
    // through one mpsc channel, keeping frame boundaries intact.
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(64);
    let writer_handle = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = write_half.write_all(&frame).await {
                error!("control write error: {}", e);
                break;
            }
        }
    });

    let conn_id = state.register_connection(peer_addr, tx.clone());
    info!(peer = %peer_addr, conn_id, "new control connection");

    // Greet with the channel list so clients can render rooms before
    // logging in.
    let channels = state.snapshot_list().await;
    let _ = send_clear(&tx, &ServerMessage::ChannelList { channels }).await;

    let mut buf = BytesMut::with_capacity(4096);
    'conn: loop {
        match read_half.read_buf(&mut buf).await {
            Ok(0) => {
                info!(conn_id, "client disconnected");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(conn_id, "control read error: {}", e);
                break;
            }
        }

        // Newline framing happens before any base64/decrypt attempt;
        // an envelope frame is always exactly one line.
        loop {
            match try_split_frame(&mut buf) {
                Ok(Some(payload)) => {
                    let Some(msg) = decode_frame(&state, conn_id, &payload).await else {
                        continue;
                    };
                    if let Err(e) = handle_message(&state, conn_id, msg, &tx).await {
                        warn!(conn_id, "error handling message: {}", e);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(conn_id, "dropping connection: {}", e);
                    break 'conn;
                }
            }
        }
    }

    cleanup_connection(&state, conn_id).await;
    writer_handle.abort();
}

/// Decode one framed payload using the connection's session key, if any.
async fn decode_frame(
    state: &ServerState,
    conn_id: ConnId,
    payload: &[u8],
) -> Option<ClientMessage> {
    let key = session_key_of(state, conn_id).await;
    parse_control_frame(payload, key.as_ref())
}

/// Decode a single control frame.
///
/// An authenticated connection may send the base64 of a sealed
/// envelope; a failed decrypt discards the frame. Clear JSON is
/// accepted from anyone (pre-auth traffic, and clients that skip the
/// envelope). Anything else is dropped without a reply.
fn parse_control_frame(payload: &[u8], key: Option<&[u8; KEY_LEN]>) -> Option<ClientMessage> {
    if let Some(key) = key {
        if let Ok(blob) = BASE64.decode(payload) {
            if !blob.is_empty() {
                return voicehub_crypto::open(&blob, key)
                    .ok()
                    .and_then(|plaintext| decode_client_frame(&plaintext).ok());
            }
        }
    }
    decode_client_frame(payload).ok()
}

/// Dispatch one decoded message. Channel operations require a live
/// session; everything else about an unauthorized request is ignored.
async fn handle_message(
    state: &Arc<ServerState>,
    conn_id: ConnId,
    msg: ClientMessage,
    tx: &mpsc::Sender<Vec<u8>>,
) -> Result<()> {
    match msg {
        ClientMessage::Register {
            username,
            password_hash,
        } => handle_register(state, conn_id, username, password_hash, tx).await,
        ClientMessage::Login {
            username,
            password_hash,
            udp_ip,
            udp_port,
        } => handle_login(state, conn_id, username, password_hash, udp_ip, udp_port, tx).await,
        ClientMessage::JoinChannel { channel } => {
            if !is_authenticated(state, conn_id) {
                return reply(state, conn_id, tx, &error_msg("Authentication required")).await;
            }
            handle_join_channel(state, conn_id, channel, tx).await
        }
        ClientMessage::LeaveChannel => {
            if !is_authenticated(state, conn_id) {
                return reply(state, conn_id, tx, &error_msg("Authentication required")).await;
            }
            handle_leave_channel(state, conn_id, tx).await
        }
        ClientMessage::GetChannels => {
            if !is_authenticated(state, conn_id) {
                return reply(state, conn_id, tx, &error_msg("Authentication required")).await;
            }
            let channels = state.snapshot_list().await;
            reply(state, conn_id, tx, &ServerMessage::ChannelList { channels }).await
        }
    }
}

/// Create an account. Allowed before or after login; a register on a
/// live session leaves that session untouched.
async fn handle_register(
    state: &Arc<ServerState>,
    conn_id: ConnId,
    username: String,
    password_hash: String,
    tx: &mpsc::Sender<Vec<u8>>,
) -> Result<()> {
    let response = match decode_hash_hex(&password_hash) {
        None => error_msg("Invalid username or password"),
        Some(hash) => {
            let outcome = state
                .store
                .lock()
                .await
                .register(&username, &hash, UserType::User);
            match outcome {
                Ok(RegisterOutcome::Ok) => ServerMessage::RegisterSuccess,
                Ok(RegisterOutcome::BadInput) => error_msg("Invalid username or password"),
                Ok(RegisterOutcome::Exists) => {
                    error_msg("Registration failed - user may already exist")
                }
                Err(e) => {
                    error!(%username, "registration failed: {}", e);
                    error_msg("Registration failed - user may already exist")
                }
            }
        }
    };
    reply(state, conn_id, tx, &response).await
}

/// Authenticate, mint a session, and record the voice endpoint.
async fn handle_login(
    state: &Arc<ServerState>,
    conn_id: ConnId,
    username: String,
    password_hash: String,
    udp_ip: String,
    udp_port: u16,
    tx: &mpsc::Sender<Vec<u8>>,
) -> Result<()> {
    if is_authenticated(state, conn_id) {
        return reply(state, conn_id, tx, &error_msg("Already logged in")).await;
    }
    let Some(hash) = decode_hash_hex(&password_hash) else {
        return reply(
            state,
            conn_id,
            tx,
            &error_msg("Authentication failed - invalid credentials"),
        )
        .await;
    };
    let Ok(ip) = udp_ip.parse::<IpAddr>() else {
        return reply(state, conn_id, tx, &error_msg("Invalid UDP endpoint")).await;
    };

    let (session_id, session_key) = {
        let mut store = state.store.lock().await;
        if !store.authenticate(&username, &hash) {
            drop(store);
            return reply(
                state,
                conn_id,
                tx,
                &error_msg("Authentication failed - invalid credentials"),
            )
            .await;
        }
        let token = generate_token(SESSION_TOKEN_LEN);
        let session_id = store.create_session(&username, &token);
        let session_key = generate_key();
        store.set_session_key(&session_id, session_key);
        (session_id, session_key)
    };

    let endpoint = SocketAddr::new(ip, udp_port);
    match state.connections.get_mut(&conn_id) {
        Some(mut conn) => {
            conn.authenticated = true;
            conn.username = username.clone();
            conn.session_id = session_id.clone();
            conn.udp_endpoint = Some(endpoint);
        }
        None => {
            // The socket died mid-login; the session goes with it.
            state.store.lock().await.remove_session(&session_id);
            return Ok(());
        }
    }
    state.endpoint_to_conn.insert(endpoint, conn_id);

    info!(conn_id, %username, voice = %endpoint, "user logged in");

    // Clear on purpose: the client cannot open anything sealed until
    // it has this session key.
    send_clear(
        tx,
        &ServerMessage::LoginSuccess {
            voice_port: state.voice_port,
            session_id,
            session_key: hex::encode(session_key),
        },
    )
    .await
}

/// Move the connection into a channel, leaving its current one first.
async fn handle_join_channel(
    state: &Arc<ServerState>,
    conn_id: ConnId,
    channel: String,
    tx: &mpsc::Sender<Vec<u8>>,
) -> Result<()> {
    if channel.is_empty() {
        return reply(state, conn_id, tx, &error_msg("Invalid channel name")).await;
    }
    let username = username_of(state, conn_id);

    if let Some((old_channel, remaining)) = state.leave_current_channel(conn_id).await {
        broadcast_clear(
            state,
            &remaining,
            &ServerMessage::UserLeft {
                username: username.clone(),
            },
        )
        .await;
        info!(conn_id, %username, channel = %old_channel, "left channel");
    }

    let channel_key = state.ensure_channel(&channel).await;
    let others = state.join_channel(conn_id, &channel).await;

    // The channel key rides inside the sealed reply; it never crosses
    // the wire in the clear.
    reply(
        state,
        conn_id,
        tx,
        &ServerMessage::JoinSuccess {
            channel: channel.clone(),
            channel_key: hex::encode(channel_key),
        },
    )
    .await?;

    let users = state.member_usernames(&channel).await;
    send_clear(
        tx,
        &ServerMessage::UserList {
            channel: channel.clone(),
            users,
        },
    )
    .await?;

    broadcast_clear(
        state,
        &others,
        &ServerMessage::UserJoined {
            username: username.clone(),
        },
    )
    .await;

    info!(conn_id, %username, %channel, "joined channel");
    Ok(())
}

/// Leave the current channel. Not being in one is a no-op.
async fn handle_leave_channel(
    state: &Arc<ServerState>,
    conn_id: ConnId,
    tx: &mpsc::Sender<Vec<u8>>,
) -> Result<()> {
    let username = username_of(state, conn_id);
    let Some((channel, remaining)) = state.leave_current_channel(conn_id).await else {
        return Ok(());
    };

    broadcast_clear(
        state,
        &remaining,
        &ServerMessage::UserLeft {
            username: username.clone(),
        },
    )
    .await;
    info!(conn_id, %username, %channel, "left channel");

    reply(state, conn_id, tx, &ServerMessage::LeaveSuccess).await
}

/// Tear down everything a connection owns: channel membership (with
/// the user_left broadcast), the session, the endpoint mapping, and
/// the record itself.
async fn cleanup_connection(state: &Arc<ServerState>, conn_id: ConnId) {
    let username = username_of(state, conn_id);
    if let Some((channel, remaining)) = state.leave_current_channel(conn_id).await {
        broadcast_clear(state, &remaining, &ServerMessage::UserLeft { username }).await;
        info!(conn_id, %channel, "left channel on disconnect");
    }

    if let Some(conn) = state.remove_connection(conn_id) {
        if !conn.session_id.is_empty() {
            state.store.lock().await.remove_session(&conn.session_id);
        }
        info!(conn_id, peer = %conn.peer_addr, "connection cleaned up");
    }
}

// ── Send helpers ───────────────────────────────────────────────────

/// Reply to the originating connection: sealed once a session key
/// exists, clear before login.
async fn reply(
    state: &ServerState,
    conn_id: ConnId,
    tx: &mpsc::Sender<Vec<u8>>,
    msg: &ServerMessage,
) -> Result<()> {
    let frame = match session_key_of(state, conn_id).await {
        Some(key) => seal_frame(msg, &key)?,
        None => encode_clear(msg)?,
    };
    send_frame(tx, frame).await
}

/// Compact JSON, sealed under `key`, base64-armored, newline-framed.
fn seal_frame(msg: &ServerMessage, key: &[u8; KEY_LEN]) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(msg)?;
    let mut frame = BASE64.encode(voicehub_crypto::seal(&json, key)).into_bytes();
    frame.push(b'\n');
    Ok(frame)
}

async fn send_clear(tx: &mpsc::Sender<Vec<u8>>, msg: &ServerMessage) -> Result<()> {
    send_frame(tx, encode_clear(msg)?).await
}

async fn send_frame(tx: &mpsc::Sender<Vec<u8>>, frame: Vec<u8>) -> Result<()> {
    tx.send(frame)
        .await
        .map_err(|_| anyhow::anyhow!("control send channel closed"))
}

/// Write a clear frame to each listed connection. Failed sends are
/// swallowed; the receiver's own teardown path owns cleanup.
async fn broadcast_clear(state: &ServerState, targets: &[ConnId], msg: &ServerMessage) {
    let Ok(frame) = encode_clear(msg) else {
        return;
    };
    for &cid in targets {
        let tx = state.connections.get(&cid).map(|c| c.tcp_tx.clone());
        if let Some(tx) = tx {
            let _ = tx.send(frame.clone()).await;
        }
    }
}

// ── Lookups ────────────────────────────────────────────────────────

async fn session_key_of(state: &ServerState, conn_id: ConnId) -> Option<[u8; KEY_LEN]> {
    let session_id = {
        let conn = state.connections.get(&conn_id)?;
        if !conn.authenticated || conn.session_id.is_empty() {
            return None;
        }
        conn.session_id.clone()
    };
    state.store.lock().await.session_key(&session_id)
}

fn is_authenticated(state: &ServerState, conn_id: ConnId) -> bool {
    state
        .connections
        .get(&conn_id)
        .map(|c| c.authenticated)
        .unwrap_or(false)
}

fn username_of(state: &ServerState, conn_id: ConnId) -> String {
    state
        .connections
        .get(&conn_id)
        .map(|c| c.username.clone())
        .unwrap_or_default()
}

fn error_msg(message: &str) -> ServerMessage {
    ServerMessage::Error {
        message: message.into(),
    }
}

fn decode_hash_hex(hash_hex: &str) -> Option<[u8; 32]> {
    hex::decode(hash_hex).ok()?.try_into().ok()
}
