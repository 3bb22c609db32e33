// Quick integration check: connect to a running server, register,
// log in, join General, and fire one voice datagram.
// Run with: cargo run -p voicehub-server --example test_client

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;

use voicehub_crypto::{counter_crypt, hash_password, KEY_LEN};
use voicehub_protocol::framing::{decode_server_frame, encode_client_clear, try_split_frame};
use voicehub_protocol::messages::{ClientMessage, ServerMessage};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut tcp = TcpStream::connect("127.0.0.1:8888").await?;
    println!("[OK] connected to 127.0.0.1:8888");

    let udp = UdpSocket::bind("127.0.0.1:0").await?;
    let udp_addr = udp.local_addr()?;

    let mut buf = BytesMut::with_capacity(4096);

    // The server greets with the channel list before login.
    let greeting = read_message(&mut tcp, &mut buf, None).await?;
    println!("[OK] greeting: {greeting:?}");

    let password_hash = hex::encode(hash_password("test_pass"));

    send_clear(
        &mut tcp,
        &ClientMessage::Register {
            username: "test_user".into(),
            password_hash: password_hash.clone(),
        },
    )
    .await?;
    // An "already exists" error just means a previous run got here first.
    let reply = read_message(&mut tcp, &mut buf, None).await?;
    println!("[OK] register reply: {reply:?}");

    send_clear(
        &mut tcp,
        &ClientMessage::Login {
            username: "test_user".into(),
            password_hash,
            udp_ip: udp_addr.ip().to_string(),
            udp_port: udp_addr.port(),
        },
    )
    .await?;

    let (voice_port, session_key) = match read_message(&mut tcp, &mut buf, None).await? {
        ServerMessage::LoginSuccess {
            voice_port,
            session_id,
            session_key: key_hex,
        } => {
            let key: [u8; KEY_LEN] = hex::decode(&key_hex)?
                .try_into()
                .map_err(|_| "session key is not 32 bytes")?;
            println!("[OK] logged in, session {}...", &session_id[..16]);
            (voice_port, key)
        }
        other => return Err(format!("expected login_success, got {other:?}").into()),
    };

    // Post-login requests ride inside the envelope.
    send_sealed(
        &mut tcp,
        &ClientMessage::JoinChannel {
            channel: "General".into(),
        },
        &session_key,
    )
    .await?;

    let channel_key = match read_message(&mut tcp, &mut buf, Some(&session_key)).await? {
        ServerMessage::JoinSuccess {
            channel,
            channel_key,
        } => {
            let key: [u8; KEY_LEN] = hex::decode(&channel_key)?
                .try_into()
                .map_err(|_| "channel key is not 32 bytes")?;
            println!("[OK] joined {channel}");
            key
        }
        other => return Err(format!("expected join_success, got {other:?}").into()),
    };

    let user_list = read_message(&mut tcp, &mut buf, Some(&session_key)).await?;
    println!("[OK] user list: {user_list:?}");

    // One encrypted voice frame: counter || AES-256-CTR(payload).
    let counter: u64 = 1;
    let mut datagram = counter.to_be_bytes().to_vec();
    datagram.extend_from_slice(&counter_crypt(b"not really opus", &channel_key, counter));
    udp.send_to(&datagram, ("127.0.0.1", voice_port)).await?;
    println!("[OK] sent a voice datagram to port {voice_port}");

    Ok(())
}

async fn send_clear(
    tcp: &mut TcpStream,
    msg: &ClientMessage,
) -> Result<(), Box<dyn std::error::Error>> {
    tcp.write_all(&encode_client_clear(msg)?).await?;
    Ok(())
}

async fn send_sealed(
    tcp: &mut TcpStream,
    msg: &ClientMessage,
    key: &[u8; KEY_LEN],
) -> Result<(), Box<dyn std::error::Error>> {
    let json = serde_json::to_vec(msg)?;
    let mut frame = BASE64
        .encode(voicehub_crypto::seal(&json, key))
        .into_bytes();
    frame.push(b'\n');
    tcp.write_all(&frame).await?;
    Ok(())
}

/// Read frames until one parses as a server message, trying the
/// envelope first when a session key is available.
async fn read_message(
    tcp: &mut TcpStream,
    buf: &mut BytesMut,
    key: Option<&[u8; KEY_LEN]>,
) -> Result<ServerMessage, Box<dyn std::error::Error>> {
    loop {
        if let Some(payload) = try_split_frame(buf)? {
            if let Some(msg) = parse_frame(&payload, key) {
                return Ok(msg);
            }
            continue;
        }
        let n = timeout(Duration::from_secs(5), tcp.read_buf(buf)).await??;
        if n == 0 {
            return Err("server closed the connection".into());
        }
    }
}

fn parse_frame(payload: &[u8], key: Option<&[u8; KEY_LEN]>) -> Option<ServerMessage> {
    if let Some(key) = key {
        if let Ok(blob) = BASE64.decode(payload) {
            if let Ok(plaintext) = voicehub_crypto::open(&blob, key) {
                return decode_server_frame(&plaintext).ok();
            }
        }
    }
    decode_server_frame(payload).ok()
}
