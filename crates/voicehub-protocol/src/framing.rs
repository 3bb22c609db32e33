use bytes::{Buf, BytesMut};

use crate::error::ProtocolError;
use crate::messages::{ClientMessage, ServerMessage};

/// Hard cap on a single control frame. Control messages are tiny; a
/// buffer that grows past this without a newline is not speaking the
/// protocol.
pub const MAX_FRAME_SIZE: usize = 65_536;

/// Frame separator on the control plane.
pub const FRAME_DELIMITER: u8 = b'\n';

/// Encode a server message as one clear wire frame: compact JSON plus
/// the trailing newline.
pub fn encode_clear(msg: &ServerMessage) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = serde_json::to_vec(msg)?;
    buf.push(FRAME_DELIMITER);
    Ok(buf)
}

/// Encode a client message as one clear wire frame.
pub fn encode_client_clear(msg: &ClientMessage) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = serde_json::to_vec(msg)?;
    buf.push(FRAME_DELIMITER);
    Ok(buf)
}

/// Parse a frame payload (newline already stripped) as a client message.
pub fn decode_client_frame(payload: &[u8]) -> Result<ClientMessage, ProtocolError> {
    Ok(serde_json::from_slice(payload)?)
}

/// Parse a frame payload as a server message.
pub fn decode_server_frame(payload: &[u8]) -> Result<ServerMessage, ProtocolError> {
    Ok(serde_json::from_slice(payload)?)
}

/// Attempt to split one newline-delimited frame off the front of `buf`.
///
/// Returns `Ok(Some(payload))` with the delimiter stripped,
/// `Ok(None)` if no complete frame is buffered yet, or an error when
/// the buffer exceeds [`MAX_FRAME_SIZE`] without a delimiter.
///
/// Splitting happens before any base64 or decryption attempt: base64
/// never contains `\n`, so an encrypted frame is always exactly one
/// line.
pub fn try_split_frame(buf: &mut BytesMut) -> Result<Option<Vec<u8>>, ProtocolError> {
    match buf.iter().position(|&b| b == FRAME_DELIMITER) {
        Some(pos) => {
            let payload = buf.split_to(pos).to_vec();
            buf.advance(1); // the delimiter itself
            Ok(Some(payload))
        }
        None if buf.len() > MAX_FRAME_SIZE => Err(ProtocolError::FrameTooLarge(buf.len())),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_clear_frame() {
        let frame = encode_clear(&ServerMessage::RegisterSuccess).unwrap();
        assert_eq!(*frame.last().unwrap(), b'\n');
        let decoded = decode_server_frame(&frame[..frame.len() - 1]).unwrap();
        assert!(matches!(decoded, ServerMessage::RegisterSuccess));
    }

    #[test]
    fn split_waits_for_delimiter() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"{\"type\":\"get_chan");
        assert!(try_split_frame(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"nels\"}\n");
        let payload = try_split_frame(&mut buf).unwrap().unwrap();
        let msg = decode_client_frame(&payload).unwrap();
        assert!(matches!(msg, ClientMessage::GetChannels));
        assert!(buf.is_empty());
    }

    #[test]
    fn split_multiple_frames() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"{\"type\":\"leave_channel\"}\n{\"type\":\"get_channels\"}\n");

        let first = try_split_frame(&mut buf).unwrap().unwrap();
        assert!(matches!(
            decode_client_frame(&first).unwrap(),
            ClientMessage::LeaveChannel
        ));
        let second = try_split_frame(&mut buf).unwrap().unwrap();
        assert!(matches!(
            decode_client_frame(&second).unwrap(),
            ClientMessage::GetChannels
        ));
        assert!(try_split_frame(&mut buf).unwrap().is_none());
    }

    #[test]
    fn split_empty_frame() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"\n");
        let payload = try_split_frame(&mut buf).unwrap().unwrap();
        assert!(payload.is_empty());
    }

    #[test]
    fn oversized_buffer_rejected() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&vec![b'x'; MAX_FRAME_SIZE + 1]);
        assert!(matches!(
            try_split_frame(&mut buf),
            Err(ProtocolError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn client_frame_roundtrip() {
        let frame = encode_client_clear(&ClientMessage::JoinChannel {
            channel: "General".into(),
        })
        .unwrap();
        let mut buf = BytesMut::from(&frame[..]);
        let payload = try_split_frame(&mut buf).unwrap().unwrap();
        assert!(matches!(
            decode_client_frame(&payload).unwrap(),
            ClientMessage::JoinChannel { channel } if channel == "General"
        ));
    }
}
