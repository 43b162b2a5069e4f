// Wire protocol through the public API

use yggdrasil_node::core::checksum;
use yggdrasil_node::error::{ConnectionError, ProtocolError};
use yggdrasil_node::network::{read_message, DataMessage, Frame, GetDataMessage};
use yggdrasil_node::{Block, Message, NetworkType, Payload, RequestType};

#[test]
fn test_ping_frame_round_trip() {
    let bytes = Message::new(NetworkType::Main, Payload::Ping).encode().unwrap();
    let message = Message::decode(&bytes).unwrap();

    assert_eq!(message.request_type(), RequestType::Ping);
    assert_eq!(message.request_type().code(), *b"PING");
    assert!(message.payload.serialize().is_empty());
}

#[test]
fn test_checksum_mismatch_rejects_whole_frame() {
    let blocks = vec![Block::genesis()];
    let mut frame = Message::new(NetworkType::Test, Payload::Data(DataMessage::Blocks(blocks)))
        .to_frame()
        .unwrap();
    frame.checksum = checksum(b"something else");

    assert_eq!(
        Message::decode(&frame.encode()),
        Err(ProtocolError::ChecksumMismatch)
    );
}

#[test]
fn test_frame_layout() {
    let message = Message::new(
        NetworkType::Test,
        Payload::GetData(GetDataMessage::mempool(25)),
    );
    let bytes = message.encode().unwrap();
    let frame = Frame::parse(&bytes).unwrap();

    assert_eq!(&bytes[..4], b"TEST");
    assert_eq!(&bytes[4..8], b"GDAT");
    assert_eq!(bytes[8] as usize, frame.payload.len());
    assert_eq!(frame.checksum, checksum(&frame.payload));
    assert_eq!(Message::from_frame(&frame).unwrap(), message);
}

#[tokio::test]
async fn test_stream_of_frames() {
    let messages = [
        Message::new(NetworkType::Main, Payload::GetAddresses),
        Message::new(NetworkType::Main, Payload::Data(DataMessage::Blocks(vec![Block::genesis()]))),
        Message::new(NetworkType::Main, Payload::Pong),
    ];
    let mut stream = Vec::new();
    for message in &messages {
        stream.extend(message.encode().unwrap());
    }

    let mut reader: &[u8] = &stream;
    for expected in &messages {
        assert_eq!(&read_message(&mut reader, NetworkType::Main).await.unwrap(), expected);
    }
    assert!(matches!(
        read_message(&mut reader, NetworkType::Main).await,
        Err(ConnectionError::Closed)
    ));
}
