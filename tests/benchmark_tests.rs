//! Performance benchmarks for the hot paths of the session engine

use shared::fragment::{split, Reassembler};
use shared::{
    decode, encode, AckHeader, ChannelAck, ChannelKind, Multiplexer, MuxConfig, Packet,
    PacketBody, PayloadPacket, SessionId, SessionTag,
};
use std::time::{Duration, Instant};

fn tag() -> SessionTag {
    SessionTag {
        id: SessionId(1),
        token: 0xfeed,
    }
}

/// Benchmarks encoding and decoding of a full-size payload packet
#[test]
fn benchmark_packet_codec() {
    let packet = Packet::new(
        Some(tag()),
        PacketBody::Payload(PayloadPacket {
            channel: ChannelKind::ReliableOrdered,
            sequence: 42,
            ack: Some(ChannelAck {
                channel: ChannelKind::ReliableOrdered,
                ack: AckHeader {
                    ack: 17,
                    bits: 0xdead_beef,
                },
            }),
            fragment: None,
            data: vec![7; 1024],
        }),
    );

    let iterations = 10_000;
    let start = Instant::now();

    for _ in 0..iterations {
        let bytes = encode(&packet).unwrap();
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded.header.session, Some(tag()));
    }

    let duration = start.elapsed();
    println!(
        "Packet codec: {} round trips in {:?} ({:.2} μs/iter)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    assert!(duration.as_secs() < 5);
}

/// Benchmarks splitting and reassembling maximum-size messages
#[test]
fn benchmark_fragment_reassembly() {
    let config = MuxConfig::default();
    let message = vec![0xab; config.max_message_size];
    let mut reassembler = Reassembler::new(config.fragment_size, config.max_message_size, 8);

    let iterations = 500;
    let start = Instant::now();

    for id in 0..iterations {
        let mut complete = None;
        // Reverse order keeps every message partial until its first fragment lands
        for chunk in split(id as u16, &message, config.fragment_size).into_iter().rev() {
            let header = chunk.fragment.unwrap();
            complete = reassembler.insert(header, chunk.data).unwrap();
        }
        assert_eq!(complete.map(|m| m.len()), Some(message.len()));
    }

    let duration = start.elapsed();
    println!(
        "Fragment reassembly: {} x {} KiB messages in {:?} ({:.2} μs/message)",
        iterations,
        message.len() / 1024,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    assert!(reassembler.is_empty());
    assert!(duration.as_secs() < 5);
}

/// Benchmarks a lossless reliable transfer between two multiplexers
#[test]
fn benchmark_reliable_transfer() {
    let mut sender = Multiplexer::new(MuxConfig::default());
    let mut receiver = Multiplexer::new(MuxConfig::default());
    let mut now = Instant::now();

    let messages = 20_000;
    let start = Instant::now();
    let mut delivered = 0;

    for i in 0..messages {
        let payload = (i as u32).to_le_bytes();
        sender.send(ChannelKind::ReliableOrdered, &payload).unwrap();

        if i % 64 == 63 || i == messages - 1 {
            while sender.has_pending_reliable() {
                for body in sender.poll_transmit(now).unwrap() {
                    if let PacketBody::Payload(packet) = body {
                        receiver.receive_payload(packet);
                    }
                }
                delivered += receiver.drain_delivered().count();
                for body in receiver.poll_transmit(now).unwrap() {
                    if let PacketBody::Ack { channel, ack } = body {
                        sender.receive_ack(channel, ack);
                    }
                }
                now += Duration::from_millis(16);
            }
        }
    }

    let duration = start.elapsed();
    println!(
        "Reliable transfer: {} messages in {:?} ({:.2} μs/message)",
        messages,
        duration,
        duration.as_micros() as f64 / messages as f64
    );

    assert_eq!(delivered, messages);
    assert_eq!(sender.stats().retransmits, 0);
    assert!(duration.as_secs() < 10);
}
