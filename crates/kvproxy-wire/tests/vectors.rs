use bytes::Bytes;
use kvproxy_wire::{CallRequest, CallResponse, Frame, InlinePolicy, Message};

struct Vector {
    name: &'static str,
    frame_hex: &'static str,
    message: fn() -> Message,
}

const VECTORS: &[Vector] = &[
    Vector {
        name: "stream_open_get",
        frame_hex: "4b56503100010001000000050003476574",
        message: || Message::StreamOpen {
            method: "Get".to_string(),
        },
    },
    Vector {
        name: "request_first_id",
        frame_hex: concat!(
            "4b565031", "0001", "0002", "00000016", "00000000", "00000001", "000003e8", "00000000",
            "00000002", "6162"
        ),
        message: || {
            Message::Request(CallRequest {
                id: 0,
                iteration: 1,
                policy: InlinePolicy {
                    timeout_ms: 1000,
                    attrs: 0,
                },
                payload: Bytes::from_static(b"ab"),
            })
        },
    },
    Vector {
        name: "response_ok",
        frame_hex: concat!(
            "4b565031", "0001", "0004", "0000000c", "00000003", "0000", "00000002", "6f6b"
        ),
        message: || Message::Response(CallResponse::ok(3, Bytes::from_static(b"ok"))),
    },
];

#[test]
fn vectors_match_frame_encoding() {
    for vector in VECTORS {
        let expected = Bytes::from(hex_to_bytes(vector.frame_hex));
        let message = (vector.message)();

        let encoded = message.encode_bytes().expect("encode");
        assert_eq!(
            encoded.as_ref(),
            expected.as_ref(),
            "frame mismatch for {}",
            vector.name
        );

        let frame = Frame::decode(expected.clone()).expect("frame decode");
        let decoded = Message::decode(frame).expect("message decode");
        assert_eq!(decoded, message, "decode mismatch for {}", vector.name);
    }
}

fn hex_to_bytes(hex: &str) -> Vec<u8> {
    assert!(hex.len().is_multiple_of(2), "hex length must be even");
    hex.as_bytes()
        .chunks(2)
        .map(|pair| {
            let hi = from_hex_char(pair[0]) << 4;
            let lo = from_hex_char(pair[1]);
            hi | lo
        })
        .collect()
}

fn from_hex_char(c: u8) -> u8 {
    match c {
        b'0'..=b'9' => c - b'0',
        b'a'..=b'f' => c - b'a' + 10,
        b'A'..=b'F' => c - b'A' + 10,
        _ => panic!("invalid hex char"),
    }
}
