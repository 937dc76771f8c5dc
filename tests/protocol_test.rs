use bytes::{Bytes, BytesMut};
use gear_pool::proto::{self, Magic, Packet, ProtocolError};
use proptest::prelude::*;

fn text() -> impl Strategy<Value = String> {
    "[A-Za-z0-9:_.-]{1,24}"
}

fn payload() -> impl Strategy<Value = Bytes> {
    proptest::collection::vec(any::<u8>(), 0..256).prop_map(Bytes::from)
}

fn packet() -> impl Strategy<Value = Packet> {
    prop_oneof![
        text().prop_map(|function| Packet::CanDo { function }),
        (text(), any::<u32>()).prop_map(|(function, timeout)| Packet::CanDoTimeout { function, timeout }),
        Just(Packet::PreSleep),
        Just(Packet::Noop),
        Just(Packet::GrabJobUniq),
        Just(Packet::NoJob),
        (text(), text(), payload()).prop_map(|(function, unique, payload)| Packet::SubmitJob {
            function,
            unique,
            payload
        }),
        text().prop_map(|handle| Packet::JobCreated { handle }),
        (text(), text(), text(), payload()).prop_map(|(handle, function, unique, payload)| {
            Packet::JobAssignUniq {
                handle,
                function,
                unique,
                payload,
            }
        }),
        (text(), any::<u32>(), any::<u32>()).prop_map(|(handle, numerator, denominator)| Packet::WorkStatus {
            handle,
            numerator,
            denominator
        }),
        (text(), payload()).prop_map(|(handle, payload)| Packet::WorkComplete { handle, payload }),
        text().prop_map(|handle| Packet::WorkFail { handle }),
        (text(), any::<bool>(), any::<bool>(), any::<u32>(), any::<u32>()).prop_map(
            |(handle, known, running, numerator, denominator)| Packet::StatusRes {
                handle,
                known,
                running,
                numerator,
                denominator
            }
        ),
        payload().prop_map(|payload| Packet::EchoReq { payload }),
    ]
}

proptest! {
    /// 任意切分的字节流都能按原顺序解出全部帧
    #[test]
    fn decode_survives_arbitrary_chunking(
        packets in proptest::collection::vec(packet(), 1..8),
        cuts in proptest::collection::vec(1usize..64, 1..32),
    ) {
        let mut wire = BytesMut::new();
        for packet in &packets {
            proto::encode(Magic::Res, packet, &mut wire);
        }
        let wire = wire.freeze();

        let mut buf = BytesMut::new();
        let mut decoded = Vec::new();
        let mut offset = 0;
        let mut cut = cuts.iter().cycle();
        while offset < wire.len() {
            let step = (*cut.next().unwrap()).min(wire.len() - offset);
            buf.extend_from_slice(&wire[offset..offset + step]);
            offset += step;
            while let Some((magic, packet)) = proto::decode(&mut buf).unwrap() {
                prop_assert_eq!(magic, Magic::Res);
                decoded.push(packet);
            }
        }

        prop_assert!(buf.is_empty());
        prop_assert_eq!(decoded, packets);
    }
}

#[test]
fn test_submit_job_matches_gearman_layout() {
    let packet = Packet::SubmitJob {
        function: "ToUpper".into(),
        unique: "u1".into(),
        payload: Bytes::from_static(b"arbitrary binary data"),
    };
    let frame = proto::encode_to_bytes(Magic::Req, &packet);

    let mut expected = Vec::new();
    expected.extend_from_slice(b"\0REQ");
    expected.extend_from_slice(&7u32.to_be_bytes());
    let body = b"ToUpper\0u1\0arbitrary binary data";
    expected.extend_from_slice(&(body.len() as u32).to_be_bytes());
    expected.extend_from_slice(body);

    assert_eq!(&frame[..], &expected[..]);
}

#[test]
fn test_decode_gearmand_status_res() {
    let mut raw = BytesMut::new();
    raw.extend_from_slice(b"\0RES");
    raw.extend_from_slice(&20u32.to_be_bytes());
    let body = b"H:lap:1\x001\x000\x003\x0010";
    raw.extend_from_slice(&(body.len() as u32).to_be_bytes());
    raw.extend_from_slice(body);

    let (magic, packet) = proto::decode(&mut raw).unwrap().unwrap();
    assert_eq!(magic, Magic::Res);
    assert_eq!(
        packet,
        Packet::StatusRes {
            handle: "H:lap:1".into(),
            known: true,
            running: false,
            numerator: 3,
            denominator: 10,
        }
    );
}

#[test]
fn test_garbage_is_rejected() {
    let mut raw = BytesMut::from(&b"HTTP/1.1 200 OK\r\n"[..]);
    assert!(matches!(proto::decode(&mut raw), Err(ProtocolError::BadMagic(_))));
}
