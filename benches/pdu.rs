use std::hint::black_box;
use std::time::Duration;

use bacnet_tsm::app::pdu::{Apdu, ComplexAckHeader, ConfirmedRequestHeader, SegmentHeader};
use bacnet_tsm::app::{plan_segments, MaxApduSize, MaxSegments, Segment, SegmentReassembler};
use bacnet_tsm::transport::{Address, DataLinkAddress};
use bytes::{Bytes, BytesMut};
use criterion::{criterion_group, criterion_main, Criterion};

fn confirmed_request() -> Bytes {
    let mut buffer = BytesMut::new();
    ConfirmedRequestHeader {
        segment: None,
        segmented_response_accepted: true,
        max_segments: MaxSegments::SixtyFour,
        max_apdu: MaxApduSize::Up1476,
        invoke_id: 1,
        service_choice: 12,
    }
    .encode(&mut buffer);
    buffer.extend_from_slice(&[0x0C, 0x02, 0x00, 0x00, 0x01, 0x19, 0x4D]);
    buffer.freeze()
}

fn pdu_benchmark(c: &mut Criterion) {
    let request = confirmed_request();
    c.bench_function("decode_confirmed_request", |b| {
        b.iter(|| Apdu::decode(black_box(request.clone())))
    });

    let apdu = Apdu::decode(request.clone()).ok();
    c.bench_function("encode_confirmed_request", |b| {
        b.iter(|| black_box(&apdu).as_ref().map(Apdu::encode))
    });

    let payload = Bytes::from(vec![0xA5u8; 16 * 1024]);
    c.bench_function("plan_segments_16k", |b| {
        b.iter(|| plan_segments(black_box(&payload), 480, MaxSegments::SixtyFour))
    });
}

fn reassembly_benchmark(c: &mut Criterion) {
    let source = Address::local(DataLinkAddress::Mac(vec![0x01]));
    let content = Bytes::from(vec![0x5Au8; 475]);
    let count = 32u8;
    let segments: Vec<Segment> = (0..count)
        .map(|sequence_number| {
            let header = ComplexAckHeader {
                segment: Some(SegmentHeader {
                    sequence_number,
                    proposed_window_size: 16,
                    more_follows: sequence_number + 1 < count,
                }),
                invoke_id: 9,
                service_choice: 12,
            };
            Segment::from_complex_ack(&header, content.clone())
        })
        .collect::<Option<_>>()
        .unwrap_or_default();

    c.bench_function("reassemble_32_segments", |b| {
        b.iter(|| {
            let reassembler = SegmentReassembler::new(Duration::from_secs(60), 16, 1 << 20);
            let mut complete = None;
            for segment in segments.iter().rev() {
                if let Ok(receipt) = reassembler.accept(&source, segment.clone()) {
                    complete = receipt.reassembled.or(complete);
                }
            }
            black_box(complete)
        })
    });
}

criterion_group!(benches, pdu_benchmark, reassembly_benchmark);
criterion_main!(benches);
