// SPDX-License-Identifier: MIT OR Apache-2.0

#![no_main]

use libfuzzer_sys::fuzz_target;
use tokio_util::bytes::BytesMut;
use tokio_util::codec::Decoder;
use vaultsandbox_client::sse::{SseCodec, SseEvent};

fn decode_all(chunks: &[&[u8]]) -> Option<Vec<SseEvent>> {
    let mut codec = SseCodec::default();
    let mut buffer = BytesMut::new();
    let mut events = Vec::new();

    for chunk in chunks {
        buffer.extend_from_slice(chunk);
        while let Some(event) = codec.decode(&mut buffer).ok()? {
            events.push(event);
        }
    }
    while let Some(event) = codec.decode_eof(&mut buffer).ok()? {
        events.push(event);
    }

    Some(events)
}

// However a stream is split into chunks, the decoded events are the same.
fuzz_target!(|args: (&[u8], Vec<u16>)| {
    let (data, splits) = args;

    let mut points: Vec<usize> = splits
        .into_iter()
        .map(|split| usize::from(split) % (data.len() + 1))
        .collect();
    points.sort_unstable();

    let mut chunks = Vec::new();
    let mut start = 0;
    for point in points {
        chunks.push(&data[start..point]);
        start = point;
    }
    chunks.push(&data[start..]);

    assert_eq!(decode_all(&[data]), decode_all(&chunks));
});
