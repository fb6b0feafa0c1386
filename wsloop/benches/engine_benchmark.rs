use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;
use std::io;
use wsloop::protocol::{format_message, message_frame_size};
use wsloop::pubsub::{IteratorFlags, TopicTree};
use wsloop::{
    consume, CloseReason, DeflationStream, InflationStream, OpCode, ProtocolHandler, ServerState,
    Transport, WebSocket, WebSocketBehavior, WebSocketConfig, WebSocketContext, ZlibContext,
};

struct Counter(usize);

impl ProtocolHandler for Counter {
    fn refuse_payload_length(&mut self, _length: u64) -> bool {
        false
    }

    fn set_compressed(&mut self) -> bool {
        false
    }

    fn force_close(&mut self, reason: CloseReason) {
        panic!("unexpected close: {reason}");
    }

    fn handle_fragment(&mut self, data: &[u8], _remaining: u32, _opcode: OpCode, _fin: bool) -> bool {
        self.0 += data.len();
        false
    }
}

struct Discard;

impl Transport for Discard {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        Ok(data.len())
    }
}

struct Quiet;

impl<T: Transport> WebSocketBehavior<T> for Quiet {
    fn on_message(&mut self, _ws: &mut WebSocket<'_, T>, _message: &[u8], _opcode: OpCode) {}
}

fn masked_frames(count: usize, payload: &[u8]) -> Vec<u8> {
    let mut stream = Vec::new();
    let mut frame = vec![0u8; message_frame_size::<false>(payload.len())];
    for _ in 0..count {
        let length = format_message::<false>(&mut frame, payload, OpCode::Binary, false, true);
        stream.extend_from_slice(&frame[..length]);
    }
    stream
}

fn bench_parse_small_frames(c: &mut Criterion) {
    let stream = masked_frames(1000, &[0x42; 32]);

    c.bench_function("parse_1K_masked_32B", |b| {
        b.iter(|| {
            let mut input = stream.clone();
            let mut state = ServerState::new();
            let mut counter = Counter(0);
            consume(black_box(&mut input), &mut state, &mut counter);
            black_box(counter.0);
        })
    });
}

fn bench_parse_large_frame(c: &mut Criterion) {
    let stream = masked_frames(1, &vec![0x42; 1 << 20]);

    c.bench_function("parse_1MB_masked", |b| {
        b.iter(|| {
            let mut input = stream.clone();
            let mut state = ServerState::new();
            let mut counter = Counter(0);
            consume(black_box(&mut input), &mut state, &mut counter);
            black_box(counter.0);
        })
    });
}

fn bench_format_server_frame(c: &mut Criterion) {
    let payload = vec![0x42u8; 256];
    let mut frame = vec![0u8; message_frame_size::<true>(payload.len())];

    c.bench_function("format_server_256B", |b| {
        b.iter(|| {
            black_box(format_message::<true>(
                &mut frame,
                black_box(&payload),
                OpCode::Text,
                false,
                true,
            ));
        })
    });
}

fn bench_deflate_roundtrip(c: &mut Criterion) {
    let text = br#"{"room":"lobby","user":"someone","text":"hello there"}"#.repeat(75);
    let mut zlib = ZlibContext::new();
    let mut deflater = DeflationStream::new(15);
    let mut inflater = InflationStream::new(15);

    c.bench_function("deflate_inflate_4KB_text", |b| {
        b.iter(|| {
            let compressed = deflater.deflate(&mut zlib, black_box(&text), true).map(<[u8]>::to_vec).unwrap_or_default();
            let inflated = inflater.inflate(&mut zlib, &compressed, usize::MAX, true);
            black_box(inflated.map(<[u8]>::len));
        })
    });
}

fn bench_topic_tree_fanout(c: &mut Criterion) {
    c.bench_function("topic_tree_1K_msgs_x_100_subs", |b| {
        b.iter(|| {
            let mut tree: TopicTree<usize, u32> = TopicTree::new();
            for user in 0..100 {
                let id = tree.create_subscriber(user);
                tree.subscribe(id, "room");
            }
            let mut delivered = 0usize;
            let mut callback = |_: &usize, _: &u32, _: IteratorFlags| {
                delivered += 1;
                false
            };
            for i in 0..1000 {
                tree.publish(None, "room", i, &mut callback);
            }
            tree.drain(&mut callback);
            black_box(delivered);
        })
    });
}

fn bench_context_publish(c: &mut Criterion) {
    let mut ctx = WebSocketContext::new(WebSocketConfig::default(), Quiet);
    for _ in 0..100 {
        let id = ctx.accept(Discard);
        if let Some(mut ws) = ctx.websocket(id) {
            ws.subscribe("room");
        }
    }

    c.bench_function("context_publish_100_msgs_x_100_sockets", |b| {
        b.iter(|| {
            for _ in 0..100 {
                ctx.publish("room", black_box(b"tick"), OpCode::Text, false);
            }
            ctx.post_iteration();
        })
    });
}

criterion_group!(
    benches,
    bench_parse_small_frames,
    bench_parse_large_frame,
    bench_format_server_frame,
    bench_deflate_roundtrip,
    bench_topic_tree_fanout,
    bench_context_publish,
);
criterion_main!(benches);
