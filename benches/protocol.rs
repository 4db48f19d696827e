use std::fs::OpenOptions;
use std::io::Write;
use std::time::Duration;

use bytes::BytesMut;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use futures::{SinkExt, StreamExt};
use tempfile::NamedTempFile;
use tokio::fs::File;
use tokio::runtime;

use rsdw::protocol::protocol::{asyncread_to_stream, asyncwrite_to_sink, DaskPacket};

fn create_bytes(size: usize) -> BytesMut {
    BytesMut::from(vec![0u8; size].as_slice())
}

fn serialize_packet(packet: DaskPacket) -> Vec<u8> {
    let mut bytes = Vec::default();
    let rt = runtime::Builder::new_current_thread().build().unwrap();
    rt.block_on(async {
        let mut sink = asyncwrite_to_sink(std::io::Cursor::new(&mut bytes));
        sink.send(packet).await.unwrap();
    });
    bytes
}

const SIZES: [usize; 7] = [
    256,
    1024,
    8 * 1024,
    64 * 1024,
    128 * 1024,
    1024 * 1024,
    32 * 1024 * 1024,
];

fn decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("Decode");
    group.warm_up_time(Duration::from_secs(1));
    group.sample_size(10);

    for size in SIZES {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("Stream", size), &size, |b, &size| {
            let rt = runtime::Builder::new_current_thread()
                .enable_io()
                .build()
                .unwrap();

            let mut packet_file = NamedTempFile::new().unwrap();
            let bytes = serialize_packet(DaskPacket::new(create_bytes(size), vec![]));
            packet_file.write_all(&bytes).unwrap();

            b.iter_with_setup(
                || File::from_std(packet_file.reopen().unwrap()),
                |file| {
                    rt.block_on(async move {
                        let mut stream = asyncread_to_stream(file);
                        stream.next().await.unwrap().unwrap();
                    });
                },
            );
        });
    }
    group.finish();
}

fn encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("Encode");
    group.warm_up_time(Duration::from_secs(1));
    group.sample_size(10);

    for size in SIZES {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("Sink", size), &size, |b, &size| {
            let rt = runtime::Builder::new_current_thread()
                .enable_io()
                .build()
                .unwrap();

            b.iter_with_setup(
                || {
                    let file =
                        File::from_std(OpenOptions::new().write(true).open("/dev/null").unwrap());
                    let sink = asyncwrite_to_sink(file);
                    let packet = DaskPacket::new(create_bytes(size), vec![]);
                    (sink, packet)
                },
                |(mut sink, packet)| {
                    rt.block_on(async move {
                        sink.send(packet).await.unwrap();
                    });
                },
            );
        });
    }
    group.finish();
}

criterion_group!(protocol, encode, decode);
criterion_main!(protocol);
