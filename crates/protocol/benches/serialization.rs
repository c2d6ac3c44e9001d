//! Benchmarks for USB/IP message encoding and decoding
//!
//! Measures codec performance for:
//! - Header-only requests
//! - Device-list replies of increasing size
//! - Stream decoding of byte-split input

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use protocol::{
    BusId, DeviceSpeed, ExportedDevice, FrameDecoder, InterfaceInfo, OpMessage, decode, encode,
};

fn make_device(i: u32) -> ExportedDevice {
    let bus_id = format!("1-{}", i);
    ExportedDevice {
        path: format!("/sys/devices/pci0000:00/0000:00:14.0/usb1/{}", bus_id),
        bus_id: BusId::new(bus_id),
        bus_number: 1,
        device_number: i,
        speed: DeviceSpeed::High,
        vendor_id: 0x1234,
        product_id: 0x5678 + i as u16,
        device_release: 0x0100,
        device_class: 0x00,
        device_subclass: 0x00,
        device_protocol: 0x00,
        configuration_value: 1,
        configuration_count: 1,
        interface_count: 2,
        interfaces: vec![
            InterfaceInfo {
                class: 0x03,
                subclass: 0x01,
                protocol: 0x01,
            },
            InterfaceInfo {
                class: 0x03,
                subclass: 0x01,
                protocol: 0x02,
            },
        ],
    }
}

fn benchmark_requests(c: &mut Criterion) {
    let mut group = c.benchmark_group("requests");

    let devlist = OpMessage::DevListRequest;
    group.bench_function("encode_devlist_request", |b| {
        b.iter(|| encode(black_box(&devlist)))
    });

    let import = OpMessage::ImportRequest {
        bus_id: BusId::new("1-1.2"),
    };
    let import_bytes = encode(&import).unwrap();
    group.bench_function("decode_import_request", |b| {
        b.iter(|| decode(black_box(&import_bytes)))
    });

    group.finish();
}

fn benchmark_device_list(c: &mut Criterion) {
    let mut group = c.benchmark_group("device_list");

    for count in [1u32, 10, 100] {
        let msg = OpMessage::dev_list((1..=count).map(make_device).collect());
        let bytes = encode(&msg).unwrap();
        group.throughput(Throughput::Bytes(bytes.len() as u64));

        group.bench_with_input(BenchmarkId::new("encode", count), &msg, |b, msg| {
            b.iter(|| encode(black_box(msg)))
        });
        group.bench_with_input(BenchmarkId::new("decode", count), &bytes, |b, bytes| {
            b.iter(|| decode(black_box(bytes)))
        });
    }

    group.finish();
}

fn benchmark_stream_decoding(c: &mut Criterion) {
    let mut group = c.benchmark_group("stream_decoding");

    let msg = OpMessage::dev_list((1..=10).map(make_device).collect());
    let bytes = encode(&msg).unwrap();

    for chunk in [1usize, 64, 1500] {
        group.bench_with_input(BenchmarkId::new("chunk_size", chunk), &chunk, |b, &chunk| {
            b.iter(|| {
                let mut decoder = FrameDecoder::new();
                let mut decoded = None;
                for piece in bytes.chunks(chunk) {
                    decoder.extend(piece);
                    if let Some(message) = decoder.next_message().unwrap() {
                        decoded = Some(message);
                    }
                }
                decoded
            })
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    benchmark_requests,
    benchmark_device_list,
    benchmark_stream_decoding
);
criterion_main!(benches);
