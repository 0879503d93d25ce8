//! End-to-end scenarios from SPEC_FULL.md §8: a source engine streams a
//! device through the wire format to a destination reassembler, which
//! applies write tasks back onto a second `FileBlockDevice`.

use std::io::Write;
use std::sync::Arc;

use migration::device::{BlockDevice, FileBlockDevice, SECTORS_PER_DIRTY_CHUNK, SECTOR_SIZE};
use migration::engine::{MigrationEngine, MigrationParams};
use migration::pipeline::BoundedTaskQueue;
use migration::reassembler::{BoundedReduceQueue, ReceiveReassembler};
use migration::stream::{MemoryStream, Stream};
use migration::wire::Record;

fn make_source(sectors: u64, fill: u8) -> (tempfile::NamedTempFile, Arc<FileBlockDevice>) {
    let mut f = tempfile::NamedTempFile::new().unwrap();
    f.write_all(&vec![fill; (sectors * SECTOR_SIZE) as usize]).unwrap();
    f.flush().unwrap();
    let dev = Arc::new(FileBlockDevice::open("sda", f.path()).unwrap());
    (f, dev)
}

fn make_blank_destination(sectors: u64) -> (tempfile::NamedTempFile, Arc<FileBlockDevice>) {
    let mut f = tempfile::NamedTempFile::new().unwrap();
    f.write_all(&vec![0u8; (sectors * SECTOR_SIZE) as usize]).unwrap();
    f.flush().unwrap();
    let dev = Arc::new(FileBlockDevice::open("sda", f.path()).unwrap());
    (f, dev)
}

/// Drives a `MigrationEngine` through init + bulk sweep, and a `TaskQueue`
/// writer side that encodes every produced `TaskBody` directly onto a
/// `MemoryStream`. This plays the role of the out-of-scope writer thread
/// that drains the `TaskQueue` (SPEC_FULL.md §1).
fn ship_bulk_sweep(engine: &mut MigrationEngine<FileBlockDevice>, stream: &mut MemoryStream) {
    let queue = BoundedTaskQueue::new(16);
    while !engine.bulk_completed_global() {
        engine.bulk_sync(&queue).unwrap();
        while let Ok(body) = queue.receiver().try_recv() {
            for chunk in body.chunks {
                let device = engine.device_name(chunk.device).to_string();
                Record::Data {
                    device,
                    sector: chunk.sector,
                    iter_num: body.iter_num,
                    payload: chunk.buffer,
                }
                .encode(stream)
                .unwrap();
            }
        }
    }
}

fn apply_writes(reduce_queue: &BoundedReduceQueue, dest: &FileBlockDevice) {
    while let Ok(task) = reduce_queue.receiver().try_recv() {
        dest.write_sync(task.sector, task.nr_sectors, task.payload.as_ref()).unwrap();
    }
}

#[test]
fn full_bulk_migration_reproduces_source_bytes() {
    let sectors = SECTORS_PER_DIRTY_CHUNK * 2;
    let (_sf, source) = make_source(sectors, 0xAB);
    let (_df, dest) = make_blank_destination(sectors);

    let mut engine: MigrationEngine<FileBlockDevice> =
        MigrationEngine::new(MigrationParams::new().with_blk_enable(true));
    let mut stream = MemoryStream::new();
    engine.init(vec![source.clone()], &mut stream).unwrap();
    ship_bulk_sweep(&mut engine, &mut stream);
    Record::Eos.encode(&mut stream).unwrap();

    let bytes = stream.into_inner();
    let mut recv_stream = MemoryStream::new();
    recv_stream.write_bytes(&bytes).unwrap();

    let reassembler = ReceiveReassembler::new();
    let reduce_queue = BoundedReduceQueue::new(16);
    // init() wrote its own negotiate+EOS section (stage 1); the bulk sweep's
    // data records plus the trailing EOS form a second section (stage 2).
    // `run` parses one EOS-terminated section per call, same as the source
    // side's `save_live` being invoked once per stage.
    reassembler.run(&mut recv_stream, &reduce_queue).unwrap();
    reassembler.run(&mut recv_stream, &reduce_queue).unwrap();
    apply_writes(&reduce_queue, &dest);

    let mut source_bytes = vec![0u8; sectors as usize * SECTOR_SIZE as usize];
    source.read_sync(0, sectors as u32, &mut source_bytes).unwrap();
    let mut dest_bytes = vec![0u8; sectors as usize * SECTOR_SIZE as usize];
    dest.read_sync(0, sectors as u32, &mut dest_bytes).unwrap();
    assert_eq!(source_bytes, dest_bytes);
}

#[test]
fn short_tail_device_transfers_exact_sector_count() {
    // total_sectors is not a multiple of SECTORS_PER_DIRTY_CHUNK (B1).
    let sectors = SECTORS_PER_DIRTY_CHUNK + 17;
    let (_sf, source) = make_source(sectors, 0x11);
    let (_df, dest) = make_blank_destination(sectors);

    let mut engine: MigrationEngine<FileBlockDevice> =
        MigrationEngine::new(MigrationParams::new().with_blk_enable(true));
    let mut stream = MemoryStream::new();
    engine.init(vec![source.clone()], &mut stream).unwrap();
    ship_bulk_sweep(&mut engine, &mut stream);
    Record::Eos.encode(&mut stream).unwrap();

    let bytes = stream.into_inner();
    let mut recv_stream = MemoryStream::new();
    recv_stream.write_bytes(&bytes).unwrap();

    let reassembler = ReceiveReassembler::new();
    let reduce_queue = BoundedReduceQueue::new(16);
    reassembler.run(&mut recv_stream, &reduce_queue).unwrap();
    reassembler.run(&mut recv_stream, &reduce_queue).unwrap();

    let mut tail_nr_sectors = None;
    while let Ok(task) = reduce_queue.receiver().try_recv() {
        if task.sector == SECTORS_PER_DIRTY_CHUNK {
            tail_nr_sectors = Some(task.nr_sectors);
        }
        dest.write_sync(task.sector, task.nr_sectors, task.payload.as_ref()).unwrap();
    }
    assert_eq!(tail_nr_sectors, Some(17));
}

#[test]
fn dirty_sweep_after_bulk_ships_only_touched_chunks() {
    let sectors = SECTORS_PER_DIRTY_CHUNK * 4;
    let (_sf, source) = make_source(sectors, 0x00);

    let mut engine: MigrationEngine<FileBlockDevice> =
        MigrationEngine::new(MigrationParams::new().with_blk_enable(true));
    let mut stream = MemoryStream::new();
    engine.init(vec![source.clone()], &mut stream).unwrap();
    ship_bulk_sweep(&mut engine, &mut stream);

    source.write_sync(0, 1, &[0x42; SECTOR_SIZE as usize]).unwrap();
    source
        .write_sync(2 * SECTORS_PER_DIRTY_CHUNK, 1, &[0x43; SECTOR_SIZE as usize])
        .unwrap();

    engine.reset_dirty_cursor();
    let queue = BoundedTaskQueue::new(16);
    for idx in 0..engine.device_count() {
        engine.sweep_dirty_sync(idx, &queue).unwrap();
    }

    let mut sectors_seen = Vec::new();
    while let Ok(body) = queue.receiver().try_recv() {
        for chunk in body.chunks {
            sectors_seen.push(chunk.sector);
        }
    }
    sectors_seen.sort();
    assert_eq!(sectors_seen, vec![0, 2 * SECTORS_PER_DIRTY_CHUNK]);
}
