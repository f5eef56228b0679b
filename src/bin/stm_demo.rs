//! Sample driver: a region sized to hold an array of `u32`s, one writer
//! thread that initializes and then increments the array transactionally,
//! and one read-only thread that repeatedly takes consistent snapshots of
//! it while the writer is running.

use omen_stm::abi::{region_create, region_metrics, region_start, tx_begin, tx_end, tx_read, tx_write};
use omen_stm::config::RegionConfig;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{info, Level};

const ELEM_SIZE: usize = std::mem::size_of::<u32>();
const COUNT: usize = 16;

fn write_array(region: &omen_stm::abi::RegionHandle, values: &[u32]) -> bool {
    let tx = match tx_begin(region, false) {
        Some(tx) => tx,
        None => return false,
    };
    let base = region_start(region);
    for (i, v) in values.iter().enumerate() {
        let bytes = v.to_le_bytes();
        if !tx_write(region, tx, &bytes, base + i * ELEM_SIZE) {
            tx_end(region, tx, true);
            return false;
        }
    }
    tx_end(region, tx, false)
}

fn read_array(region: &omen_stm::abi::RegionHandle) -> Option<Vec<u32>> {
    let tx = tx_begin(region, true)?;
    let base = region_start(region);
    let mut values = Vec::with_capacity(COUNT);
    let mut buf = [0u8; ELEM_SIZE];
    for i in 0..COUNT {
        if !tx_read(region, tx, base + i * ELEM_SIZE, ELEM_SIZE, &mut buf) {
            tx_end(region, tx, true);
            return None;
        }
        values.push(u32::from_le_bytes(buf));
    }
    tx_end(region, tx, false);
    Some(values)
}

fn main() {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_target(false)
        .compact()
        .init();

    let cfg = RegionConfig::load().unwrap_or_default();
    info!(elem_size = ELEM_SIZE, count = COUNT, alignment = cfg.alignment, "starting stm_demo");

    let region = Arc::new(
        region_create(COUNT * ELEM_SIZE, ELEM_SIZE).expect("region size is a multiple of alignment"),
    );

    let initial: Vec<u32> = (0..COUNT as u32).collect();
    assert!(write_array(&region, &initial), "initial write should not conflict");
    info!(values = ?initial, "initialized array");

    let writer_region = region.clone();
    let writer = thread::spawn(move || {
        for round in 0..20u32 {
            loop {
                let current = match read_array(&writer_region) {
                    Some(values) => values,
                    None => continue,
                };
                let incremented: Vec<u32> = current.iter().map(|v| v + 1).collect();
                if write_array(&writer_region, &incremented) {
                    break;
                }
                // Lost the race with a concurrent commit; retry.
            }
            info!(round, "writer committed a round of increments");
        }
    });

    let reader_region = region.clone();
    let reader = thread::spawn(move || {
        for _ in 0..10 {
            if let Some(values) = read_array(&reader_region) {
                info!(values = ?values, "reader observed a consistent snapshot");
            }
            thread::sleep(Duration::from_millis(5));
        }
    });

    writer.join().expect("writer thread panicked");
    reader.join().expect("reader thread panicked");

    let final_values = read_array(&region).expect("final read should succeed");
    info!(values = ?final_values, "final array state");
    let (began, committed, aborted) = region_metrics(&region);
    info!(began, committed, aborted, "region transaction counters");
}
