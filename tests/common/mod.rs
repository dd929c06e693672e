#![allow(dead_code)]

use std::sync::Arc;

use mpcstream::{
    catalog::{Bitrate, SegmentCatalog},
    table::{QuantizedDecisionTable, TableRow},
};

pub const SCENARIO_BITRATE: Bitrate = 500_000;
pub const SCENARIO_SIZES: [u64; 3] = [100_000, 120_000, 90_000];

pub fn scenario_catalog() -> Arc<SegmentCatalog> {
    let mut metadata = String::new();
    for (i, size) in SCENARIO_SIZES.iter().enumerate() {
        metadata.push_str(&format!("{SCENARIO_BITRATE} {} 0 {size} 0.95\n", i + 1));
    }
    Arc::new(SegmentCatalog::parse(&metadata).expect("scenario metadata"))
}

/// Bandwidth bins [0, 1000, 2000], buffer bins [0, 10, 20], one previous rate.
/// The entry at (bw, buffer) is `SCENARIO_BITRATE + 1000 * (bw * 3 + buffer)`.
pub fn scenario_table_text() -> String {
    let mut text = String::from("bandwidth\tbuffer\tprerate\tnext_bitrate\n");
    for (bw_idx, bw) in [0, 1000, 2000].iter().enumerate() {
        for (buf_idx, buf) in [0, 10, 20].iter().enumerate() {
            let next = SCENARIO_BITRATE + 1000 * (bw_idx * 3 + buf_idx) as u64;
            text.push_str(&format!("{bw}\t{buf}\t{SCENARIO_BITRATE}\t{next}\n"));
        }
    }
    text
}

pub fn scenario_table() -> Arc<QuantizedDecisionTable> {
    Arc::new(QuantizedDecisionTable::parse(&scenario_table_text()).expect("scenario table"))
}

/// A complete, correctly ordered table whose actions are their own composite index.
pub fn indexed_grid(bw: &[f64], buffer: &[f64], prerates: &[Bitrate]) -> Vec<TableRow> {
    let mut rows = Vec::new();
    for &bandwidth in bw {
        for &buf in buffer {
            for &prerate in prerates {
                rows.push(TableRow {
                    bandwidth,
                    buffer: buf,
                    prerate,
                    next_bitrate: rows.len() as Bitrate,
                });
            }
        }
    }
    rows
}

pub fn uniform_edges(first: f64, gap: f64, count: usize) -> Vec<f64> {
    (0..count).map(|i| first + gap * i as f64).collect()
}
