use std::{
    collections::HashMap,
    io::{self, BufRead},
    path::Path,
};

use crate::catalog::Bitrate;

/// Relative tolerance when checking that bin edges are evenly spaced.
const GAP_EPSILON: f64 = 1e-6;

#[derive(thiserror::Error, Debug)]
pub enum TableError {
    #[error("degenerate {axis} axis: {reason}")]
    DegenerateAxis { axis: &'static str, reason: String },

    #[error("malformed decision table row at line {line}: {reason}")]
    MalformedRow { line: usize, reason: String },

    #[error("decision table has {actual} entries, expected {expected}")]
    IncompleteTable { expected: usize, actual: usize },

    #[error("decision table row {row} belongs at composite index {expected}")]
    RowOrderMismatch { row: usize, expected: usize },

    #[error("previous rate {0} is not covered by the decision table")]
    UnknownPreviousRate(Bitrate),

    #[error("failed to read decision table: {0}")]
    Io(#[from] io::Error),
}

/// Evenly spaced, ascending bin edges.
#[derive(Clone, Debug, PartialEq)]
pub struct QuantizationAxis {
    edges: Vec<f64>,
    gap: f64,
}

impl QuantizationAxis {
    pub fn new(axis: &'static str, mut edges: Vec<f64>) -> Result<Self, TableError> {
        let degenerate = |reason: String| TableError::DegenerateAxis { axis, reason };

        if edges.iter().any(|e| !e.is_finite()) {
            return Err(degenerate("non-finite bin edge".to_string()));
        }
        edges.sort_by(f64::total_cmp);
        edges.dedup();
        if edges.len() < 2 {
            return Err(degenerate(format!(
                "need at least 2 distinct bins, got {}",
                edges.len()
            )));
        }

        let first = edges[0];
        let last = edges[edges.len() - 1];
        let gap = (last - first) / (edges.len() - 1) as f64;
        let tolerance = gap * GAP_EPSILON;
        for pair in edges.windows(2) {
            if ((pair[1] - pair[0]) - gap).abs() > tolerance {
                return Err(degenerate(format!(
                    "bins are not evenly spaced: gap between {} and {} is {}, expected {gap}",
                    pair[0],
                    pair[1],
                    pair[1] - pair[0]
                )));
            }
        }

        Ok(Self { edges, gap })
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    pub fn edges(&self) -> &[f64] {
        &self.edges
    }

    pub fn gap(&self) -> f64 {
        self.gap
    }

    /// Maps a measurement to its bin, clamping at both ends.
    pub fn index_of(&self, value: f64) -> usize {
        let first = self.edges[0];
        let last_idx = self.edges.len() - 1;
        if value.is_nan() || value <= first {
            0
        } else if value >= self.edges[last_idx] {
            last_idx
        } else {
            (((value - first) / self.gap).floor() as usize).min(last_idx)
        }
    }

    fn exact_index(&self, value: f64) -> Option<usize> {
        self.edges.iter().position(|e| *e == value)
    }
}

/// One line of the decision table feed.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TableRow {
    pub bandwidth: f64,
    pub buffer: f64,
    pub prerate: Bitrate,
    pub next_bitrate: Bitrate,
}

impl TableRow {
    /// Returns `Ok(None)` for header lines, i.e. lines whose first field is not numeric.
    pub fn parse(line: &str) -> Result<Option<Self>, String> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let Some(first) = fields.first() else {
            return Ok(None);
        };
        // "nan" and "inf" parse as f64 but are header words here
        let Some(bandwidth) = first.parse::<f64>().ok().filter(|v| v.is_finite()) else {
            return Ok(None);
        };
        if fields.len() < 4 {
            return Err(format!("expected 4 fields, got {}", fields.len()));
        }

        let buffer = fields[1]
            .parse::<f64>()
            .map_err(|err| format!("buffer {:?}: {err}", fields[1]))?;
        let prerate = fields[2]
            .parse::<Bitrate>()
            .map_err(|err| format!("prerate {:?}: {err}", fields[2]))?;
        let next_bitrate = fields[3]
            .parse::<Bitrate>()
            .map_err(|err| format!("next_bitrate {:?}: {err}", fields[3]))?;

        Ok(Some(Self {
            bandwidth,
            buffer,
            prerate,
            next_bitrate,
        }))
    }
}

/// FastMPC lookup table over (bandwidth, buffer, previous rate).
///
/// Rows must be laid out so that row `i` sits at
/// `bw_index * buffer_bins * prerates + buffer_index * prerates + prerate_index`;
/// loading verifies this for every row.
#[derive(Clone, Debug)]
pub struct QuantizedDecisionTable {
    bandwidth: QuantizationAxis,
    buffer: QuantizationAxis,
    prerates: HashMap<Bitrate, usize>,
    actions: Vec<Bitrate>,
}

impl QuantizedDecisionTable {
    pub fn load<I>(rows: I) -> Result<Self, TableError>
    where
        I: IntoIterator<Item = TableRow>,
    {
        let rows: Vec<TableRow> = rows.into_iter().collect();

        let mut prerates: HashMap<Bitrate, usize> = HashMap::new();
        let mut actions = Vec::with_capacity(rows.len());
        for row in rows.iter() {
            let next_idx = prerates.len();
            prerates.entry(row.prerate).or_insert(next_idx);
            actions.push(row.next_bitrate);
        }

        let bandwidth =
            QuantizationAxis::new("bandwidth", rows.iter().map(|r| r.bandwidth).collect())?;
        let buffer = QuantizationAxis::new("buffer", rows.iter().map(|r| r.buffer).collect())?;

        let table = Self {
            bandwidth,
            buffer,
            prerates,
            actions,
        };

        let expected = table.bandwidth.len() * table.buffer.len() * table.prerates.len();
        if table.actions.len() != expected {
            return Err(TableError::IncompleteTable {
                expected,
                actual: table.actions.len(),
            });
        }

        for (pos, row) in rows.iter().enumerate() {
            // axis values come straight from the rows, so exact lookups always hit
            let bw_idx = table.bandwidth.exact_index(row.bandwidth).unwrap_or_default();
            let buf_idx = table.buffer.exact_index(row.buffer).unwrap_or_default();
            let pre_idx = table.prerates[&row.prerate];
            let composite = table.composite_index(bw_idx, buf_idx, pre_idx);
            if composite != pos {
                return Err(TableError::RowOrderMismatch {
                    row: pos,
                    expected: composite,
                });
            }
        }

        tracing::info!(
            bandwidth_bins = table.bandwidth.len(),
            bandwidth_gap = table.bandwidth.gap(),
            buffer_bins = table.buffer.len(),
            buffer_gap = table.buffer.gap(),
            prerates = table.prerates.len(),
            "decision table loaded"
        );
        Ok(table)
    }

    pub fn parse(text: &str) -> Result<Self, TableError> {
        Self::from_reader(text.as_bytes())
    }

    pub fn from_reader<R: BufRead>(reader: R) -> Result<Self, TableError> {
        let mut rows = Vec::new();
        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            let parsed = TableRow::parse(&line).map_err(|reason| TableError::MalformedRow {
                line: idx + 1,
                reason,
            })?;
            if let Some(row) = parsed {
                rows.push(row);
            }
        }
        Self::load(rows)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TableError> {
        let file = std::fs::File::open(path)?;
        Self::from_reader(io::BufReader::new(file))
    }

    pub fn bandwidth_axis(&self) -> &QuantizationAxis {
        &self.bandwidth
    }

    pub fn buffer_axis(&self) -> &QuantizationAxis {
        &self.buffer
    }

    pub fn prerate_index(&self, previous_rate: Bitrate) -> Option<usize> {
        self.prerates.get(&previous_rate).copied()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn lookup(
        &self,
        bandwidth: f64,
        buffer_level: f64,
        previous_rate: Bitrate,
    ) -> Result<Bitrate, TableError> {
        let pre_idx = self
            .prerate_index(previous_rate)
            .ok_or(TableError::UnknownPreviousRate(previous_rate))?;
        let bw_idx = self.bandwidth.index_of(bandwidth);
        let buf_idx = self.buffer.index_of(buffer_level);
        let next = self.actions[self.composite_index(bw_idx, buf_idx, pre_idx)];

        tracing::debug!(
            bandwidth,
            buffer_level,
            previous_rate,
            bw_idx,
            buf_idx,
            next_bitrate = next,
            "fastmpc lookup"
        );
        Ok(next)
    }

    fn composite_index(&self, bw_idx: usize, buf_idx: usize, pre_idx: usize) -> usize {
        let step_buffer = self.prerates.len();
        let step_bw = self.buffer.len() * step_buffer;
        bw_idx * step_bw + buf_idx * step_buffer + pre_idx
    }
}
