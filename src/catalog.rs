use std::{
    collections::BTreeMap,
    io::{self, BufRead},
    path::Path,
    time::Duration,
};

pub type Bitrate = u64;

#[derive(thiserror::Error, Debug)]
pub enum CatalogError {
    #[error("malformed metadata at line {line}: {reason}")]
    MalformedMetadata { line: usize, reason: String },

    #[error("unknown bitrate: {0}")]
    UnknownBitrate(Bitrate),

    #[error("segment index {index} is out of range for bitrate {bitrate} (1..={len})")]
    SegmentIndexOutOfRange {
        bitrate: Bitrate,
        index: i64,
        len: usize,
    },

    #[error("failed to read metadata: {0}")]
    Io(#[from] io::Error),
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SegmentRecord {
    pub frame_index: u64,
    pub layer_index: u64,
    pub size_bytes: u64,
    pub quality_metric: f64,
}

/// One line of the segment metadata feed.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MetadataRow {
    pub bitrate: Bitrate,
    pub record: SegmentRecord,
}

impl MetadataRow {
    /// Parses `<bitrate> <frame> <layer> <size> <quality>`.
    pub fn parse(line: &str) -> Result<Self, String> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 5 {
            return Err(format!("expected 5 fields, got {}", fields.len()));
        }

        let int = |idx: usize, name: &str| {
            fields[idx]
                .parse::<u64>()
                .map_err(|err| format!("{name} {:?}: {err}", fields[idx]))
        };
        let quality_metric = fields[4]
            .parse::<f64>()
            .map_err(|err| format!("quality_metric {:?}: {err}", fields[4]))?;

        Ok(Self {
            bitrate: int(0, "bitrate")?,
            record: SegmentRecord {
                frame_index: int(1, "frame_index")?,
                layer_index: int(2, "layer_index")?,
                size_bytes: int(3, "size_bytes")?,
                quality_metric,
            },
        })
    }
}

/// Playback parameters the line-based metadata format cannot express.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MediaInfo {
    pub segment_duration: Duration,
    pub playback_duration: Duration,
    pub min_buffer_time: Duration,
}

impl Default for MediaInfo {
    fn default() -> Self {
        Self {
            segment_duration: Duration::from_secs(4),
            playback_duration: Duration::from_secs(300),
            min_buffer_time: Duration::from_millis(1500),
        }
    }
}

/// Per-bitrate segment sizes of one video. Read-only once built.
#[derive(Clone, Debug)]
pub struct SegmentCatalog {
    buckets: BTreeMap<Bitrate, Vec<SegmentRecord>>,
    info: MediaInfo,
}

impl SegmentCatalog {
    pub fn load<I>(rows: I) -> Result<Self, CatalogError>
    where
        I: IntoIterator<Item = MetadataRow>,
    {
        let mut buckets: BTreeMap<Bitrate, Vec<SegmentRecord>> = BTreeMap::new();
        for row in rows {
            buckets.entry(row.bitrate).or_default().push(row.record);
        }

        if buckets.is_empty() {
            return Err(CatalogError::MalformedMetadata {
                line: 0,
                reason: "no segment rows".to_string(),
            });
        }

        let catalog = Self {
            buckets,
            info: MediaInfo::default(),
        };
        for bitrate in catalog.bitrates() {
            tracing::debug!(
                bitrate,
                segments = catalog.segment_count(bitrate).unwrap_or_default(),
                avg_size = catalog.average_segment_size(bitrate).unwrap_or_default(),
                "loaded bitrate bucket"
            );
        }
        Ok(catalog)
    }

    pub fn parse(text: &str) -> Result<Self, CatalogError> {
        Self::from_reader(text.as_bytes())
    }

    pub fn from_reader<R: BufRead>(reader: R) -> Result<Self, CatalogError> {
        let mut rows = Vec::new();
        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let row = MetadataRow::parse(&line).map_err(|reason| {
                CatalogError::MalformedMetadata {
                    line: idx + 1,
                    reason,
                }
            })?;
            rows.push(row);
        }
        Self::load(rows)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let file = std::fs::File::open(path)?;
        Self::from_reader(io::BufReader::new(file))
    }

    pub fn with_media_info(mut self, info: MediaInfo) -> Self {
        self.info = info;
        self
    }

    pub fn media_info(&self) -> &MediaInfo {
        &self.info
    }

    /// Available bitrates, ascending.
    pub fn bitrates(&self) -> impl Iterator<Item = Bitrate> + '_ {
        self.buckets.keys().copied()
    }

    pub fn lowest_bitrate(&self) -> Option<Bitrate> {
        self.buckets.keys().next().copied()
    }

    pub fn segment_count(&self, bitrate: Bitrate) -> Result<usize, CatalogError> {
        self.bucket(bitrate).map(Vec::len)
    }

    /// Looks up a segment by its 1-based index.
    pub fn segment(&self, bitrate: Bitrate, index: i64) -> Result<&SegmentRecord, CatalogError> {
        let bucket = self.bucket(bitrate)?;
        let out_of_range = || CatalogError::SegmentIndexOutOfRange {
            bitrate,
            index,
            len: bucket.len(),
        };
        let pos = usize::try_from(index)
            .ok()
            .and_then(|i| i.checked_sub(1))
            .ok_or_else(out_of_range)?;
        bucket.get(pos).ok_or_else(out_of_range)
    }

    pub fn segment_size(&self, bitrate: Bitrate, index: i64) -> Result<u64, CatalogError> {
        self.segment(bitrate, index).map(|s| s.size_bytes)
    }

    pub fn average_segment_size(&self, bitrate: Bitrate) -> Result<u64, CatalogError> {
        let bucket = self.bucket(bitrate)?;
        let total: u64 = bucket.iter().map(|s| s.size_bytes).sum();
        Ok(total / bucket.len().max(1) as u64)
    }

    fn bucket(&self, bitrate: Bitrate) -> Result<&Vec<SegmentRecord>, CatalogError> {
        self.buckets
            .get(&bitrate)
            .ok_or(CatalogError::UnknownBitrate(bitrate))
    }
}
