use std::sync::Arc;

use crate::{
    catalog::Bitrate,
    estimator::{EstimateError, ThroughputEstimator},
    table::{QuantizedDecisionTable, TableError},
};

#[derive(thiserror::Error, Debug)]
pub enum ControllerError {
    #[error("no bitrates to choose from")]
    NoBitrates,

    #[error("throughput estimate failed: {0}")]
    Estimate(#[from] EstimateError),

    #[error(transparent)]
    Table(#[from] TableError),
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Decision {
    pub bitrate: Bitrate,
    /// Harmonic-mean throughput in kbps; `None` on cold start.
    pub estimate_kbps: Option<f64>,
}

/// Picks the next segment's bitrate from the FastMPC table.
#[derive(Clone, Debug)]
pub struct RateController {
    table: Arc<QuantizedDecisionTable>,
}

impl RateController {
    pub fn new(table: Arc<QuantizedDecisionTable>) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &QuantizedDecisionTable {
        &self.table
    }

    pub fn next_bitrate(
        &self,
        bitrates: &[Bitrate],
        estimator: &ThroughputEstimator,
        buffer_level: f64,
        previous_bitrate: Bitrate,
    ) -> Result<Decision, ControllerError> {
        let lowest = bitrates
            .iter()
            .copied()
            .min()
            .ok_or(ControllerError::NoBitrates)?;

        let Some(estimate) = estimator.estimate()? else {
            tracing::debug!(bitrate = lowest, "no throughput samples yet, starting low");
            metrics::counter!("mpcstream_decisions_total", "kind" => "cold_start").increment(1);
            return Ok(Decision {
                bitrate: lowest,
                estimate_kbps: None,
            });
        };

        let bitrate = self.table.lookup(estimate, buffer_level, previous_bitrate)?;
        metrics::counter!("mpcstream_decisions_total", "kind" => "lookup").increment(1);
        Ok(Decision {
            bitrate,
            estimate_kbps: Some(estimate),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::table::TableRow;

    fn controller() -> RateController {
        let mut rows = Vec::new();
        for bandwidth in [0.0, 500.0, 1000.0] {
            for buffer in [0.0, 4.0] {
                for prerate in [300, 750] {
                    let next_bitrate = if bandwidth >= 1000.0 && buffer >= 4.0 {
                        750
                    } else {
                        300
                    };
                    rows.push(TableRow {
                        bandwidth,
                        buffer,
                        prerate,
                        next_bitrate,
                    });
                }
            }
        }
        RateController::new(Arc::new(QuantizedDecisionTable::load(rows).unwrap()))
    }

    #[test]
    fn test_cold_start_picks_lowest() {
        let ctrl = controller();
        let decision = ctrl
            .next_bitrate(&[750, 300], &ThroughputEstimator::new(3), 0.0, 750)
            .unwrap();
        assert_eq!(
            decision,
            Decision {
                bitrate: 300,
                estimate_kbps: None
            }
        );
    }

    #[test]
    fn test_uses_table_once_warm() {
        let ctrl = controller();
        let mut est = ThroughputEstimator::new(3);
        est.record(256_000, Duration::from_secs(1));

        let decision = ctrl.next_bitrate(&[300, 750], &est, 8.0, 300).unwrap();
        assert_eq!(decision.bitrate, 750);
        assert_eq!(decision.estimate_kbps.map(f64::round), Some(2000.0));

        let decision = ctrl.next_bitrate(&[300, 750], &est, 1.0, 750).unwrap();
        assert_eq!(decision.bitrate, 300);
        assert_eq!(est.len(), 1);
    }

    #[test]
    fn test_surfaces_typed_failures() {
        let ctrl = controller();
        let mut est = ThroughputEstimator::new(3);
        assert!(matches!(
            ctrl.next_bitrate(&[], &est, 0.0, 300),
            Err(ControllerError::NoBitrates)
        ));

        est.record(1_000_000, Duration::from_secs(1));
        assert!(matches!(
            ctrl.next_bitrate(&[300], &est, 0.0, 123),
            Err(ControllerError::Table(TableError::UnknownPreviousRate(123)))
        ));

        est.record(1, Duration::ZERO);
        assert!(matches!(
            ctrl.next_bitrate(&[300], &est, 0.0, 300),
            Err(ControllerError::Estimate(EstimateError::DivisionByZero { .. }))
        ));
    }
}
