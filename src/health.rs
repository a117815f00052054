//! Weighted composite health score in `[0, 1]` (spec §4.F).

#[derive(Debug, Clone, Copy)]
pub struct HealthWeights {
    pub success: f64,
    pub latency: f64,
    pub error: f64,
    pub resource: f64,
    pub throughput: f64,
}

impl Default for HealthWeights {
    fn default() -> Self {
        Self { success: 0.30, latency: 0.25, error: 0.20, resource: 0.15, throughput: 0.10 }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct HealthInputs {
    pub success_rate: f64,
    /// Observed latency, used against `p50_target`/`max_target` for the
    /// piecewise-linear latency sub-score.
    pub latency_ms: f64,
    pub p50_target_ms: f64,
    pub max_target_ms: f64,
    pub error_rate: f64,
    pub utilization: f64,
    pub throughput: f64,
    pub target_tps: f64,
}

pub struct HealthScorer {
    weights: HealthWeights,
}

impl HealthScorer {
    pub fn new(weights: HealthWeights) -> Self {
        Self { weights }
    }

    pub fn score(&self, inputs: HealthInputs) -> f64 {
        let success = inputs.success_rate.clamp(0.0, 1.0);

        let latency = if inputs.latency_ms <= inputs.p50_target_ms {
            1.0
        } else if inputs.latency_ms >= inputs.max_target_ms {
            0.0
        } else {
            let span = inputs.max_target_ms - inputs.p50_target_ms;
            if span <= 0.0 {
                0.0
            } else {
                1.0 - (inputs.latency_ms - inputs.p50_target_ms) / span
            }
        }
        .clamp(0.0, 1.0);

        let error = (1.0 - inputs.error_rate).clamp(0.0, 1.0);
        let resource = (1.0 - inputs.utilization).clamp(0.0, 1.0);
        let throughput = (inputs.throughput / inputs.target_tps.max(1.0)).clamp(0.0, 1.0);

        let total = self.weights.success * success
            + self.weights.latency * latency
            + self.weights.error * error
            + self.weights.resource * resource
            + self.weights.throughput * throughput;

        total.clamp(0.0, 1.0)
    }
}

impl Default for HealthScorer {
    fn default() -> Self {
        Self::new(HealthWeights::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn perfect() -> HealthInputs {
        HealthInputs {
            success_rate: 1.0,
            latency_ms: 0.0,
            p50_target_ms: 50.0,
            max_target_ms: 500.0,
            error_rate: 0.0,
            utilization: 0.0,
            throughput: 100.0,
            target_tps: 100.0,
        }
    }

    #[test]
    fn perfect_inputs_score_one() {
        let scorer = HealthScorer::default();
        assert_eq!(scorer.score(perfect()), 1.0);
    }

    #[test]
    fn latency_at_max_target_zeroes_latency_subscore() {
        let scorer = HealthScorer::default();
        let mut inputs = perfect();
        inputs.latency_ms = 500.0;
        let score = scorer.score(inputs);
        assert!(score < 1.0);
        assert!(score >= 1.0 - 0.25 - 1e-9);
    }

    #[test]
    fn worst_inputs_score_near_zero() {
        let scorer = HealthScorer::default();
        let inputs = HealthInputs {
            success_rate: 0.0,
            latency_ms: 1000.0,
            p50_target_ms: 50.0,
            max_target_ms: 500.0,
            error_rate: 1.0,
            utilization: 1.0,
            throughput: 0.0,
            target_tps: 100.0,
        };
        assert_eq!(scorer.score(inputs), 0.0);
    }
}
