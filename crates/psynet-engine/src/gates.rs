//! Gate transfer unit
//!
//! Applies, per element: the selected transfer function, then the threshold,
//! then amplification, then the min/max clip. The order is part of the
//! engine's contract and pinned by tests.

use crate::types::GateFunction;

/// Logistic sigmoid
#[inline]
pub(crate) fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Parameters of one element's gate
#[derive(Debug, Clone, Copy)]
pub struct GateParams {
    /// Transfer function selector (raw `g_function_selector` value)
    pub selector: i8,
    /// Bias for sigmoid/tanh/rect
    pub theta: f32,
    /// Activation floor
    pub threshold: f32,
    /// Post-threshold multiplier
    pub amplification: f32,
    /// Lower clip bound
    pub min: f32,
    /// Upper clip bound
    pub max: f32,
}

/// Run one value through the full gate pipeline
pub fn apply_gate(x: f32, p: &GateParams) -> f32 {
    let y = match p.selector {
        s if s == GateFunction::Absolute.selector() => x.abs(),
        s if s == GateFunction::Sigmoid.selector() => sigmoid(x + p.theta),
        s if s == GateFunction::Tanh.selector() => (x + p.theta).tanh(),
        s if s == GateFunction::Rect.selector() => {
            if x + p.theta > 0.0 {
                x - p.theta
            } else {
                0.0
            }
        }
        s if s == GateFunction::Dist.selector() => {
            if x != 0.0 {
                1.0 / x
            } else {
                0.0
            }
        }
        _ => x,
    };
    let y = if y >= p.threshold { y } else { 0.0 };
    let y = y * p.amplification;
    y.max(p.min).min(p.max)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(selector: GateFunction) -> GateParams {
        GateParams {
            selector: selector.selector(),
            theta: 0.0,
            threshold: -100.0,
            amplification: 1.0,
            min: -100.0,
            max: 100.0,
        }
    }

    #[test]
    fn test_identity() {
        let p = params(GateFunction::Identity);
        assert_eq!(apply_gate(0.5, &p), 0.5);
        assert_eq!(apply_gate(-0.5, &p), -0.5);
    }

    #[test]
    fn test_absolute() {
        let p = params(GateFunction::Absolute);
        assert_eq!(apply_gate(-0.75, &p), 0.75);
    }

    #[test]
    fn test_sigmoid_uses_theta() {
        let mut p = params(GateFunction::Sigmoid);
        assert_eq!(apply_gate(0.0, &p), 0.5);
        p.theta = 100.0;
        assert!((apply_gate(0.0, &p) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_tanh() {
        let p = params(GateFunction::Tanh);
        assert!((apply_gate(1.0, &p) - 1.0f32.tanh()).abs() < 1e-6);
    }

    #[test]
    fn test_rect() {
        let mut p = params(GateFunction::Rect);
        p.theta = 0.5;
        // active: x + theta > 0, output x - theta
        assert_eq!(apply_gate(1.0, &p), 0.5);
        assert_eq!(apply_gate(-1.0, &p), 0.0);
    }

    #[test]
    fn test_dist() {
        let p = params(GateFunction::Dist);
        assert_eq!(apply_gate(4.0, &p), 0.25);
        assert_eq!(apply_gate(0.0, &p), 0.0);
    }

    #[test]
    fn test_threshold_precedes_amplification_and_clip() {
        // amplification could lift a sub-threshold value back over the
        // threshold; the pipeline must cut first
        let p = GateParams {
            selector: GateFunction::Identity.selector(),
            theta: 0.0,
            threshold: 1.0,
            amplification: 10.0,
            min: 0.0,
            max: 100.0,
        };
        assert_eq!(apply_gate(0.5, &p), 0.0);
        assert_eq!(apply_gate(2.0, &p), 20.0);

        // clip applies after amplification
        let p = GateParams { max: 5.0, ..p };
        assert_eq!(apply_gate(2.0, &p), 5.0);
    }

    #[test]
    fn test_clip_handles_nan_inputs() {
        // misconfigured parameters may produce NaN upstream; the clip keeps
        // the output inside [min, max] for every non-NaN and the threshold
        // comparison maps NaN below threshold to 0
        let p = params(GateFunction::Dist);
        let out = apply_gate(f32::INFINITY, &p);
        assert!(out.abs() <= 100.0);
    }
}
