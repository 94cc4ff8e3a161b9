//! Per-element node functions: Pipe and LSTM gate logic
//!
//! The dispatcher computes, for every element, the pre-gate value fed into
//! the gate transfer unit. Pipe and LSTM elements read their node's slots
//! through a shifted view of the activation vector: row `i` exposes
//! `a[(i - 7 + k) mod NoE]` at column `k`, so columns 7..13 are the slots of
//! the element's own node in the `gen` frame and each later gate sees the
//! same window shifted one column to the left.

use crate::gates::sigmoid;
use crate::types::nodefunction as nf;

/// Shifted 14-column window over a vector, materialised once per tick
pub(crate) struct ShiftedView {
    rolled: Vec<f32>,
}

impl ShiftedView {
    pub(crate) fn empty() -> Self {
        Self { rolled: Vec::new() }
    }

    /// Rebuild the window from `values`, reusing the allocation
    pub(crate) fn rebuild(&mut self, values: &[f32]) {
        let n = values.len();
        self.rolled.clear();
        self.rolled.reserve(n + 13);
        for j in 0..n + 13 {
            self.rolled.push(values[(j + 7 * n - 7) % n]);
        }
    }

    #[inline]
    pub(crate) fn at(&self, row: usize, col: usize) -> f32 {
        debug_assert!(col < 14);
        self.rolled[row + col]
    }
}

#[inline]
fn b(cond: bool) -> f32 {
    if cond {
        1.0
    } else {
        0.0
    }
}

/// Everything the dispatcher reads, borrowed from the partition
pub(crate) struct DispatchInputs<'a> {
    pub a: &'a [f32],
    pub a_prev: &'a [f32],
    pub slots: &'a ShiftedView,
    pub thetas: &'a ShiftedView,
    pub g_factor: &'a [f32],
    pub g_expect: &'a [f32],
    pub g_wait: &'a [i16],
    pub g_countdown: &'a [i16],
    pub n_function_selector: &'a [i8],
    pub por_linked: &'a [i8],
    pub ret_linked: &'a [i8],
    pub step: i32,
    pub has_directional_activators: bool,
    pub has_sampling_activators: bool,
}

/// Outcome of dispatching one element
pub(crate) struct ElementUpdate {
    pub x: f32,
    pub countdown: i16,
}

/// Compute the pre-gate value (and countdown) for element `e`
pub(crate) fn dispatch_element(inp: &DispatchInputs<'_>, e: usize) -> ElementUpdate {
    let selector = inp.n_function_selector[e];
    let mut countdown = inp.g_countdown[e];

    let mut x = match selector {
        nf::PIPE_GEN => pipe_gen(inp, e),
        nf::PIPE_POR => pipe_por(inp, e, &mut countdown),
        nf::PIPE_RET => pipe_ret(inp, e),
        nf::PIPE_SUB => pipe_sub(inp, e),
        nf::PIPE_SUR => pipe_sur(inp, e, &mut countdown),
        nf::PIPE_CAT => pipe_cat(inp, e),
        nf::PIPE_EXP => pipe_exp(inp, e),
        nf::LSTM_GEN => lstm_gen(inp, e),
        nf::LSTM_POR => lstm_por(inp, e),
        nf::LSTM_GIN => lstm_sigma(inp, e),
        nf::LSTM_GOU => lstm_sigma(inp, e),
        nf::LSTM_GFG => lstm_sigma(inp, e),
        _ => inp.a[e],
    };

    // directional activators gate every pipe output except gen
    if inp.has_directional_activators && (nf::PIPE_POR..=nf::PIPE_EXP).contains(&selector) {
        x *= inp.g_factor[e];
    }

    ElementUpdate { x, countdown }
}

// Pipe slot columns, by the shifted-view frame of each gate element:
//
//        0   1   2   3   4   5   6   7   8   9   10  11  12  13
//  gen                               gen por ret sub sur cat exp
//  por                           gen por ret sub sur cat exp
//  ret                       gen por ret sub sur cat exp
//  sub                   gen por ret sub sur cat exp
//  sur               gen por ret sub sur cat exp
//  cat           gen por ret sub sur cat exp
//  exp       gen por ret sub sur cat exp

fn pipe_gen(inp: &DispatchInputs<'_>, e: usize) -> f32 {
    let s = inp.slots;
    let expect = inp.g_expect[e];
    let mut fallback = s.at(e, 11) + s.at(e, 13); // sur + exp
    if fallback > 0.0 && fallback < expect {
        fallback = 0.0;
    }
    let mut x = s.at(e, 7) * s.at(e, 10); // gen * sub
    if x.abs() <= 0.1 {
        x = fallback;
    }
    if inp.por_linked[e] != 0 && s.at(e, 8) == 0.0 {
        x = fallback;
    }
    x
}

fn pipe_por(inp: &DispatchInputs<'_>, e: usize, countdown: &mut i16) -> f32 {
    let s = inp.slots;
    let expect = inp.g_expect[e];
    let por_linked = inp.por_linked[e] != 0;
    let old_countdown = inp.g_countdown[e];

    // the failure countdown resets while there is no sub request, or while a
    // por-linked predecessor has not fired
    let reset = s.at(e, 9) <= 0.0 || (por_linked && s.at(e, 7) <= 0.0);
    *countdown = if reset {
        inp.g_wait[e]
    } else {
        (old_countdown - 1).max(-1)
    };

    let cond = b(!por_linked || s.at(e, 7) > 0.0) * b(s.at(e, 9) > 0.0);

    let mut x = s.at(e, 10); // sur
    x += b(s.at(e, 6) > 0.1); // gen loop
    if old_countdown <= 0 && x < expect {
        x = -1.0; // timeout
    }
    x *= cond;
    x += s.at(e, 7) * b(s.at(e, 9) == 0.0) * b(s.at(e, 10) == 0.0); // search
    if x >= expect {
        *countdown = inp.g_wait[e];
    }
    x
}

fn pipe_ret(inp: &DispatchInputs<'_>, e: usize) -> f32 {
    let s = inp.slots;
    b(s.at(e, 6) < 0.0) + s.at(e, 7) * b(s.at(e, 8) == 0.0) * b(s.at(e, 9) == 0.0)
}

fn pipe_sub(inp: &DispatchInputs<'_>, e: usize) -> f32 {
    let s = inp.slots;
    let por_linked = inp.por_linked[e] != 0;
    let cond = b(!por_linked || s.at(e, 5) > 0.0) * b(s.at(e, 4) == 0.0);
    (s.at(e, 7) + s.at(e, 9)) * cond
}

fn pipe_sur(inp: &DispatchInputs<'_>, e: usize, countdown: &mut i16) -> f32 {
    let s = inp.slots;
    let expect = inp.g_expect[e];
    let por_linked = inp.por_linked[e] != 0;
    let old_countdown = inp.g_countdown[e];

    let reset = s.at(e, 6) <= 0.0 || (por_linked && s.at(e, 4) <= 0.0);
    *countdown = if reset {
        inp.g_wait[e]
    } else {
        (old_countdown - 1).max(-1)
    };

    let cond = !por_linked || s.at(e, 4) > 0.0;

    let mut x = s.at(e, 7); // sur
    x += b(s.at(e, 3) > 0.2); // gen loop
    x += s.at(e, 9) * s.at(e, 6); // exp * sub
    if x > 0.0 && x < expect {
        x = 0.0;
    }
    if old_countdown <= 0 && x < expect {
        x = -1.0; // timeout
    }
    if x >= expect {
        *countdown = inp.g_wait[e];
    }
    if inp.ret_linked[e] != 0 {
        x *= s.at(e, 5);
    }
    x * b(cond)
}

fn pipe_cat(inp: &DispatchInputs<'_>, e: usize) -> f32 {
    let s = inp.slots;
    let por_linked = inp.por_linked[e] != 0;
    let cond = b(!por_linked || s.at(e, 3) > 0.0) * b(s.at(e, 2) == 0.0);
    let bubbled = s.at(e, 6).max(0.0).min(1.0) + s.at(e, 5) + s.at(e, 7);
    bubbled * cond + s.at(e, 7) * b(s.at(e, 5) == 0.0) * b(s.at(e, 6) == 0.0)
}

fn pipe_exp(inp: &DispatchInputs<'_>, e: usize) -> f32 {
    let s = inp.slots;
    s.at(e, 5) + s.at(e, 7) + b(s.at(e, 2) * s.at(e, 4) > 0.2)
}

// LSTM slot columns, by the shifted-view frame of each gate element:
//
//        0   1   2   3   4   5   6   7   8   9   10  11  12  13
//  gen                               gen por gin gou gfg
//  por                           gen por gin gou gfg
//  gin                       gen por gin gou gfg
//  gou                   gen por gin gou gfg
//  gfg               gen por gin gou gfg

fn lstm_sampling(inp: &DispatchInputs<'_>, e: usize) -> bool {
    inp.step % 3 == 0 && (!inp.has_sampling_activators || inp.g_factor[e] > 0.99)
}

fn lstm_gen(inp: &DispatchInputs<'_>, e: usize) -> f32 {
    if !lstm_sampling(inp, e) {
        return inp.a_prev[e];
    }
    let s = inp.slots;
    let t = inp.thetas;
    let cell = s.at(e, 7);
    let net_c = s.at(e, 8) + t.at(e, 8);
    let net_in = s.at(e, 9) + t.at(e, 9);
    let net_phi = s.at(e, 11) + t.at(e, 11);
    let g = 4.0 * sigmoid(net_c) - 2.0;
    cell * sigmoid(net_phi) + g * sigmoid(net_in)
}

fn lstm_por(inp: &DispatchInputs<'_>, e: usize) -> f32 {
    if !lstm_sampling(inp, e) {
        return inp.a_prev[e];
    }
    let s = inp.slots;
    let t = inp.thetas;
    let cell = s.at(e, 6);
    let net_c = s.at(e, 7) + t.at(e, 7);
    let net_in = s.at(e, 8) + t.at(e, 8);
    let net_out = s.at(e, 9) + t.at(e, 9);
    let net_phi = s.at(e, 10) + t.at(e, 10);
    let g = 4.0 * sigmoid(net_c) - 2.0;
    let next_cell = cell * sigmoid(net_phi) + g * sigmoid(net_in);
    let h = 2.0 * sigmoid(next_cell) - 1.0;
    h * sigmoid(net_out)
}

fn lstm_sigma(inp: &DispatchInputs<'_>, e: usize) -> f32 {
    if !lstm_sampling(inp, e) {
        return inp.a_prev[e];
    }
    sigmoid(inp.slots.at(e, 7) + inp.thetas.at(e, 7))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shifted_view_window() {
        let a: Vec<f32> = (0..20).map(|i| i as f32).collect();
        let mut view = ShiftedView::empty();
        view.rebuild(&a);
        // column 7 is the element's own activation
        for i in 0..20 {
            assert_eq!(view.at(i, 7), a[i]);
        }
        // columns wrap modulo the vector length
        assert_eq!(view.at(0, 0), a[13]);
        assert_eq!(view.at(19, 13), a[5]);
        assert_eq!(view.at(3, 10), a[6]);
    }

    #[test]
    fn test_shifted_view_small_vector() {
        let a = [1.0, 2.0, 3.0];
        let mut view = ShiftedView::empty();
        view.rebuild(&a);
        assert_eq!(view.at(0, 7), 1.0);
        assert_eq!(view.at(2, 7), 3.0);
        assert_eq!(view.at(0, 8), 2.0);
    }
}
