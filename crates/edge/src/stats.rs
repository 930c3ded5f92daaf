//! Binomial statistics used by the edge gate.
//!
//! Implemented from first principles:
//! - Lanczos approximation for ln(Gamma)
//! - Wilson score interval for a binomial proportion
//! - Exact one-sided binomial test (upper tail)

/// Two-sided 95% normal quantile.
pub const Z_95: f64 = 1.959_963_984_540_054;

/// Lanczos approximation for ln(Gamma(x)), g=7, n=9.
pub(crate) fn ln_gamma(x: f64) -> f64 {
    #[allow(clippy::excessive_precision)]
    const COEFFICIENTS: [f64; 9] = [
        0.99999999999980993,
        676.5203681218851,
        -1259.1392167224028,
        771.32342877765313,
        -176.61502916214059,
        12.507343278686905,
        -0.13857109526572012,
        9.9843695780195716e-6,
        1.5056327351493116e-7,
    ];
    const G: f64 = 7.0;

    if x < 0.5 {
        // Reflection formula: Gamma(x) * Gamma(1-x) = pi / sin(pi*x)
        let sin_val = (std::f64::consts::PI * x).sin();
        if sin_val.abs() < 1e-300 {
            return f64::INFINITY;
        }
        return std::f64::consts::PI.ln() - sin_val.abs().ln() - ln_gamma(1.0 - x);
    }

    let x = x - 1.0;
    let mut sum = COEFFICIENTS[0];
    for (i, &c) in COEFFICIENTS.iter().enumerate().skip(1) {
        sum += c / (x + i as f64);
    }

    let t = x + G + 0.5;
    let log_sqrt_2pi = (2.0 * std::f64::consts::PI).sqrt().ln();

    log_sqrt_2pi + (t.ln() * (x + 0.5)) - t + sum.ln()
}

fn ln_choose(n: usize, k: usize) -> f64 {
    ln_gamma(n as f64 + 1.0) - ln_gamma(k as f64 + 1.0) - ln_gamma((n - k) as f64 + 1.0)
}

/// Wilson score interval for `successes` out of `trials` at normal quantile `z`.
///
/// Closed form; stays inside [0, 1] and always contains the observed rate.
/// With zero trials the interval is the uninformative [0, 1].
pub fn wilson_interval(successes: usize, trials: usize, z: f64) -> (f64, f64) {
    if trials == 0 {
        return (0.0, 1.0);
    }
    let n = trials as f64;
    let p = successes.min(trials) as f64 / n;
    let z2 = z * z;

    let denom = 1.0 + z2 / n;
    let center = (p + z2 / (2.0 * n)) / denom;
    let margin = z * (p * (1.0 - p) / n + z2 / (4.0 * n * n)).sqrt() / denom;

    // Rounding can push a bound a hair past the observed rate at p = 0 or 1.
    let lower = (center - margin).min(p).max(0.0);
    let upper = (center + margin).max(p).min(1.0);
    (lower, upper)
}

/// One-sided binomial test p-value: P(X >= successes) for X ~ Binomial(trials, p0).
pub fn binomial_p_value(successes: usize, trials: usize, p0: f64) -> f64 {
    if successes == 0 {
        return 1.0;
    }
    if successes > trials {
        return 0.0;
    }
    if p0 <= 0.0 {
        return 0.0;
    }
    if p0 >= 1.0 {
        return 1.0;
    }

    let ln_p = p0.ln();
    let ln_q = (1.0 - p0).ln();
    let tail: f64 = (successes..=trials)
        .map(|i| (ln_choose(trials, i) + i as f64 * ln_p + (trials - i) as f64 * ln_q).exp())
        .sum();
    tail.clamp(0.0, 1.0)
}
