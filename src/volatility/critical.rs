//! Two-sided critical values for a target coverage.

use crate::error::{check_coverage, ForecastResult};

const Z_90: f64 = 1.644_853_626_951_472_2;
const Z_95: f64 = 1.959_963_984_540_054;
const Z_99: f64 = 2.575_829_303_548_900_4;

/// Degrees of freedom above which Student-t collapses to the normal.
const T_NORMAL_CUTOFF: f64 = 100.0;

/// `Φ⁻¹(1 − (1 − coverage)/2)`.
///
/// Exact for 0.90 / 0.95 / 0.99, Beasley-Springer-Moro otherwise.
pub fn normal_critical(coverage: f64) -> ForecastResult<f64> {
    check_coverage(coverage)?;
    for (c, z) in [(0.90, Z_90), (0.95, Z_95), (0.99, Z_99)] {
        if (coverage - c).abs() < 1e-12 {
            return Ok(z);
        }
    }
    Ok(inverse_normal_cdf(1.0 - (1.0 - coverage) / 2.0))
}

/// Student-t critical value via the variance-inflation approximation
/// `z · sqrt(df / (df − 2))`.
///
/// Infinite for `df <= 2` (the variance does not exist), normal for
/// `df >= 100`.
pub fn student_t_critical(df: f64, coverage: f64) -> ForecastResult<f64> {
    let z = normal_critical(coverage)?;
    if df.is_nan() || df <= 2.0 {
        return Ok(f64::INFINITY);
    }
    if df >= T_NORMAL_CUTOFF {
        return Ok(z);
    }
    Ok(z * (df / (df - 2.0)).sqrt())
}

/// Beasley-Springer-Moro inverse of the standard normal CDF.
pub fn inverse_normal_cdf(p: f64) -> f64 {
    const A: [f64; 4] = [
        2.506_628_238_84,
        -18.615_000_625_29,
        41.391_197_735_34,
        -25.441_060_496_37,
    ];
    const B: [f64; 4] = [
        -8.473_510_930_90,
        23.083_367_437_43,
        -21.062_241_018_26,
        3.130_829_098_33,
    ];
    const C: [f64; 9] = [
        0.337_475_482_272_614_7,
        0.976_169_019_091_718_6,
        0.160_797_971_491_820_9,
        0.027_643_881_033_386_3,
        0.003_840_572_937_360_9,
        0.000_395_189_651_191_9,
        0.000_032_176_788_176_8,
        0.000_000_288_816_736_4,
        0.000_000_396_031_518_7,
    ];

    if p <= 0.0 {
        return f64::NEG_INFINITY;
    }
    if p >= 1.0 {
        return f64::INFINITY;
    }

    let y = p - 0.5;
    if y.abs() < 0.42 {
        let r = y * y;
        let num = y * (((A[3] * r + A[2]) * r + A[1]) * r + A[0]);
        let den = (((B[3] * r + B[2]) * r + B[1]) * r + B[0]) * r + 1.0;
        return num / den;
    }

    let tail = if y > 0.0 { 1.0 - p } else { p };
    let r = (-tail.ln()).ln();
    let x = C
        .iter()
        .rev()
        .fold(0.0, |acc, c| acc * r + c);
    if y < 0.0 {
        -x
    } else {
        x
    }
}
