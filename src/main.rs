// ========================================================================================
//
//                      THE VERIFICATION AND BENCHMARK HARNESS
//
// ========================================================================================
//
// This binary drives the parallel engine against the scalar oracle. It owns the whole
// run lifecycle: argument parsing, seeded input generation, timing both paths, and an
// accuracy gate whose tolerances depend on the element type and the exponent. The
// engine itself never sees any of this; the harness talks to it exclusively through
// the public operator surface.

use clap::{Parser, ValueEnum};
use half::f16;
use pairdist::operator;
use pairdist::plan::Platform;
use pairdist::reference;
use pairdist::types::{DType, Element};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::process;
use std::time::Instant;

// ========================================================================================
//                         COMMAND-LINE INTERFACE DEFINITION
// ========================================================================================

#[derive(Parser, Debug)]
#[clap(
    name = "pairdist",
    version,
    about = "A high-performance parallel engine for pairwise Minkowski distance computation."
)]
struct Args {
    /// Number of input vectors (rows).
    n: usize,

    /// Vector dimension (row width).
    m: usize,

    /// Minkowski exponent: a non-negative float, or `inf` for Chebyshev.
    #[clap(default_value = "2.0")]
    p: String,

    /// Element type of the input matrix.
    #[clap(value_enum, default_value = "f32")]
    dtype: ElementKind,

    /// Pin the number of compute units instead of using every available core.
    #[clap(long)]
    units: Option<usize>,

    /// Seed for the random input matrix.
    #[clap(long, default_value_t = 2023)]
    seed: u64,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ElementKind {
    F32,
    F16,
}

// ========================================================================================
//                           THE MAIN ORCHESTRATION LOGIC
// ========================================================================================

fn main() {
    env_logger::init();
    let args = Args::parse();

    let p = match parse_exponent(&args.p) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Error parsing exponent '{}': {}", args.p, e);
            process::exit(1);
        }
    };

    let platform = match args.units {
        Some(units) => Platform::with_units(units),
        None => Platform::detect(),
    };
    let platform = match platform {
        Ok(platform) => platform,
        Err(e) => {
            eprintln!("Fatal error during platform detection: {}", e);
            process::exit(1);
        }
    };

    eprintln!(
        ">>> Running: N={}, M={}, P={}, DTYPE={:?}, units={}",
        args.n,
        args.m,
        args.p,
        args.dtype,
        platform.total_units()
    );

    let passed = match args.dtype {
        ElementKind::F32 => run_case::<f32>(&args, p, &platform),
        ElementKind::F16 => run_case::<f16>(&args, p, &platform),
    };

    if passed {
        eprintln!("[PASS]");
    } else {
        eprintln!("[FAIL]");
        process::exit(1);
    }
}

fn run_case<T: Element>(args: &Args, p: f32, platform: &Platform) -> bool {
    // --- Phase 1: Seeded input generation ---
    let mut rng = StdRng::seed_from_u64(args.seed);
    let x: Vec<T> = (0..args.n * args.m)
        .map(|_| T::from_f32(rng.gen_range(-10.0f32..10.0)))
        .collect();

    // --- Phase 2: Scalar oracle ---
    let start = Instant::now();
    let expected = reference::pdist(&x, args.n, args.m, p);
    let oracle_ms = start.elapsed().as_secs_f64() * 1e3;
    eprintln!("> CPU reference completed in {:.4} ms", oracle_ms);

    // --- Phase 3: Parallel engine ---
    let start = Instant::now();
    let actual = match operator::run(&x, args.n, args.m, Some(p), platform) {
        Ok(actual) => actual,
        Err(e) => {
            eprintln!("Fatal error during engine launch: {}", e);
            return false;
        }
    };
    let engine_ms = start.elapsed().as_secs_f64() * 1e3;
    eprintln!("> Parallel engine completed in {:.4} ms", engine_ms);
    if engine_ms > 0.0 {
        eprintln!("> Speedup over reference: {:.2}x", oracle_ms / engine_ms);
    }

    // --- Phase 4: Accuracy gate ---
    check_accuracy(&expected, &actual, p)
}

// ========================================================================================
//                                 ACCURACY GATE
// ========================================================================================

/// A mismatch must exceed the tolerance both absolutely and relative to the
/// expected magnitude before it counts. f16 outputs get a wider gate, and so
/// do exponents above 2, whose log/exp compute path is intrinsically noisier.
fn check_accuracy<T: Element>(expected: &[T], actual: &[T], p: f32) -> bool {
    let mut epsilon: f64 = match T::DTYPE {
        DType::F32 => 1e-4,
        DType::F16 => 1e-2,
    };
    if p > 2.0 {
        epsilon *= 5.0;
    }

    let mut max_err = 0.0f64;
    let mut err_count = 0usize;
    for (idx, (want, got)) in expected.iter().zip(actual).enumerate() {
        let want = want.to_f64();
        let got = got.to_f64();
        let diff = (want - got).abs();
        if diff > epsilon && diff / (want.abs() + 1e-9) > epsilon {
            if err_count < 5 {
                eprintln!(
                    "[ERROR] Mismatch at index {}: expected {}, got {}, diff {}",
                    idx, want, got, diff
                );
            }
            err_count += 1;
        }
        max_err = max_err.max(diff);
    }

    eprintln!("[INFO] Max abs error: {:e}", max_err);
    if err_count > 0 {
        eprintln!("[FAIL] Total {} mismatches found.", err_count);
        return false;
    }
    true
}

fn parse_exponent(raw: &str) -> Result<f32, String> {
    if raw.eq_ignore_ascii_case("inf") {
        return Ok(f32::INFINITY);
    }
    let p: f32 = raw
        .parse()
        .map_err(|e| format!("not a float or 'inf': {}", e))?;
    if p.is_nan() || p < 0.0 {
        return Err("exponent must be non-negative".to_string());
    }
    Ok(p)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponent_parsing_accepts_floats_and_inf() {
        assert_eq!(parse_exponent("2.0").unwrap(), 2.0);
        assert_eq!(parse_exponent("0.5").unwrap(), 0.5);
        assert!(parse_exponent("inf").unwrap().is_infinite());
        assert!(parse_exponent("INF").unwrap().is_infinite());
        assert!(parse_exponent("-1").is_err());
        assert!(parse_exponent("nan").is_err());
        assert!(parse_exponent("three").is_err());
    }

    #[test]
    fn accuracy_gate_counts_only_genuine_mismatches() {
        // Relative slack: a large value off by a hair passes.
        let expected = [1000.0f32, 5.0];
        assert!(check_accuracy(&expected, &[1000.05, 5.0], 2.0));
        // An absolute-and-relative violation fails.
        assert!(!check_accuracy(&expected, &[1000.0, 6.0], 2.0));
        // The wider general-p gate forgives more.
        assert!(check_accuracy(&[10.0f32], &[10.004], 3.0));
        assert!(!check_accuracy(&[10.0f32], &[10.004], 2.0));
    }
}
