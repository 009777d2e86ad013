use fixed::types::I32F32;

/// Q32.32 fixed-point: 32 integer bits, 32 fractional bits.
///
/// Every resource amount, rate, efficiency and progress value in the engine
/// uses this type so both periodic loops produce identical results on every
/// platform.
pub type Fixed64 = I32F32;

/// Ticks are the atomic unit of simulation time. One tick is one
/// millisecond of simulated time.
pub type Ticks = u64;

/// Convert an f64 to Fixed64. Use only for initialization, never in the loops.
#[inline]
pub fn f64_to_fixed64(v: f64) -> Fixed64 {
    Fixed64::from_num(v)
}

/// Convert Fixed64 to f64. Use only for display and tests.
#[inline]
pub fn fixed64_to_f64(v: Fixed64) -> f64 {
    v.to_num::<f64>()
}

/// Convert a tick count to Fixed64, saturating at the largest representable value.
#[inline]
pub fn ticks_to_fixed(t: Ticks) -> Fixed64 {
    Fixed64::saturating_from_num(t)
}

/// Round a non-negative fixed-point value up to whole ticks.
pub fn ceil_to_ticks(v: Fixed64) -> Ticks {
    if v <= Fixed64::ZERO {
        return 0;
    }
    let whole: i64 = v.to_num();
    let ceiled = if v.frac() > Fixed64::ZERO { whole + 1 } else { whole };
    ceiled.max(0) as Ticks
}

/// Sum an iterator of fixed-point values, saturating instead of overflowing.
pub fn saturating_sum(values: impl IntoIterator<Item = Fixed64>) -> Fixed64 {
    values
        .into_iter()
        .fold(Fixed64::ZERO, |acc, v| acc.saturating_add(v))
}
