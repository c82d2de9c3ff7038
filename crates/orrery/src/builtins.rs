use std::f64::consts::PI;

use crate::object::NativeFn;

/// Constants installed on registry construction.
pub(crate) const CONSTANTS: &[(&str, f64)] = &[
    ("math::pi", PI),
    ("math::π", PI),
    ("physics::kB", 1.380_649e-23),
    ("physics::h", 6.626_070_15e-34),
    ("physics::c", 299_792_458.0),
];

fn log2(x: f64) -> f64 {
    x.log2()
}

fn log10(x: f64) -> f64 {
    x.log10()
}

/// Unary functions installed on registry construction. The short
/// hyperbolic spellings (`ch`, `ash`, ...) alias their long forms; `log`
/// is decimal and `lg` binary.
pub(crate) const UNARY_FUNCTIONS: &[(&str, fn(f64) -> f64)] = &[
    ("cos", f64::cos),
    ("sin", f64::sin),
    ("tan", f64::tan),
    ("acos", f64::acos),
    ("asin", f64::asin),
    ("atan", f64::atan),
    ("cosh", f64::cosh),
    ("sinh", f64::sinh),
    ("tanh", f64::tanh),
    ("ch", f64::cosh),
    ("sh", f64::sinh),
    ("th", f64::tanh),
    ("acosh", f64::acosh),
    ("asinh", f64::asinh),
    ("atanh", f64::atanh),
    ("ach", f64::acosh),
    ("ash", f64::asinh),
    ("ath", f64::atanh),
    ("sqrt", f64::sqrt),
    ("log", log10),
    ("lg", log2),
    ("ln", f64::ln),
    ("abs", f64::abs),
    ("exp", f64::exp),
    ("floor", f64::floor),
    ("ceil", f64::ceil),
    ("erf", libm::erf),
    ("erfc", libm::erfc),
    ("gamma", libm::tgamma),
    ("Γ", libm::tgamma),
];

fn add(a: f64, b: f64) -> f64 {
    a + b
}

fn subtract(a: f64, b: f64) -> f64 {
    a - b
}

fn multiply(a: f64, b: f64) -> f64 {
    a * b
}

fn divide(a: f64, b: f64) -> f64 {
    a / b
}

fn power(a: f64, b: f64) -> f64 {
    a.powf(b)
}

/// Binary operators surfaced as registry objects named after their
/// glyph, so `+` and friends resolve like any other callable.
pub(crate) const BINARY_FUNCTIONS: &[(&str, fn(f64, f64) -> f64)] = &[
    ("+", add),
    ("-", subtract),
    ("*", multiply),
    ("/", divide),
    ("^", power),
];

pub(crate) fn unary(f: fn(f64) -> f64) -> NativeFn {
    NativeFn::Unary(f)
}

pub(crate) fn binary(f: fn(f64, f64) -> f64) -> NativeFn {
    NativeFn::Binary(f)
}
