//! Stock jobs served by the `taskkit` binary
//!
//! Small arithmetic and sleep jobs, handy for exercising process-mode maps
//! end to end.

use std::thread;
use std::time::Duration;
use thiserror::Error;

use crate::error::BoxError;
use crate::worker::{Job, JobRegistry};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ArithmeticError {
    #[error("division by zero: {dividend} / 0")]
    DivisionByZero { dividend: i64 },

    #[error("integer overflow in {op}")]
    Overflow { op: &'static str },
}

/// `x -> 2x`
#[derive(Debug, Clone, Copy, Default)]
pub struct Double;

impl Job for Double {
    const NAME: &'static str = "double";
    type Input = i64;
    type Output = i64;

    fn run(&self, x: i64) -> Result<i64, BoxError> {
        Ok(x.checked_mul(2).ok_or(ArithmeticError::Overflow { op: "double" })?)
    }
}

/// `(a, b) -> a * b`
#[derive(Debug, Clone, Copy, Default)]
pub struct Multiply;

impl Job for Multiply {
    const NAME: &'static str = "multiply";
    type Input = (i64, i64);
    type Output = i64;

    fn run(&self, (a, b): (i64, i64)) -> Result<i64, BoxError> {
        Ok(a.checked_mul(b).ok_or(ArithmeticError::Overflow { op: "multiply" })?)
    }
}

/// `(a, b) -> a / b`, failing when `b` is zero
#[derive(Debug, Clone, Copy, Default)]
pub struct Divide;

impl Job for Divide {
    const NAME: &'static str = "divide";
    type Input = (i64, i64);
    type Output = i64;

    fn run(&self, (a, b): (i64, i64)) -> Result<i64, BoxError> {
        if b == 0 {
            return Err(ArithmeticError::DivisionByZero { dividend: a }.into());
        }
        Ok(a.checked_div(b).ok_or(ArithmeticError::Overflow { op: "divide" })?)
    }
}

/// Sleep for the given number of milliseconds and return it
#[derive(Debug, Clone, Copy, Default)]
pub struct Nap;

impl Job for Nap {
    const NAME: &'static str = "nap";
    type Input = u64;
    type Output = u64;

    fn run(&self, millis: u64) -> Result<u64, BoxError> {
        thread::sleep(Duration::from_millis(millis));
        Ok(millis)
    }
}

/// Registry holding every stock job
pub fn registry() -> JobRegistry {
    JobRegistry::new()
        .register(Double)
        .register(Multiply)
        .register(Divide)
        .register(Nap)
}
