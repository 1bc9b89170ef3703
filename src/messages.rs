//! Request and response payloads for every calculator operation.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Interaction shape of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pattern {
    Unary,
    ServerStreaming,
    ClientStreaming,
    Bidirectional,
}

/// The closed set of operations the calculator exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Sum,
    SquareRoot,
    PrimeDecomposition,
    ComputeAverage,
    ComputeMax,
    SumWithDeadline,
}

impl Operation {
    pub const ALL: [Operation; 6] = [
        Operation::Sum,
        Operation::SquareRoot,
        Operation::PrimeDecomposition,
        Operation::ComputeAverage,
        Operation::ComputeMax,
        Operation::SumWithDeadline,
    ];

    /// Method name used on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Sum => "Calculator.Sum",
            Operation::SquareRoot => "Calculator.SquareRoot",
            Operation::PrimeDecomposition => "Calculator.PrimeDecomposition",
            Operation::ComputeAverage => "Calculator.ComputeAverage",
            Operation::ComputeMax => "Calculator.ComputeMax",
            Operation::SumWithDeadline => "Calculator.SumWithDeadline",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.name() == name)
    }

    pub fn pattern(&self) -> Pattern {
        match self {
            Operation::Sum | Operation::SquareRoot | Operation::SumWithDeadline => Pattern::Unary,
            Operation::PrimeDecomposition => Pattern::ServerStreaming,
            Operation::ComputeAverage => Pattern::ClientStreaming,
            Operation::ComputeMax => Pattern::Bidirectional,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Request for `Sum` and `SumWithDeadline`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct SumRequest {
    pub first: i64,
    pub second: i64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct SumResponse {
    pub sum: i64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct SquareRootRequest {
    pub number: i32,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct SquareRootResponse {
    pub root: f64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrimeDecompositionRequest {
    pub number: i64,
}

/// One factor of the decomposition; the service emits one message per factor.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrimeDecompositionResponse {
    pub prime_factor: i64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComputeAverageRequest {
    pub number: i64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct ComputeAverageResponse {
    pub average: f64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComputeMaxRequest {
    pub number: i64,
}

/// A new running maximum.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComputeMaxResponse {
    pub max: i64,
}
