//! The concrete calculator engine.

use async_trait::async_trait;
use tracing::debug;

use crate::channel::{CallContext, RequestStream, ResponseSink};
use crate::config::CalculatorConfig;
use crate::deadline;
use crate::messages::*;
use crate::service::CalculatorService;
use crate::status::Status;

/// Trial divisions between deadline checks while decomposing.
const DIVISIONS_PER_CHECK: u32 = 10_000;

/// Stateless calculator. Every aggregate lives inside a single handler
/// invocation.
#[derive(Debug, Clone, Default)]
pub struct Calculator {
    config: CalculatorConfig,
}

impl Calculator {
    pub fn new(config: CalculatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CalculatorConfig {
        &self.config
    }
}

#[async_trait]
impl CalculatorService for Calculator {
    async fn sum(&self, request: SumRequest) -> Result<SumResponse, Status> {
        debug!(first = request.first, second = request.second, "sum");
        Ok(SumResponse {
            sum: request.first.wrapping_add(request.second),
        })
    }

    async fn square_root(&self, request: SquareRootRequest) -> Result<SquareRootResponse, Status> {
        if request.number < 0 {
            return Err(Status::invalid_argument(format!(
                "received a negative number: {}",
                request.number
            )));
        }
        Ok(SquareRootResponse {
            root: f64::from(request.number).sqrt(),
        })
    }

    async fn prime_decomposition(
        &self,
        request: PrimeDecompositionRequest,
        responses: &ResponseSink<PrimeDecompositionResponse>,
    ) -> Result<(), Status> {
        debug!(number = request.number, "prime decomposition");
        let ctx = responses.context();
        let mut factors = prime_factors(request.number);
        loop {
            ctx.check_deadline()?;
            match factors.advance(DIVISIONS_PER_CHECK) {
                Factoring::Factor(prime_factor) => {
                    responses.send(PrimeDecompositionResponse { prime_factor })?;
                }
                Factoring::Working => tokio::task::yield_now().await,
                Factoring::Finished => return Ok(()),
            }
        }
    }

    async fn compute_average(
        &self,
        requests: &mut RequestStream<ComputeAverageRequest>,
    ) -> Result<ComputeAverageResponse, Status> {
        let mut running = RunningAverage::default();
        while let Some(request) = requests.receive().await? {
            running.push(request.number);
        }
        debug!(count = running.count(), "average requested");
        running
            .average()
            .map(|average| ComputeAverageResponse { average })
            .ok_or_else(|| Status::invalid_argument("cannot average an empty sequence"))
    }

    async fn compute_max(
        &self,
        requests: &mut RequestStream<ComputeMaxRequest>,
        responses: &ResponseSink<ComputeMaxResponse>,
    ) -> Result<(), Status> {
        let mut running = RunningMax::default();
        while let Some(request) = requests.receive().await? {
            if let Some(max) = running.observe(request.number) {
                responses.send(ComputeMaxResponse { max })?;
            }
        }
        Ok(())
    }

    async fn sum_with_deadline(
        &self,
        ctx: &CallContext,
        request: SumRequest,
    ) -> Result<SumResponse, Status> {
        deadline::run_steps(ctx, self.config.work_steps, self.config.work_step).await?;
        self.sum(request).await
    }
}

/// Prime factors of `number` in non-decreasing order, by trial division.
/// Numbers below 2 have no factors.
pub fn prime_factors(number: i64) -> PrimeFactors {
    PrimeFactors {
        remaining: number,
        divisor: 2,
    }
}

pub struct PrimeFactors {
    remaining: i64,
    divisor: i64,
}

/// Outcome of a bounded slice of trial division.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Factoring {
    Factor(i64),
    /// The budget ran out before the next factor was found.
    Working,
    Finished,
}

impl PrimeFactors {
    /// Runs at most `budget` trial divisions looking for the next factor.
    pub fn advance(&mut self, budget: u32) -> Factoring {
        for _ in 0..budget {
            if self.remaining <= 1 {
                return Factoring::Finished;
            }
            // Past the square root, what remains is prime.
            if self.divisor > self.remaining / self.divisor {
                let factor = self.remaining;
                self.remaining = 1;
                return Factoring::Factor(factor);
            }
            if self.remaining % self.divisor == 0 {
                self.remaining /= self.divisor;
                return Factoring::Factor(self.divisor);
            }
            self.divisor += 1;
        }
        if self.remaining <= 1 {
            Factoring::Finished
        } else {
            Factoring::Working
        }
    }
}

impl Iterator for PrimeFactors {
    type Item = i64;

    fn next(&mut self) -> Option<i64> {
        loop {
            match self.advance(u32::MAX) {
                Factoring::Factor(factor) => return Some(factor),
                Factoring::Working => {}
                Factoring::Finished => return None,
            }
        }
    }
}

/// Count and sum of the values seen so far.
#[derive(Debug, Default, Clone, Copy)]
pub struct RunningAverage {
    count: u64,
    total: i128,
}

impl RunningAverage {
    pub fn push(&mut self, value: i64) {
        self.count += 1;
        self.total += i128::from(value);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// `None` until at least one value has been pushed.
    pub fn average(&self) -> Option<f64> {
        (self.count > 0).then(|| self.total as f64 / self.count as f64)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RunningMax {
    max: Option<i64>,
}

impl RunningMax {
    /// Records `value`, returning it when it becomes the new maximum. The
    /// first value always does.
    pub fn observe(&mut self, value: i64) -> Option<i64> {
        match self.max {
            Some(max) if value <= max => None,
            _ => {
                self.max = Some(value);
                Some(value)
            }
        }
    }

    pub fn current(&self) -> Option<i64> {
        self.max
    }
}
