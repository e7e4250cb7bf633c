//! Bounded-step scale strategy.
//!
//! Scaling up proceeds in steps of at most [`MAX_SCALE_UP_STEP`] instances
//! per tick, bounding the blast radius of any single scale operation against
//! the cloud API and the node-join rate of the workload cluster. Scaling
//! down is immediate and unthrottled.

/// Maximum number of instances added in one tick.
pub const MAX_SCALE_UP_STEP: i64 = 5;

/// Next capacity step toward `desired` from `current`.
///
/// Never overshoots `desired` and never moves backwards while growing;
/// shrinking returns `desired` directly. Convergence when growing takes
/// `ceil((desired - current) / MAX_SCALE_UP_STEP)` ticks.
pub fn next_count(current: i64, desired: i64) -> i64 {
    if current >= desired {
        desired
    } else if desired - current > MAX_SCALE_UP_STEP {
        current + MAX_SCALE_UP_STEP
    } else {
        desired
    }
}
