//! Work-group size selection for a fixed grid.
use std::cmp::Reverse;
use std::time::{Duration, Instant};

use glam::UVec3;

use crate::gpu::{CommandQueue, CompiledKernel, DeviceInfo, DispatchError};

/// Environment variable overriding the tuning strategy (`exhaustive` or `fast`).
pub const TUNING_ENV: &str = "PISTON_TUNING";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TuningType {
    /// Profile candidate work groups on the device and keep the fastest.
    #[default]
    Exhaustive,
    /// Pick a work group from device properties alone.
    Fast,
}

impl TuningType {
    pub fn from_env() -> Option<Self> {
        let value = std::env::var(TUNING_ENV).ok()?;
        match value.to_ascii_lowercase().as_str() {
            "exhaustive" => Some(TuningType::Exhaustive),
            "fast" => Some(TuningType::Fast),
            other => {
                log::warn!("Ignoring unknown {TUNING_ENV} value `{other}`");
                None
            }
        }
    }
}

/// Bounds on exhaustive tuning. The time limit is checked between candidates, so at
/// least one candidate is always profiled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TuningBudget {
    pub max_candidates: usize,
    pub time_limit: Duration,
}

impl Default for TuningBudget {
    fn default() -> Self {
        Self {
            max_candidates: 64,
            time_limit: Duration::from_millis(500),
        }
    }
}

pub struct TuningParameters<'a> {
    pub queue: &'a mut dyn CommandQueue,
    pub device: &'a DeviceInfo,
    pub tuning_type: TuningType,
    pub budget: TuningBudget,
}

impl<'a> TuningParameters<'a> {
    /// Default budget; the strategy comes from `PISTON_TUNING` if set.
    pub fn new(queue: &'a mut dyn CommandQueue, device: &'a DeviceInfo) -> Self {
        Self {
            queue,
            device,
            tuning_type: TuningType::from_env().unwrap_or_default(),
            budget: TuningBudget::default(),
        }
    }

    pub fn with_type(mut self, tuning_type: TuningType) -> Self {
        self.tuning_type = tuning_type;
        self
    }

    pub fn with_budget(mut self, budget: TuningBudget) -> Self {
        self.budget = budget;
        self
    }
}

fn prev_power_of_two(v: u32) -> u32 {
    if v == 0 { 0 } else { 1 << (31 - v.leading_zeros()) }
}

/// Largest power-of-two extent worth trying per axis.
fn axis_limits(device: &DeviceInfo, grid: UVec3) -> UVec3 {
    let max = device.max_work_group_size;
    let invocations = prev_power_of_two(device.max_work_group_invocations).max(1);
    let fit = |extent: u32, limit: u32| {
        extent
            .max(1)
            .next_power_of_two()
            .min(prev_power_of_two(limit).max(1))
            .min(invocations)
    };
    UVec3::new(fit(grid.x, max.x), fit(grid.y, max.y), fit(grid.z, max.z))
}

/// Power-of-two work groups that fit the device and are not oversized for `grid`.
///
/// Candidates launch at least 32 invocations unless the grid is smaller than that.
/// Ordered from most to least preferred: more invocations first, then wider x.
pub fn work_group_candidates(device: &DeviceInfo, grid: UVec3) -> Vec<UVec3> {
    let limits = axis_limits(device, grid);
    let invocations = prev_power_of_two(device.max_work_group_invocations).max(1);
    let min_total = 32u32.min(limits.element_product()).min(invocations);

    let mut candidates = Vec::new();
    let mut z = 1;
    while z <= limits.z {
        let mut y = 1;
        while y <= limits.y {
            let mut x = 1;
            while x <= limits.x {
                let total = x * y * z;
                if total >= min_total && total <= device.max_work_group_invocations {
                    candidates.push(UVec3::new(x, y, z));
                }
                x *= 2;
            }
            y *= 2;
        }
        z *= 2;
    }
    candidates.sort_by_key(|c| (Reverse(c.element_product()), Reverse(c.x), Reverse(c.y)));
    candidates
}

/// Work group chosen without profiling: x up to the vendor's wave size, then y and z
/// fill the remaining invocations.
pub fn fast_work_group(device: &DeviceInfo, grid: UVec3) -> UVec3 {
    let limits = axis_limits(device, grid);
    let invocations = prev_power_of_two(device.max_work_group_invocations).max(1);
    let wave = prev_power_of_two(device.vendor.preferred_wave_size()).max(1);

    let x = limits.x.min(wave);
    let y = limits.y.min((invocations / x).max(1));
    let z = limits.z.min((invocations / (x * y)).max(1));
    UVec3::new(x, y, z)
}

/// Returns the work-group size to use for `kernel` over `grid`.
///
/// In exhaustive mode every candidate within budget is profiled and the fastest wins;
/// on ties the earlier, preferred candidate is kept. Profiling errors propagate.
pub fn get_best_work_group(
    params: &mut TuningParameters<'_>,
    kernel: &CompiledKernel,
    grid: UVec3,
) -> Result<UVec3, DispatchError> {
    if params.tuning_type == TuningType::Fast {
        return Ok(fast_work_group(params.device, grid));
    }

    let candidates = work_group_candidates(params.device, grid);
    let start = Instant::now();
    let mut best: Option<(UVec3, Duration)> = None;
    for (i, work_group) in candidates
        .into_iter()
        .take(params.budget.max_candidates)
        .enumerate()
    {
        if i > 0 && start.elapsed() > params.budget.time_limit {
            log::debug!("Tuning of {} stopped after {i} candidates", kernel.key());
            break;
        }
        let elapsed = params.queue.profile(kernel, grid, work_group)?;
        log::trace!("{} {work_group}: {elapsed:?}", kernel.key());
        if best.is_none_or(|(_, fastest)| elapsed < fastest) {
            best = Some((work_group, elapsed));
        }
    }
    Ok(best
        .map(|(work_group, _)| work_group)
        .unwrap_or_else(|| fast_work_group(params.device, grid)))
}
