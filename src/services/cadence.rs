use log::error;
use std::thread;
use std::time::{Duration, Instant};

use crate::services::reconcile::CycleError;

/// Run `tick` every `interval` until it fails fatally. Other failures are
/// logged and the loop carries on with the next tick.
pub fn run_every(
    label: &str,
    interval: Duration,
    mut tick: impl FnMut() -> Result<(), CycleError>,
) -> Result<(), String> {
    loop {
        let tick_start = Instant::now();

        if let Err(e) = tick() {
            if e.is_fatal() {
                return Err(format!("{} cycle: {}", label, e));
            }
            error!("{} cycle failed: {}", label, e);
        }

        // Maintain steady cadence
        let elapsed = tick_start.elapsed();
        if elapsed < interval {
            thread::sleep(interval - elapsed);
        }
    }
}
