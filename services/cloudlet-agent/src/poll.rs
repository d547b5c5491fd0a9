//! Fixed-interval polling with cooperative cancellation.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

/// How a [`repeat_until`] loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Repeat<T> {
    /// The step produced a value.
    Done(T),
    /// The cancel signal flipped to `true` first.
    Cancelled,
}

/// Call `step` every `period` until it yields a value, fails, or `cancel`
/// becomes `true`.
///
/// The first call happens immediately. `step` must not block; each iteration
/// yields back to the scheduler until the next tick. If the cancel sender is
/// dropped, the loop keeps running without a cancellation source.
pub async fn repeat_until<T, E, F>(
    period: Duration,
    cancel: &mut watch::Receiver<bool>,
    mut step: F,
) -> Result<Repeat<T>, E>
where
    F: FnMut() -> Result<Option<T>, E>,
{
    if *cancel.borrow() {
        return Ok(Repeat::Cancelled);
    }

    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut cancel_open = true;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Some(value) = step()? {
                    return Ok(Repeat::Done(value));
                }
            }
            changed = cancel.changed(), if cancel_open => {
                match changed {
                    Ok(()) => {
                        if *cancel.borrow() {
                            return Ok(Repeat::Cancelled);
                        }
                    }
                    Err(_) => cancel_open = false,
                }
            }
        }
    }
}
