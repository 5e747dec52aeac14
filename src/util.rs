//! Useful traits and other utilities that don't really belong anywhere else.

use retry::{delay::NoDelay, retry, OperationResult};

/// Run `operation` up to `attempts` times, back to back, until it succeeds or gives up.
///
/// `OperationResult::Retry` asks for another attempt; once attempts run out, the error carried by
/// the last `Retry` is returned. `OperationResult::Err` stops immediately.
pub fn bounded<T, E, O>(attempts: usize, operation: O) -> Result<T, E>
where
    O: FnMut() -> OperationResult<T, E>,
{
    retry(NoDelay.take(attempts.saturating_sub(1)), operation)
        .map_err(|retry::Error { error, .. }| error)
}

#[test]
fn test_bounded() {
    let mut calls = 0;
    let result: Result<u32, &str> = bounded(10, || {
        calls += 1;
        match calls {
            3 => OperationResult::Ok(calls),
            _ => OperationResult::Retry("again"),
        }
    });
    assert_eq!(result, Ok(3));

    calls = 0;
    let result: Result<u32, &str> = bounded(10, || {
        calls += 1;
        OperationResult::Retry("again")
    });
    assert_eq!(result, Err("again"));
    assert_eq!(calls, 10);

    calls = 0;
    let result: Result<u32, &str> = bounded(10, || {
        calls += 1;
        OperationResult::Err("fatal")
    });
    assert_eq!(result, Err("fatal"));
    assert_eq!(calls, 1);
}
