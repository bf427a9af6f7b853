use std::thread;

use crate::config::RetryPolicy;
use crate::transport::TransportError;

/// 按策略重试 transport 调用
///
/// 只有 `is_retryable` 的错误会重试；返回结果和已重试次数
pub fn with_retry<T>(
    policy: RetryPolicy,
    what: &str,
    mut op: impl FnMut() -> Result<T, TransportError>,
) -> (Result<T, TransportError>, u32) {
    let attempts = policy.attempts.max(1);
    let mut retries = 0;
    loop {
        match op() {
            Ok(value) => return (Ok(value), retries),
            Err(e) if e.is_retryable() && retries + 1 < attempts => {
                retries += 1;
                log::warn!(
                    "{} failed ({}), retry {}/{} in {:?}",
                    what,
                    e,
                    retries,
                    attempts - 1,
                    policy.backoff
                );
                thread::sleep(policy.backoff);
            }
            Err(e) => return (Err(e), retries),
        }
    }
}
