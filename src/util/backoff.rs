use std::time::Duration;

use rand::Rng;

/// 第 attempt 次（從 0 起算）重試前的退避延遲：
/// 基礎延遲乘上 2 的 attempt 次方，封頂後再套用 ±20% 抖動。
pub fn delay_for(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    let exponential = base.saturating_mul(factor);
    jittered(exponential.min(cap))
}

/// ±20% 抖動，錯開多個重試端醒來的時間。
pub fn jittered(delay: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.8..=1.2);
    delay.mul_f64(factor)
}
