//! 订单号 Luhn 校验
//!
//! 订单号在进入系统之前必须通过 Luhn 校验：从右往左每隔一位翻倍，
//! 超过 9 则减 9，累加和能被 10 整除即合法。
//! 上传订单和核销积分共用这一校验。

/// 校验订单号是否为合法的 Luhn 数字串
///
/// 空串或含非数字字符的串一律视为不合法。
pub fn is_valid(number: &str) -> bool {
    if number.is_empty() {
        return false;
    }

    let mut sum: u32 = 0;
    let mut double = false;

    for ch in number.chars().rev() {
        let Some(digit) = ch.to_digit(10) else {
            return false;
        };

        let mut value = digit;
        if double {
            value *= 2;
            if value > 9 {
                value -= 9;
            }
        }
        sum += value;
        double = !double;
    }

    sum % 10 == 0
}
