/// Decimal places of the chain's base coin unit.
pub const COIN_DECIMALS: u32 = 8;

pub fn format_coin_amount(amount: u64, decimals: u32) -> String {
    let scale = 10u64.pow(decimals);
    if decimals == 0 {
        return amount.to_string();
    }
    format!(
        "{}.{:0width$}",
        amount / scale,
        amount % scale,
        width = decimals as usize
    )
}
