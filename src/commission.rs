/// Commission on a fill, in cents, rounded half-up.
///
/// `gross = amount * price_cents` is the trade value in cents; the commission
/// is `gross * rate_ppm / 1_000_000`, which for the default 1000 ppm rate is
/// the venue's 0.1% of notional.
pub fn commission_cents(amount: i64, price_cents: i64, rate_ppm: i64) -> i64 {
    if amount <= 0 || price_cents <= 0 || rate_ppm <= 0 {
        return 0;
    }
    let gross = amount.saturating_mul(price_cents);
    let scaled = gross.saturating_mul(rate_ppm);
    (scaled + 500_000) / 1_000_000
}
