//! Card processing fee schedule.
//!
//! The processor takes a variable cut plus a fixed per-charge fee, so the
//! gross charge must be upcharged from the net amount we want credited.

use super::Money;
use rust_decimal::Decimal as RustDecimal;

/// Variable processor fee: 2.9% of the gross charge.
pub fn card_fee_var() -> Money {
    Money::new(RustDecimal::new(29, 3))
}

/// Fixed processor fee per charge: $0.30.
pub fn card_fee_fix() -> Money {
    Money::new(RustDecimal::new(30, 2))
}

/// Smallest net amount we will charge a card for.
///
/// Charging less than this wastes too much of the gross on the fixed fee;
/// it works out to a $10.00 minimum gross charge.
pub fn minimum_net_charge() -> Money {
    Money::new(RustDecimal::new(941, 2))
}

/// Gross up a net amount so the processor's cut leaves `net` behind.
///
/// Returns `(gross, fee)` where `gross - fee == net` up to cent rounding;
/// the gross is rounded up to the next cent so we never under-collect.
pub fn upcharge(net: Money) -> (Money, Money) {
    let one = Money::new(RustDecimal::ONE);
    let gross = ((net + card_fee_fix()) / (one - card_fee_var())).ceil_cents();
    (gross, gross - net)
}

/// Clamp a net amount to the minimum, then gross it up.
///
/// Returns `(gross, fee, net)`: `gross` is what the card is hit for, `net`
/// is what lands on the participant's balance.
pub fn prep_charge(requested_net: Money) -> (Money, Money, Money) {
    let net = requested_net.to_cents().max(minimum_net_charge());
    let (gross, fee) = upcharge(net);
    (gross, fee, net)
}
