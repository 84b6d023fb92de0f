//! Time constants in seconds.

pub const FIVE_MINUTES: u64 = 5 * 60;
pub const ONE_DAY: u64 = 24 * 60 * 60;
pub const SEVEN_DAYS: u64 = 7 * ONE_DAY;
pub const THIRTY_DAYS: u64 = 30 * ONE_DAY;

/// Lifetime of relay subscriptions.
pub const SUBSCRIPTION_TTL: u64 = THIRTY_DAYS;

/// Lifetime of a history record that never received a response.
pub const HISTORY_TTL: u64 = SEVEN_DAYS;
