/// Longest stay a single booking may cover.
pub const MAX_STAY_NIGHTS: i64 = 365;
/// How far ahead of today a stay may start.
pub const MAX_BOOKING_HORIZON_DAYS: i64 = 730;
/// Largest amount accepted for a booking price or a payment.
pub const MAX_AMOUNT: i64 = 10_000_000;
pub const MAX_TRANSACTION_ID_LEN: usize = 128;
/// Bookings kept per room ledger, terminal history included.
pub const MAX_BOOKINGS_PER_ROOM: usize = 100_000;
/// Rows returned by a single list query.
pub const MAX_LIST_ROWS: usize = 10_000;
pub const MAX_SQL_LEN: usize = 16 * 1024;
