//! Hard limits enforced at the engine and tenant boundaries.

pub const MAX_PROPERTIES_PER_TENANT: usize = 10_000;
pub const MAX_RESERVATIONS_PER_PROPERTY: usize = 50_000;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_EMAIL_LEN: usize = 320;
pub const MAX_SPECIAL_REQUESTS_LEN: usize = 4_096;

/// Longest stay accepted, in nights.
pub const MAX_STAY_NIGHTS: i64 = 365;
pub const MAX_GUEST_COUNT: u32 = 64;

pub const MIN_VALID_YEAR: i32 = 2000;
pub const MAX_VALID_YEAR: i32 = 2200;

/// Widest window an open-range query may cover, in days.
pub const MAX_QUERY_WINDOW_DAYS: i64 = 3 * 366;

pub const MAX_TENANTS: usize = 1_000;
pub const MAX_TENANT_NAME_LEN: usize = 128;
