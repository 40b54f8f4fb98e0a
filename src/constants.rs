pub const DEFAULT_SERVER_PORT: u16 = 3000;

// ATTENDANCE TOKENS
pub const TOKEN_BYTES: usize = 32;
pub const TOKEN_TTL_MINUTES: i64 = 10;

// ATTENDANCE WINDOW + AWARD
//
// The window opens this long before the scheduled start and closes this long after the scheduled
// end; it is deliberately independent of the token TTL above.
pub const ATTENDANCE_WINDOW_PADDING_MINUTES: i64 = 30;
pub const ATTENDANCE_POINTS: u32 = 10;

// GEOFENCE
pub const DEFAULT_GEOFENCE_RADIUS_KM: f64 = 1.0;
pub const MIN_GEOFENCE_RADIUS_KM: f64 = 0.1;
pub const MAX_GEOFENCE_RADIUS_KM: f64 = 10.0;

// EVENT INPUT LIMITS
pub const MIN_TITLE_LEN: usize = 5;
pub const MIN_DESCRIPTION_LEN: usize = 20;
pub const MIN_LOCATION_NAME_LEN: usize = 5;
pub const MIN_SUMMARY_LEN: usize = 20;
pub const MAX_SUMMARY_LEN: usize = 500;

// GATEWAY-PROVIDED PRINCIPAL HEADERS
pub const PRINCIPAL_ID_HEADER: &str = "x-principal-id";
pub const PRINCIPAL_ROLE_HEADER: &str = "x-principal-role";
