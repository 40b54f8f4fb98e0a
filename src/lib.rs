pub mod api;
pub mod attendance;
pub mod constants;
pub mod db;
pub mod event;
pub mod util;
