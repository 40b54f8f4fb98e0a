pub mod attendance;
pub mod event;
pub mod user;

/// Parses one of a fixed set of lowercase tags stored in a `TEXT` column.
pub(crate) fn decode_tag<T>(column: &'static str, raw: &str) -> crate::db::StoreResult<T>
where
    T: core::str::FromStr,
{
    raw.parse::<T>()
        .map_err(|_| crate::db::StoreError::Corrupt(format!("{column} = '{raw}'")))
}
