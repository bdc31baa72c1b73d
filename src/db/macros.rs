//! Backend dispatch macro.
//!
//! Every `DbPool` variant wraps a differently-typed sqlx pool, so code that runs the
//! same SQL against whichever backend is configured has to be expanded once per
//! variant. `with_pool!` does that expansion at compile time.

/// Evaluate `$body` with `$p` bound to the concrete sqlx pool inside a `DbPool`.
///
/// # Example
///
/// ```ignore
/// let rows = with_pool!(&handle.pool, |p| {
///     sqlx::query("SELECT 1").fetch_all(p).await?.len()
/// });
/// ```
#[macro_export]
macro_rules! with_pool {
    ($pool:expr, |$p:ident| $body:expr) => {
        match $pool {
            $crate::db::pool::DbPool::MySql($p) => $body,
            $crate::db::pool::DbPool::Postgres($p) => $body,
            $crate::db::pool::DbPool::SQLite($p) => $body,
        }
    };
}

pub use with_pool;
