pub mod background;
pub mod rate_limit;
