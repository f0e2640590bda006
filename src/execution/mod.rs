pub mod bridge;
pub mod live;
