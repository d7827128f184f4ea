pub mod approval;
pub mod deal;
