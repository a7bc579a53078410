pub mod spectrum;
pub mod theory;
pub mod song;
pub mod grid;
pub mod detector;
pub mod live;
pub mod offline;
