pub mod refresher;
