pub mod cli;
pub mod clone;
pub mod error;
pub mod fstype;
pub mod inspect;
pub mod layered;
pub mod logging;
pub mod planner;
pub mod resize;
pub mod strategy;
pub mod table;
