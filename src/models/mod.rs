pub mod offer;
pub mod position;
pub mod route;
